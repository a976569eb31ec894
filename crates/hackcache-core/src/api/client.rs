//! Request gateway: one logical request/response exchange per call.
//!
//! Builds requests against the configured base URL, attaches the session's
//! authorization, and classifies the raw transport result into
//! `Ok(json)` or `Err(ApiError)`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::auth::CredentialManager;

use super::transport::{HttpRequest, HttpResponse, Method, Transport};
use super::ApiError;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Process-wide "network busy" indicator.
///
/// Counts gateway calls in flight; UI polls `is_active`.
#[derive(Debug, Clone, Default)]
pub struct NetworkActivity {
    in_flight: Arc<AtomicUsize>,
}

impl NetworkActivity {
    pub fn is_active(&self) -> bool {
        self.in_flight() > 0
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn begin(&self) -> ActivityGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        ActivityGuard(Arc::clone(&self.in_flight))
    }
}

struct ActivityGuard(Arc<AtomicUsize>);

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Gateway to the server API.
/// Clone is cheap: the transport, credentials and activity counter are shared.
#[derive(Clone)]
pub struct RequestGateway {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialManager>,
    base_url: String,
    activity: NetworkActivity,
}

impl RequestGateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialManager>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            credentials,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            activity: NetworkActivity::default(),
        }
    }

    pub fn activity(&self) -> &NetworkActivity {
        &self.activity
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    /// Build the request for `route`. Read methods carry `params` in the query
    /// string, write methods as a form body.
    pub fn build_request(&self, route: &str, method: Method, params: &[(String, String)]) -> HttpRequest {
        let encoded = (!params.is_empty()).then(|| {
            form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish()
        });

        let mut url = format!("{}{}", self.base_url, route);
        let mut request = if method.sends_body() {
            let mut request = HttpRequest::new(method, url);
            if let Some(body) = encoded {
                request.set_header("Content-Type", FORM_CONTENT_TYPE);
                request.body = Some(body.into_bytes());
            }
            request
        } else {
            if let Some(query) = encoded {
                url.push('?');
                url.push_str(&query);
            }
            HttpRequest::new(method, url)
        };
        request.set_header("Accept", "application/json");
        request
    }

    /// Run one exchange with the current session's authorization.
    ///
    /// A 401/403 revokes the credential the request was sent with.
    pub async fn execute(
        &self,
        route: &str,
        method: Method,
        params: &[(String, String)],
    ) -> Result<Value, ApiError> {
        let mut request = self.build_request(route, method, params);
        let sent_token = self.credentials.attach_authorization(&mut request);
        self.exchange(request, Some(sent_token)).await
    }

    /// Run one exchange authorized with an explicit token, outside the
    /// session. Auth failures here never touch the current credential.
    pub(crate) async fn execute_with_token(
        &self,
        route: &str,
        method: Method,
        params: &[(String, String)],
        token: &str,
    ) -> Result<Value, ApiError> {
        let mut request = self.build_request(route, method, params);
        request.set_header("Authorization", CredentialManager::authorization_value(token));
        self.exchange(request, None).await
    }

    /// `revoke` is `Some(token_sent)` when auth failures should revoke the session.
    async fn exchange(&self, request: HttpRequest, revoke: Option<Option<String>>) -> Result<Value, ApiError> {
        let method = request.method;
        let url = request.url.clone();
        debug!(%method, url = %url, "Sending request");

        let response = {
            let _busy = self.activity.begin();
            self.transport.send(request).await
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(%method, url = %url, error = %e, "Request failed");
                return Err(ApiError::Network(e.0));
            }
        };

        if matches!(response.status, 401 | 403) {
            let was_logged_in = self.credentials.is_logged_in();
            warn!(%method, url = %url, status = response.status, "Request was not authorized");
            if let Some(sent_token) = revoke {
                self.credentials.revoke(sent_token.as_deref());
            }
            return Err(if was_logged_in {
                ApiError::PermissionDenied
            } else {
                ApiError::AuthenticationRequired
            });
        }

        Self::classify(method, response)
    }

    fn classify(method: Method, response: HttpResponse) -> Result<Value, ApiError> {
        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.body));
        }
        if method == Method::Delete {
            return Ok(Value::Object(Map::new()));
        }
        match serde_json::from_slice::<Value>(&response.body) {
            Ok(json @ Value::Object(_)) => Ok(json),
            Ok(_) => Err(ApiError::Decode("expected a JSON object".to_string())),
            Err(e) => Err(ApiError::Decode(e.to_string())),
        }
    }
}
