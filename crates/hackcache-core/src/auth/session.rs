use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::{ApiError, HttpRequest, Method, RequestGateway};
use crate::events::{CacheEvent, NotificationBus};

use super::SecretStore;

const LOGIN_ROUTE: &str = "/v1/login/";
const LOGOUT_ROUTE: &str = "/v1/logout/";

/// Non-secret half of a session: who is logged in and what they may do.
/// This is what the snapshot stores; the token never leaves the secret store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "email")]
    pub username: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school: Option<String>,
    #[serde(default)]
    pub can_post_announcements: bool,
    #[serde(default)]
    pub can_edit_announcements: bool,
    #[serde(default)]
    pub can_perform_scan: bool,
}

/// An authenticated session.
#[derive(Clone)]
pub struct Credential {
    pub identity: Identity,
    token: String,
}

impl Credential {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    user: Identity,
}

/// Push registration sent along with a login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRegistration {
    pub device_token: String,
    pub preference: u32,
}

/// Owns the single current session credential.
///
/// `login` and `logout` are serialized against each other. Revocation runs
/// synchronously from the gateway and only takes the credential lock.
pub struct CredentialManager {
    secrets: Arc<dyn SecretStore>,
    bus: NotificationBus,
    current: RwLock<Option<Credential>>,
    transitions: Mutex<()>,
}

impl CredentialManager {
    pub fn new(secrets: Arc<dyn SecretStore>, bus: NotificationBus) -> Self {
        Self {
            secrets,
            bus,
            current: RwLock::new(None),
            transitions: Mutex::new(()),
        }
    }

    pub(crate) fn authorization_value(token: &str) -> String {
        format!("Token {}", token)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<Credential>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Credential>> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_logged_in(&self) -> bool {
        self.read().is_some()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.read().as_ref().map(|c| c.identity.clone())
    }

    pub fn can_post_announcements(&self) -> bool {
        self.read().as_ref().is_some_and(|c| c.identity.can_post_announcements)
    }

    pub fn can_edit_announcements(&self) -> bool {
        self.read().as_ref().is_some_and(|c| c.identity.can_edit_announcements)
    }

    pub fn can_perform_scan(&self) -> bool {
        self.read().as_ref().is_some_and(|c| c.identity.can_perform_scan)
    }

    /// Add the session's authorization header, if there is a session.
    /// Returns the token that was attached.
    pub fn attach_authorization(&self, request: &mut HttpRequest) -> Option<String> {
        let guard = self.read();
        let credential = guard.as_ref()?;
        request.set_header("Authorization", Self::authorization_value(&credential.token));
        Some(credential.token.clone())
    }

    /// Authenticate against the server and install the resulting session.
    ///
    /// Already logged in: returns the current identity without a request.
    /// On failure the existing state is left untouched.
    pub async fn login(
        &self,
        gateway: &RequestGateway,
        username: &str,
        password: &str,
        push: Option<&PushRegistration>,
    ) -> Result<Identity, ApiError> {
        let _transition = self.transitions.lock().await;
        if let Some(identity) = self.identity() {
            debug!(username = %identity.username, "Already logged in");
            return Ok(identity);
        }

        let mut params = vec![
            ("username".to_string(), username.to_string()),
            ("password".to_string(), password.to_string()),
        ];
        if let Some(push) = push {
            params.push(("is_gcm".to_string(), "false".to_string()));
            params.push(("registration_id".to_string(), push.device_token.clone()));
            params.push(("name".to_string(), push.preference.to_string()));
        }

        let json = gateway.execute(LOGIN_ROUTE, Method::Post, &params).await?;
        let response = LoginResponse::deserialize(&json)
            .map_err(|e| ApiError::Decode(format!("Invalid login response: {}", e)))?;

        self.install(&response.token, response.user.clone())
            .map_err(|e| ApiError::SecretStore(e.to_string()))?;
        info!(username = %response.user.username, "Logged in");
        Ok(response.user)
    }

    /// Store `token` for `identity` and make it the current session.
    pub(crate) fn install(&self, token: &str, identity: Identity) -> Result<()> {
        self.secrets.set(&identity.username, token)?;
        *self.write() = Some(Credential {
            identity,
            token: token.to_string(),
        });
        self.bus.publish(CacheEvent::SessionChanged { logged_in: true });
        self.bus.publish(CacheEvent::ProfileUpdated);
        Ok(())
    }

    /// Drop the session and its stored secret, then ask the server to
    /// invalidate the token. The server call is fire-and-forget.
    pub async fn logout(&self, gateway: &RequestGateway) {
        let _transition = self.transitions.lock().await;
        let Some(credential) = self.write().take() else {
            debug!("Logout requested while logged out");
            return;
        };

        if let Err(e) = self.secrets.remove(&credential.identity.username) {
            warn!(error = %e, "Failed to remove stored token");
        }
        info!(username = %credential.identity.username, "Logged out");
        self.bus.publish(CacheEvent::SessionChanged { logged_in: false });

        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway
                .execute_with_token(LOGOUT_ROUTE, Method::Post, &[], credential.token())
                .await
            {
                debug!(error = %e, "Token invalidation failed");
            }
        });
    }

    /// The server rejected a request's authorization: treat as an implicit
    /// logout. Only the credential the request was sent with is cleared, so a
    /// session established while the request was in flight survives.
    pub fn revoke(&self, sent_token: Option<&str>) {
        let revoked = {
            let mut guard = self.write();
            let matches = match (guard.as_ref(), sent_token) {
                (Some(current), Some(sent)) => current.token == sent,
                _ => false,
            };
            if matches {
                guard.take()
            } else {
                None
            }
        };

        if let Some(credential) = revoked {
            warn!(username = %credential.identity.username, "Session revoked by server");
            if let Err(e) = self.secrets.remove(&credential.identity.username) {
                warn!(error = %e, "Failed to remove revoked token");
            }
        }
        self.bus.publish(CacheEvent::SessionChanged {
            logged_in: self.is_logged_in(),
        });
    }

    /// Replace identity and capability flags, keeping the token.
    /// Returns the previous identity, or `None` when logged out.
    pub(crate) fn update_identity(&self, identity: Identity) -> Option<Identity> {
        let previous = {
            let mut guard = self.write();
            let credential = guard.as_mut()?;
            if credential.identity.username != identity.username {
                // Keep the secret keyed by the identity it belongs to
                if let Err(e) = self.secrets.set(&identity.username, &credential.token) {
                    warn!(error = %e, "Failed to re-key stored token");
                } else if let Err(e) = self.secrets.remove(&credential.identity.username) {
                    warn!(error = %e, "Failed to remove stale token entry");
                }
            }
            std::mem::replace(&mut credential.identity, identity)
        };

        if self.identity().as_ref() != Some(&previous) {
            self.bus.publish(CacheEvent::ProfileUpdated);
        }
        Some(previous)
    }

    /// Re-derive the session from snapshot identity plus the stored secret.
    /// A missing secret discards the identity and leaves the session logged out.
    pub fn restore(&self, identity: Option<Identity>) -> bool {
        let Some(identity) = identity else {
            return false;
        };

        let token = match self.secrets.get(&identity.username) {
            Ok(Some(token)) => token,
            Ok(None) => {
                info!(username = %identity.username, "No stored token, starting logged out");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read stored token, starting logged out");
                return false;
            }
        };

        {
            let mut guard = self.write();
            if guard.is_some() {
                debug!("Session already established, ignoring restored identity");
                return false;
            }
            *guard = Some(Credential { identity, token });
        }
        self.bus.publish(CacheEvent::SessionChanged { logged_in: true });
        self.bus.publish(CacheEvent::ProfileUpdated);
        true
    }
}
