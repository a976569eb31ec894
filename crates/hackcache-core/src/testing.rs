//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::api::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::cache::DurableFile;

pub const BASE_URL: &str = "http://mock.test";

#[derive(Clone)]
enum Scripted {
    Response(u16, Vec<u8>),
    Failure(String),
}

/// Scripted transport. Responses are keyed by route (path without base URL
/// or query) and stay in place until replaced. Unscripted routes get a 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Scripted>>,
    requests: Mutex<Vec<HttpRequest>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, route: &str, status: u16, json: Value) {
        self.respond_raw(route, status, json.to_string().into_bytes());
    }

    pub fn respond_raw(&self, route: &str, status: u16, body: Vec<u8>) {
        self.routes
            .lock()
            .unwrap()
            .insert(route.to_string(), Scripted::Response(status, body));
    }

    pub fn fail(&self, route: &str, message: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(route.to_string(), Scripted::Failure(message.to_string()));
    }

    /// Hold every subsequent request open until a permit is added.
    /// Each permit releases one request.
    pub fn hold(&self) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&semaphore));
        semaphore
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests sent to `route`.
    pub fn requests_to(&self, route: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| Self::route_of(&r.url) == route)
            .collect()
    }

    /// Yield until at least `count` requests have been recorded.
    pub async fn wait_for_requests(&self, count: usize) {
        for _ in 0..10_000 {
            if self.requests.lock().unwrap().len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("timed out waiting for {} requests", count);
    }

    fn route_of(url: &str) -> &str {
        let path = url.strip_prefix(BASE_URL).unwrap_or(url);
        path.split('?').next().unwrap_or(path)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let route = Self::route_of(&request.url).to_string();
        self.requests.lock().unwrap().push(request);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        let scripted = self.routes.lock().unwrap().get(&route).cloned();
        match scripted {
            Some(Scripted::Response(status, body)) => Ok(HttpResponse { status, body }),
            Some(Scripted::Failure(message)) => Err(TransportError(message)),
            None => Ok(HttpResponse {
                status: 404,
                body: br#"{"detail": "Not found."}"#.to_vec(),
            }),
        }
    }
}

/// In-memory `DurableFile`.
#[derive(Default)]
pub struct MemoryFile {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryFile {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn put(&self, path: &Path, bytes: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), bytes.to_vec());
    }
}

impl DurableFile for MemoryFile {
    fn read_all(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        Ok(self.contents(path))
    }

    fn write_all(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.put(path, bytes);
        Ok(())
    }
}
