//! The sync service: one instance per process, shared by handle.
//!
//! Owns every resident resource, the refresh gate, the credential manager
//! and the snapshot store, and exposes the refresh, write and session
//! operations the UI layer calls.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use base64::Engine;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiError, Method, NetworkActivity, ReqwestTransport, RequestGateway, Transport};
use crate::auth::{CredentialManager, Identity, KeyringSecretStore, PushRegistration, SecretStore};
use crate::cache::{
    Collection, DurableFile, FsDurableFile, MergeOutcome, Resident, ResidentStore, Snapshot, SnapshotStore,
};
use crate::config::Config;
use crate::events::{CacheEvent, NotificationBus};
use crate::models::{Announcement, Countdown, Event, Floor, Location, ScanEvent, ScanResult, ScannedDataField};
use crate::sync::{RefreshCallback, RefreshError, RefreshGate, ResourceKind};

const PERFORM_SCAN_ROUTE: &str = "/v1/perform_scan/";
const APPLE_PASS_ROUTE: &str = "/v1/apple_pass/";
const PUSH_ROUTE: &str = "/v1/push_notifications/apns/";

/// How an announcement write reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
}

pub struct SyncService {
    config: RwLock<Config>,
    config_file: Option<PathBuf>,
    files: Arc<dyn DurableFile>,
    gateway: RequestGateway,
    bus: NotificationBus,
    gate: RefreshGate,
    snapshots: SnapshotStore,
    restored: AtomicBool,

    announcements: Resident<Collection<Announcement>>,
    countdown: Resident<Countdown>,
    events: Resident<Collection<Event>>,
    locations: Resident<Collection<Location>>,
    map: Resident<Collection<Floor>>,
    scan_events: Resident<Collection<ScanEvent>>,
}

impl SyncService {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        secrets: Arc<dyn SecretStore>,
        files: Arc<dyn DurableFile>,
    ) -> Result<Arc<Self>> {
        let cache_dir = config.cache_dir()?;
        let bus = NotificationBus::default();
        let credentials = Arc::new(CredentialManager::new(secrets, bus.clone()));
        let gateway = RequestGateway::new(transport, credentials, config.base_url.clone());

        Ok(Arc::new(Self {
            gateway,
            bus,
            gate: RefreshGate::new(),
            snapshots: SnapshotStore::new(Arc::clone(&files), &cache_dir),
            config_file: Config::config_path().ok(),
            files,
            restored: AtomicBool::new(false),
            announcements: Resident::default(),
            countdown: Resident::default(),
            events: Resident::default(),
            locations: Resident::default(),
            map: Resident::default(),
            scan_events: Resident::default(),
            config: RwLock::new(config),
        }))
    }

    /// Production wiring: reqwest transport, OS keychain, local filesystem.
    pub fn from_config(config: Config) -> Result<Arc<Self>> {
        let transport = ReqwestTransport::new(config.request_timeout())?;
        Self::new(
            config,
            Arc::new(transport),
            Arc::new(KeyringSecretStore::default()),
            Arc::new(FsDurableFile),
        )
    }

    pub fn config(&self) -> Config {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Write the current config to its usual location. Failures are logged.
    fn persist_config(&self) -> bool {
        let Some(path) = self.config_file.as_deref() else {
            warn!("No config directory, settings not saved");
            return false;
        };
        match self.config().save_to(self.files.as_ref(), path) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to save config");
                false
            }
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        self.gateway.credentials()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.credentials().identity()
    }

    pub fn activity(&self) -> &NetworkActivity {
        self.gateway.activity()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.bus.subscribe()
    }

    pub fn snapshot_path(&self) -> &Path {
        self.snapshots.path()
    }

    pub fn announcements(&self) -> Arc<Collection<Announcement>> {
        self.announcements.load()
    }

    pub fn countdown(&self) -> Arc<Countdown> {
        self.countdown.load()
    }

    pub fn events(&self) -> Arc<Collection<Event>> {
        self.events.load()
    }

    pub fn locations(&self) -> Arc<Collection<Location>> {
        self.locations.load()
    }

    pub fn map(&self) -> Arc<Collection<Floor>> {
        self.map.load()
    }

    pub fn scan_events(&self) -> Arc<Collection<ScanEvent>> {
        self.scan_events.load()
    }

    /// Serialized form of a cached resource, as stored in the snapshot.
    pub fn serialized(&self, kind: ResourceKind) -> Option<Value> {
        self.store(kind).map(|store| store.to_serialized())
    }

    fn store(&self, kind: ResourceKind) -> Option<&dyn ResidentStore> {
        match kind {
            ResourceKind::Announcements => Some(&self.announcements),
            ResourceKind::Countdown => Some(&self.countdown),
            ResourceKind::Events => Some(&self.events),
            ResourceKind::Locations => Some(&self.locations),
            ResourceKind::Map => Some(&self.map),
            ResourceKind::ScanEvents => Some(&self.scan_events),
            ResourceKind::Profile => None,
        }
    }

    // Refresh

    /// Ask for `kind` to be refreshed. Returns immediately; `callback`, if
    /// any, later receives the outcome of the fetch it was coalesced onto.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request_refresh(self: &Arc<Self>, kind: ResourceKind, callback: Option<RefreshCallback>) {
        if self.gate.enqueue(kind, callback) {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_refresh(kind).await });
        }
    }

    /// Refresh `kind` and wait for the shared outcome.
    pub async fn refresh(self: &Arc<Self>, kind: ResourceKind) -> bool {
        let (tx, rx) = oneshot::channel();
        self.request_refresh(
            kind,
            Some(Box::new(move |ok| {
                let _ = tx.send(ok);
            })),
        );
        rx.await.unwrap_or(false)
    }

    /// Refresh every resource concurrently. Profile is included only while
    /// logged in.
    pub async fn refresh_all(self: &Arc<Self>) -> Vec<(ResourceKind, bool)> {
        let kinds: Vec<ResourceKind> = ResourceKind::ALL
            .into_iter()
            .filter(|kind| *kind != ResourceKind::Profile || self.credentials().is_logged_in())
            .collect();
        let outcomes = join_all(kinds.iter().map(|kind| self.refresh(*kind))).await;
        kinds.into_iter().zip(outcomes).collect()
    }

    async fn run_refresh(self: Arc<Self>, kind: ResourceKind) {
        let result = self.fetch_and_merge(kind).await;

        let ok = result.is_ok();
        let delivered = self.gate.complete(kind, ok);
        debug!(resource = %kind, ok, delivered, "Refresh finished");

        match result {
            Ok(summary) if summary.changed() => {
                info!(
                    resource = %kind,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    removed = summary.removed,
                    "Resource updated"
                );
                self.bus.publish(CacheEvent::ResourceUpdated { resource: kind, summary });
            }
            Ok(_) => {}
            Err(RefreshError::NotLoggedIn) => {
                debug!(resource = %kind, "Skipped refresh while logged out");
            }
            Err(e) => {
                warn!(resource = %kind, error = %e, "Refresh failed");
                self.bus.publish(CacheEvent::Failure {
                    resource: Some(kind),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Runs with the gate slot for `kind` held.
    async fn fetch_and_merge(self: &Arc<Self>, kind: ResourceKind) -> Result<MergeOutcome, RefreshError> {
        if let Some(dependency) = kind.depends_on() {
            if !self.refresh(dependency).await {
                return Err(RefreshError::Dependency(dependency));
            }
        }

        let Some(store) = self.store(kind) else {
            return self.fetch_profile().await;
        };

        loop {
            if self.gate.take_invalidation(kind) {
                self.publish_invalidation(kind, store.invalidate());
            }

            let since = store.since();
            let params: Vec<(String, String)> = since
                .map(|mark| vec![("since".to_string(), mark.to_string())])
                .unwrap_or_default();
            let payload = self.gateway.execute(kind.route(), Method::Get, &params).await?;

            // Invalidated while in flight: the payload predates the change
            if self.gate.take_invalidation(kind) {
                debug!(resource = %kind, "Discarding response fetched before invalidation");
                self.publish_invalidation(kind, store.invalidate());
                continue;
            }

            return store.merge(&payload, since.is_none()).map_err(RefreshError::from);
        }
    }

    /// Announce an emptied resource right away; the refetch may still fail.
    fn publish_invalidation(&self, kind: ResourceKind, summary: MergeOutcome) {
        if summary.changed() {
            info!(resource = %kind, removed = summary.removed, "Resource invalidated");
            self.bus.publish(CacheEvent::ResourceUpdated { resource: kind, summary });
        }
    }

    async fn fetch_profile(self: &Arc<Self>) -> Result<MergeOutcome, RefreshError> {
        if !self.credentials().is_logged_in() {
            return Err(RefreshError::NotLoggedIn);
        }

        let json = self
            .gateway
            .execute(ResourceKind::Profile.route(), Method::Get, &[])
            .await?;
        let identity = Identity::deserialize(&json).map_err(|e| ApiError::Decode(e.to_string()))?;

        let Some(previous) = self.credentials().update_identity(identity.clone()) else {
            return Err(RefreshError::NotLoggedIn);
        };

        if previous.can_edit_announcements != identity.can_edit_announcements {
            info!(
                can_edit = identity.can_edit_announcements,
                "Announcement permissions changed, refetching announcements"
            );
            self.gate.mark_invalid(ResourceKind::Announcements);
            self.request_refresh(ResourceKind::Announcements, None);
        }

        Ok(if previous == identity {
            MergeOutcome::default()
        } else {
            MergeOutcome::replaced()
        })
    }

    /// Hand callbacks that queued behind a restore to a real fetch.
    fn requeue(self: &Arc<Self>, kind: ResourceKind, callbacks: Vec<RefreshCallback>) {
        for callback in callbacks {
            self.request_refresh(kind, Some(callback));
        }
    }

    // Announcement writes

    /// Create or update an announcement. The local collection is not edited;
    /// a refresh picks up the server's copy.
    pub async fn save_announcement(
        self: &Arc<Self>,
        announcement: &Announcement,
        op: WriteOp,
    ) -> Result<(), ApiError> {
        let base = ResourceKind::Announcements.route();
        let (route, method) = match op {
            WriteOp::Create => (base.to_string(), Method::Post),
            WriteOp::Update => (format!("{}{}", base, announcement.id), Method::Put),
        };
        let result = self.gateway.execute(&route, method, &announcement.to_form()).await;
        self.after_announcement_write(result.map(|_| ()))
    }

    pub async fn delete_announcement(self: &Arc<Self>, announcement: &Announcement) -> Result<(), ApiError> {
        let route = format!("{}{}", ResourceKind::Announcements.route(), announcement.id);
        let result = self.gateway.execute(&route, Method::Delete, &[]).await;
        self.after_announcement_write(result.map(|_| ()))
    }

    fn after_announcement_write(self: &Arc<Self>, result: Result<(), ApiError>) -> Result<(), ApiError> {
        match result {
            Ok(()) => {
                self.request_refresh(ResourceKind::Announcements, None);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Announcement write failed");
                self.publish_failure(Some(ResourceKind::Announcements), &e);
                Err(e)
            }
        }
    }

    fn publish_failure(&self, resource: Option<ResourceKind>, error: &ApiError) {
        self.bus.publish(CacheEvent::Failure {
            resource,
            message: error.to_string(),
        });
    }

    // Scanning, pass and push

    /// Scan `user_data` into `scan_event`. With `peek` the server only
    /// reports what the scan would do.
    pub async fn perform_scan(&self, user_data: &str, scan_event: &str, peek: bool) -> Result<ScanResult, ApiError> {
        let params = vec![
            ("user_id".to_string(), user_data.to_string()),
            ("scan_event".to_string(), scan_event.to_string()),
        ];
        let method = if peek { Method::Get } else { Method::Post };
        let json = match self.gateway.execute(PERFORM_SCAN_ROUTE, method, &params).await {
            Ok(json) => json,
            Err(e) => {
                self.publish_failure(None, &e);
                return Err(e);
            }
        };

        let scanned = json.get("scanned").and_then(Value::as_bool).unwrap_or(false);
        let Some(data) = json.get("data").and_then(Value::as_array).filter(|_| scanned) else {
            return Ok(ScanResult::default());
        };
        let fields = data
            .iter()
            .filter_map(|field| ScannedDataField::deserialize(field).ok())
            .collect();
        Ok(ScanResult { scanned, fields })
    }

    /// Raw bytes of the attendee's pass.
    pub async fn fetch_pass(&self) -> Result<Vec<u8>, ApiError> {
        if !self.credentials().is_logged_in() {
            return Err(ApiError::NotLoggedIn);
        }
        let json = self.gateway.execute(APPLE_PASS_ROUTE, Method::Get, &[]).await?;
        let invalid = || ApiError::Decode("Invalid pass downloaded. Try again".to_string());

        let encoded: String = json
            .get("apple_pass")
            .and_then(Value::as_str)
            .ok_or_else(invalid)?
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
            .collect();
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| invalid())
    }

    fn push_registration(&self, preference: Option<u32>) -> Option<PushRegistration> {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        let device_token = config.push_device_token.clone()?;
        Some(PushRegistration {
            device_token,
            preference: preference.unwrap_or_else(|| config.push_preference()),
        })
    }

    /// Register the stored device token with `preference` (or the saved
    /// one). Returns the preference the server confirmed.
    pub async fn update_push_token(&self, preference: Option<u32>) -> Result<u32, ApiError> {
        let registration = self
            .push_registration(preference)
            .ok_or(ApiError::MissingDeviceToken)?;
        let params = vec![
            ("registration_id".to_string(), registration.device_token.clone()),
            ("name".to_string(), registration.preference.to_string()),
        ];

        let result = self
            .gateway
            .execute(PUSH_ROUTE, Method::Post, &params)
            .await
            .and_then(|json| Self::confirmed_preference(&json, &registration.device_token));
        match result {
            Ok(confirmed) => {
                self.config
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_preference = Some(confirmed);
                self.persist_config();
                info!(preference = confirmed, "Push registration updated");
                Ok(confirmed)
            }
            Err(e) => {
                self.publish_failure(None, &e);
                Err(e)
            }
        }
    }

    fn confirmed_preference(json: &Value, device_token: &str) -> Result<u32, ApiError> {
        let unconfirmed = || ApiError::Decode("Push registration was not confirmed".to_string());
        if json.get("registration_id").and_then(Value::as_str) != Some(device_token) {
            return Err(unconfirmed());
        }
        match json.get("name") {
            Some(Value::String(s)) => s.parse().map_err(|_| unconfirmed()),
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(unconfirmed),
            _ => Err(unconfirmed()),
        }
    }

    // Session

    pub async fn login(self: &Arc<Self>, username: &str, password: &str) -> Result<Identity, ApiError> {
        let push = self.push_registration(None);
        let identity = self
            .credentials()
            .login(&self.gateway, username, password, push.as_ref())
            .await?;

        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_username = Some(identity.username.clone());
        self.persist_config();
        self.persist().await;
        Ok(identity)
    }

    pub async fn logout(self: &Arc<Self>) {
        self.credentials().logout(&self.gateway).await;
        self.persist().await;
    }

    // Snapshot

    fn build_snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.credential = self.identity();
        for kind in ResourceKind::CACHED {
            if let Some(store) = self.store(kind) {
                snapshot.set_resource(kind, store.to_serialized());
            }
        }
        snapshot
    }

    /// Write the whole cache to disk. Blocking; failures are logged only.
    pub fn save_snapshot(&self) -> bool {
        self.snapshots.save(&self.build_snapshot())
    }

    /// `save_snapshot` on the blocking pool.
    pub fn save_snapshot_in_background(self: &Arc<Self>) -> JoinHandle<bool> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.save_snapshot())
    }

    async fn persist(self: &Arc<Self>) -> bool {
        self.save_snapshot_in_background().await.unwrap_or_else(|e| {
            warn!(error = %e, "Snapshot task failed");
            false
        })
    }

    /// Saved snapshot as currently on disk, if readable.
    pub fn load_snapshot(&self) -> Option<Snapshot> {
        self.snapshots.load()
    }

    /// Spawn the one-time restore.
    pub fn start(self: &Arc<Self>) -> JoinHandle<bool> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.restore().await })
    }

    /// Load the snapshot into the empty resident resources and re-derive the
    /// session. Runs once per service; later calls return `false`.
    ///
    /// Each resource is merged with its gate slot held, exactly like a fetch.
    /// A resource that is fetching, or that a fetch has already merged into,
    /// is skipped.
    pub async fn restore(self: &Arc<Self>) -> bool {
        if self.restored.swap(true, Ordering::SeqCst) {
            debug!("Restore already ran");
            return false;
        }

        let this = Arc::clone(self);
        let snapshot = match tokio::task::spawn_blocking(move || this.snapshots.load()).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Snapshot load task failed");
                return false;
            }
        };

        for kind in ResourceKind::CACHED {
            let (Some(value), Some(store)) = (snapshot.resource(kind), self.store(kind)) else {
                continue;
            };
            if !self.gate.enqueue(kind, None) {
                debug!(resource = %kind, "Live refresh in flight, skipping restore");
                continue;
            }

            if store.is_populated() {
                debug!(resource = %kind, "Already refreshed, skipping restore");
            } else {
                match store.merge(value, true) {
                    Ok(summary) if summary.changed() => {
                        self.bus.publish(CacheEvent::ResourceUpdated { resource: kind, summary });
                    }
                    Ok(_) => {}
                    Err(e) => warn!(resource = %kind, error = %e, "Ignoring unreadable snapshot field"),
                }
            }

            let waiting = self.gate.finish(kind);
            self.requeue(kind, waiting);
        }

        let saved = snapshot.age_display();
        let logged_in = self.credentials().restore(snapshot.credential);
        info!(logged_in, saved = %saved, "Cache restored");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemorySecretStore;
    use crate::models::Category;
    use crate::testing::{MemoryFile, MockTransport, BASE_URL};
    use chrono::DateTime;
    use serde_json::json;
    use std::path::PathBuf;

    struct Fixture {
        transport: Arc<MockTransport>,
        secrets: Arc<MemorySecretStore>,
        files: Arc<MemoryFile>,
        service: Arc<SyncService>,
    }

    fn config() -> Config {
        Config {
            base_url: BASE_URL.to_string(),
            cache_dir: Some(PathBuf::from("/cache")),
            ..Config::default()
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemorySecretStore::default()), Arc::new(MemoryFile::default()))
    }

    fn fixture_with(secrets: Arc<MemorySecretStore>, files: Arc<MemoryFile>) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let service =
            SyncService::new(config(), transport.clone(), secrets.clone(), files.clone()).expect("service");
        Fixture {
            transport,
            secrets,
            files,
            service,
        }
    }

    fn identity(can_edit: bool) -> Identity {
        Identity {
            username: "ada@example.com".to_string(),
            name: "Ada".to_string(),
            school: None,
            can_post_announcements: can_edit,
            can_edit_announcements: can_edit,
            can_perform_scan: true,
        }
    }

    fn locations() -> Value {
        json!({"locations": [
            {"id": "l1", "name": "Atrium", "latitude": 42.29, "longitude": -83.71, "updated_at": 5},
            {"id": "l2", "name": "Hall", "latitude": 42.30, "longitude": -83.72, "updated_at": 7}
        ]})
    }

    fn events() -> Value {
        json!({"events": [{
            "id": "e1", "name": "Opening", "category": "General", "location": "l1",
            "startDate": 1_000, "endDate": 2_000, "updated_at": 3
        }]})
    }

    fn announcements() -> Value {
        json!({"announcements": [
            {"id": "a1", "name": "Dinner", "info": "Pizza", "broadcast_time": 1_000, "category": 4, "updated_at": 2}
        ]})
    }

    fn drain(rx: &mut broadcast::Receiver<CacheEvent>) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn settle() {
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_request() {
        let f = fixture();
        f.transport.respond("/v1/locations/", 200, locations());

        let mut receivers = Vec::new();
        for _ in 0..5 {
            let (tx, rx) = oneshot::channel();
            f.service.request_refresh(
                ResourceKind::Locations,
                Some(Box::new(move |ok| {
                    let _ = tx.send(ok);
                })),
            );
            receivers.push(rx);
        }
        assert_eq!(f.service.gate.pending(ResourceKind::Locations), 5);

        for rx in receivers {
            assert_eq!(rx.await, Ok(true));
        }
        assert_eq!(f.transport.requests_to("/v1/locations/").len(), 1);
        assert_eq!(f.service.locations().len(), 2);
    }

    #[tokio::test]
    async fn test_awaiting_callers_coalesce_and_late_caller_fetches_again() {
        let f = fixture();
        f.transport.respond("/v1/map/", 200, json!({"floors": []}));

        let outcomes = join_all((0..4).map(|_| f.service.refresh(ResourceKind::Map))).await;
        assert_eq!(outcomes, [true; 4]);
        assert_eq!(f.transport.requests_to("/v1/map/").len(), 1);

        assert!(f.service.refresh(ResourceKind::Map).await);
        assert_eq!(f.transport.requests_to("/v1/map/").len(), 2);
    }

    #[tokio::test]
    async fn test_caller_during_fetch_is_queued_not_started() {
        let f = fixture();
        let hold = f.transport.hold();
        f.transport.respond("/v1/scan_events/", 200, json!({"scan_events": [{"id": "s1", "name": "Lunch"}]}));

        let first = {
            let service = Arc::clone(&f.service);
            tokio::spawn(async move { service.refresh(ResourceKind::ScanEvents).await })
        };
        f.transport.wait_for_requests(1).await;
        let second = {
            let service = Arc::clone(&f.service);
            tokio::spawn(async move { service.refresh(ResourceKind::ScanEvents).await })
        };
        settle().await;
        assert_eq!(f.service.gate.pending(ResourceKind::ScanEvents), 2);

        hold.add_permits(1);
        assert!(first.await.expect("join"));
        assert!(second.await.expect("join"));
        assert_eq!(f.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_incremental_refresh_uses_high_water_mark() {
        let f = fixture();
        let mut rx = f.service.subscribe();
        f.transport.respond(
            "/v1/scan_events/",
            200,
            json!({"scan_events": [
                {"id": "a", "name": "Breakfast", "updated_at": 5},
                {"id": "b", "name": "Lunch", "updated_at": 7}
            ]}),
        );
        assert!(f.service.refresh(ResourceKind::ScanEvents).await);
        assert_eq!(f.service.scan_events().high_water_mark(), Some(7));

        f.transport.respond(
            "/v1/scan_events/",
            200,
            json!({"scan_events": [{"id": "a", "updated_at": 9, "deleted": true}]}),
        );
        assert!(f.service.refresh(ResourceKind::ScanEvents).await);

        let requests = f.transport.requests_to("/v1/scan_events/");
        assert!(!requests[0].url.contains("since"));
        assert!(requests[1].url.ends_with("?since=7"));

        let scan_events = f.service.scan_events();
        assert_eq!(scan_events.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), ["b"]);
        assert_eq!(scan_events.high_water_mark(), Some(9));

        let summaries: Vec<MergeOutcome> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                CacheEvent::ResourceUpdated { summary, .. } => Some(summary),
                _ => None,
            })
            .collect();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].inserted, 2);
        assert_eq!(summaries[1].removed, 1);
    }

    #[tokio::test]
    async fn test_unchanged_refresh_publishes_nothing() {
        let f = fixture();
        f.transport.respond("/v1/locations/", 200, locations());
        assert!(f.service.refresh(ResourceKind::Locations).await);

        let mut rx = f.service.subscribe();
        assert!(f.service.refresh(ResourceKind::Locations).await);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_events_wait_for_locations() {
        let f = fixture();
        f.transport.fail("/v1/locations/", "offline");
        f.transport.respond("/v1/events/", 200, events());

        assert!(!f.service.refresh(ResourceKind::Events).await);
        assert!(f.transport.requests_to("/v1/events/").is_empty());

        f.transport.respond("/v1/locations/", 200, locations());
        assert!(f.service.refresh(ResourceKind::Events).await);

        let urls: Vec<String> = f.transport.requests().into_iter().map(|r| r.url).collect();
        let last_two = &urls[urls.len() - 2..];
        assert!(last_two[0].contains("/v1/locations/"));
        assert!(last_two[1].contains("/v1/events/"));

        let events = f.service.events();
        let locations = f.service.locations();
        assert_eq!(
            events.as_slice()[0].location(&locations).map(|l| l.name.as_str()),
            Some("Atrium")
        );
    }

    #[tokio::test]
    async fn test_undecodable_full_fetch_fails_and_keeps_state() {
        let f = fixture();
        let mut rx = f.service.subscribe();
        f.transport.respond(
            "/v1/announcements/",
            200,
            json!({"announcements": [{"id": "x"}, {"name": "no id"}]}),
        );

        assert!(!f.service.refresh(ResourceKind::Announcements).await);
        assert!(f.service.announcements().is_empty());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [CacheEvent::Failure { resource: Some(ResourceKind::Announcements), .. }]
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_refresh_logs_out() {
        let f = fixture();
        f.service
            .credentials()
            .install("t0ken", identity(false))
            .expect("install");
        let mut rx = f.service.subscribe();
        f.transport.respond("/v1/announcements/", 401, json!({"detail": "Invalid token."}));

        assert!(!f.service.refresh(ResourceKind::Announcements).await);
        assert!(!f.service.credentials().is_logged_in());
        assert_eq!(f.secrets.get("ada@example.com").expect("get"), None);

        let events = drain(&mut rx);
        assert!(events.contains(&CacheEvent::SessionChanged { logged_in: false }));
        assert!(events.contains(&CacheEvent::Failure {
            resource: Some(ResourceKind::Announcements),
            message: "Permission denied!".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_profile_refresh_requires_session() {
        let f = fixture();
        assert!(!f.service.refresh(ResourceKind::Profile).await);
        assert!(f.transport.requests().is_empty());
        assert_eq!(f.service.refresh_all().await.len(), ResourceKind::CACHED.len());
    }

    #[tokio::test]
    async fn test_permission_change_refetches_announcements_in_full() {
        let f = fixture();
        f.service
            .credentials()
            .install("t0ken", identity(false))
            .expect("install");
        f.transport.respond("/v1/announcements/", 200, announcements());
        assert!(f.service.refresh(ResourceKind::Announcements).await);
        assert_eq!(f.service.announcements().high_water_mark(), Some(2));

        f.transport.respond(
            "/v1/profile/",
            200,
            json!({"email": "ada@example.com", "name": "Ada", "can_edit_announcements": true, "can_post_announcements": true, "can_perform_scan": true}),
        );
        assert!(f.service.refresh(ResourceKind::Profile).await);
        assert!(f.service.credentials().can_edit_announcements());

        f.transport.wait_for_requests(3).await;
        settle().await;
        let requests = f.transport.requests_to("/v1/announcements/");
        assert_eq!(requests.len(), 2);
        assert!(!requests[1].url.contains("since"));
        assert_eq!(f.service.announcements().len(), 1);
        assert!(!f.service.gate.is_fetching(ResourceKind::Announcements));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_in_fresh_service() {
        let f = fixture();
        f.service
            .credentials()
            .install("t0ken", identity(true))
            .expect("install");
        f.transport.respond("/v1/locations/", 200, locations());
        f.transport.respond("/v1/events/", 200, events());
        f.transport.respond("/v1/announcements/", 200, announcements());
        f.transport.respond(
            "/v1/configuration/",
            200,
            json!({"configuration": {"start_date": 1_000, "end_date": 9_000}}),
        );
        for kind in [ResourceKind::Events, ResourceKind::Announcements, ResourceKind::Countdown] {
            assert!(f.service.refresh(kind).await);
        }
        assert!(f.service.save_snapshot());

        let fresh = fixture_with(f.secrets.clone(), f.files.clone());
        assert!(fresh.service.start().await.expect("join"));
        for kind in ResourceKind::CACHED {
            assert_eq!(fresh.service.serialized(kind), f.service.serialized(kind), "{}", kind);
        }
        assert_eq!(fresh.service.identity(), Some(identity(true)));
        assert!(fresh.transport.requests().is_empty());

        // Restore only runs once
        assert!(!fresh.service.restore().await);

        // The next refresh is incremental
        fresh.transport.respond("/v1/announcements/", 200, json!({"announcements": []}));
        assert!(fresh.service.refresh(ResourceKind::Announcements).await);
        assert!(fresh.transport.requests()[0].url.ends_with("?since=2"));
        assert_eq!(
            fresh.transport.requests()[0].header("Authorization"),
            Some("Token t0ken")
        );
    }

    #[tokio::test]
    async fn test_restore_without_secret_starts_logged_out() {
        let f = fixture();
        f.service
            .credentials()
            .install("t0ken", identity(false))
            .expect("install");
        assert!(f.service.save_snapshot());

        let fresh = fixture_with(Arc::new(MemorySecretStore::default()), f.files.clone());
        assert!(fresh.service.restore().await);
        assert!(!fresh.service.credentials().is_logged_in());
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_snapshot_is_no_cache() {
        let f = fixture();
        assert!(!f.service.restore().await);

        let g = fixture();
        g.files.put(g.service.snapshot_path(), b"\x00garbage");
        assert!(!g.service.restore().await);
        assert!(g.service.events().is_empty());
    }

    #[tokio::test]
    async fn test_restore_skips_resource_being_fetched() {
        let f = fixture();
        f.transport.respond("/v1/locations/", 200, locations());
        f.transport.respond("/v1/map/", 200, json!({"floors": [{"id": "f1", "name": "Ground", "level": 0, "image_url": "https://mhacks.org/f1.png"}]}));
        assert!(f.service.refresh(ResourceKind::Locations).await);
        assert!(f.service.refresh(ResourceKind::Map).await);
        assert!(f.service.save_snapshot());

        let fresh = fixture_with(f.secrets.clone(), f.files.clone());
        let hold = fresh.transport.hold();
        fresh.transport.respond(
            "/v1/locations/",
            200,
            json!({"locations": [{"id": "l9", "name": "Tent", "latitude": 0.0, "longitude": 0.0}]}),
        );
        let pending = {
            let service = Arc::clone(&fresh.service);
            tokio::spawn(async move { service.refresh(ResourceKind::Locations).await })
        };
        fresh.transport.wait_for_requests(1).await;

        assert!(fresh.service.restore().await);
        assert_eq!(fresh.service.map().len(), 1);

        hold.add_permits(1);
        assert!(pending.await.expect("join"));
        let ids: Vec<String> = fresh.service.locations().iter().map(|l| l.id.clone()).collect();
        assert_eq!(ids, ["l9"]);
    }

    #[tokio::test]
    async fn test_restore_keeps_data_from_finished_refresh() {
        let f = fixture();
        f.transport.respond(
            "/v1/scan_events/",
            200,
            json!({"scan_events": [{"id": "s1", "name": "Old", "updated_at": 5}]}),
        );
        assert!(f.service.refresh(ResourceKind::ScanEvents).await);
        f.transport.respond("/v1/map/", 200, json!({"floors": [{"id": "f1", "name": "Ground", "level": 0, "image_url": "https://mhacks.org/f1.png"}]}));
        assert!(f.service.refresh(ResourceKind::Map).await);
        assert!(f.service.save_snapshot());

        let fresh = fixture_with(f.secrets.clone(), f.files.clone());
        fresh.transport.respond(
            "/v1/scan_events/",
            200,
            json!({"scan_events": [{"id": "s1", "name": "New", "updated_at": 9}]}),
        );
        assert!(fresh.service.refresh(ResourceKind::ScanEvents).await);
        assert!(fresh.service.restore().await);

        let scan_events = fresh.service.scan_events();
        let names: Vec<&str> = scan_events.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["New"]);
        assert_eq!(scan_events.high_water_mark(), Some(9));
        // Resources nobody fetched still come from the snapshot
        assert_eq!(fresh.service.map().len(), 1);
    }

    #[tokio::test]
    async fn test_invalidation_is_announced_when_refetch_fails() {
        let f = fixture();
        f.service
            .credentials()
            .install("t0ken", identity(false))
            .expect("install");
        f.transport.respond("/v1/announcements/", 200, announcements());
        assert!(f.service.refresh(ResourceKind::Announcements).await);

        f.transport.fail("/v1/announcements/", "offline");
        f.transport.respond(
            "/v1/profile/",
            200,
            json!({"email": "ada@example.com", "name": "Ada", "can_edit_announcements": true, "can_post_announcements": true, "can_perform_scan": true}),
        );
        let mut rx = f.service.subscribe();
        assert!(f.service.refresh(ResourceKind::Profile).await);
        f.transport.wait_for_requests(3).await;
        settle().await;

        assert!(f.service.announcements().is_empty());
        assert!(!f.service.gate.is_fetching(ResourceKind::Announcements));
        let events = drain(&mut rx);
        assert!(events.contains(&CacheEvent::ResourceUpdated {
            resource: ResourceKind::Announcements,
            summary: MergeOutcome {
                removed: 1,
                ..MergeOutcome::default()
            },
        }));
        assert!(events.iter().any(|e| matches!(
            e,
            CacheEvent::Failure { resource: Some(ResourceKind::Announcements), .. }
        )));
    }

    #[tokio::test]
    async fn test_announcement_writes() {
        let f = fixture();
        f.service
            .credentials()
            .install("t0ken", identity(true))
            .expect("install");
        f.transport.respond("/v1/announcements/", 200, announcements());
        f.transport.respond("/v1/announcements/a1", 200, json!({}));

        let announcement = Announcement {
            id: "a1".to_string(),
            title: "Dinner".to_string(),
            message: "Tacos instead".to_string(),
            broadcast_at: DateTime::from_timestamp_millis(1_000).expect("timestamp"),
            category: Category::FOOD,
            approved: true,
            updated_at: None,
        };
        f.service
            .save_announcement(&announcement, WriteOp::Update)
            .await
            .expect("update");
        f.transport.wait_for_requests(2).await;

        let requests = f.transport.requests();
        assert_eq!(requests[0].method, Method::Put);
        assert!(requests[0].url.ends_with("/v1/announcements/a1"));
        assert_eq!(requests[1].method, Method::Get);
        assert!(requests[1].url.contains("/v1/announcements/"));

        settle().await;
        f.service.delete_announcement(&announcement).await.expect("delete");
        let delete = f.transport.requests().into_iter().find(|r| r.method == Method::Delete);
        assert!(delete.is_some());
    }

    #[tokio::test]
    async fn test_failed_write_reports_and_does_not_refresh() {
        let f = fixture();
        let mut rx = f.service.subscribe();
        f.transport.respond("/v1/announcements/", 400, json!({"detail": "Title required"}));

        let announcement = Announcement {
            id: String::new(),
            title: String::new(),
            message: "m".to_string(),
            broadcast_at: DateTime::from_timestamp_millis(0).expect("timestamp"),
            category: Category::NONE,
            approved: false,
            updated_at: None,
        };
        let err = f
            .service
            .save_announcement(&announcement, WriteOp::Create)
            .await
            .expect_err("should fail");
        assert_eq!(err.to_string(), "Title required");
        settle().await;
        assert_eq!(f.transport.requests().len(), 1);
        assert_eq!(f.transport.requests()[0].method, Method::Post);
        assert_eq!(
            drain(&mut rx),
            [CacheEvent::Failure {
                resource: Some(ResourceKind::Announcements),
                message: "Title required".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_perform_scan() {
        let f = fixture();
        f.transport.respond(
            "/v1/perform_scan/",
            200,
            json!({"scanned": true, "data": [
                {"label": "Shirt", "value": "M", "color": "ff0000"},
                {"label": 3}
            ]}),
        );
        let result = f.service.perform_scan("user-123", "s1", true).await.expect("scan");
        assert!(result.scanned);
        assert_eq!(result.fields.len(), 1);
        assert_eq!(result.fields[0].rgb(), (255, 0, 0));

        let request = &f.transport.requests()[0];
        assert_eq!(request.method, Method::Get);
        assert!(request.url.contains("user_id=user-123"));

        f.transport.respond("/v1/perform_scan/", 200, json!({"scanned": false}));
        let result = f.service.perform_scan("user-123", "s1", false).await.expect("scan");
        assert_eq!(result, ScanResult::default());
        assert_eq!(f.transport.requests()[1].method, Method::Post);
    }

    #[tokio::test]
    async fn test_fetch_pass() {
        let f = fixture();
        assert_eq!(f.service.fetch_pass().await, Err(ApiError::NotLoggedIn));

        f.service
            .credentials()
            .install("t0ken", identity(false))
            .expect("install");
        f.transport.respond("/v1/apple_pass/", 200, json!({"apple_pass": "aGVs\nbG8="}));
        assert_eq!(f.service.fetch_pass().await.expect("pass"), b"hello");

        f.transport.respond("/v1/apple_pass/", 200, json!({"pass": "x"}));
        assert!(matches!(f.service.fetch_pass().await, Err(ApiError::Decode(_))));
    }

    #[tokio::test]
    async fn test_push_token_registration() {
        let f = fixture();
        assert_eq!(
            f.service.update_push_token(None).await,
            Err(ApiError::MissingDeviceToken)
        );

        let transport = Arc::new(MockTransport::new());
        let files = Arc::new(MemoryFile::default());
        let service = SyncService::new(
            Config {
                push_device_token: Some("dev1".to_string()),
                ..config()
            },
            transport.clone(),
            Arc::new(MemorySecretStore::default()),
            files.clone(),
        )
        .expect("service");

        transport.respond("/v1/push_notifications/apns/", 200, json!({"registration_id": "dev1", "name": "5"}));
        assert_eq!(service.update_push_token(Some(5)).await, Ok(5));
        assert_eq!(service.config().push_preference, Some(5));
        if let Some(path) = service.config_file.as_deref() {
            let saved: Config = serde_json::from_slice(&files.contents(path).expect("config written")).expect("parse");
            assert_eq!(saved.push_preference, Some(5));
            assert_eq!(saved.push_device_token.as_deref(), Some("dev1"));
        }

        let body = String::from_utf8(transport.requests()[0].body.clone().unwrap_or_default()).expect("utf8");
        assert_eq!(body, "registration_id=dev1&name=5");

        transport.respond("/v1/push_notifications/apns/", 200, json!({"registration_id": "other", "name": "63"}));
        assert!(service.update_push_token(None).await.is_err());
        assert_eq!(service.config().push_preference, Some(5));
    }

    #[tokio::test]
    async fn test_login_and_logout_persist_snapshot() {
        let f = fixture();
        f.transport.respond(
            "/v1/login/",
            200,
            json!({"token": "t0ken", "user": {"email": "ada@example.com", "name": "Ada", "can_perform_scan": true}}),
        );
        let who = f.service.login("ada@example.com", "pw").await.expect("login");
        assert_eq!(who.username, "ada@example.com");
        assert_eq!(f.service.config().last_username.as_deref(), Some("ada@example.com"));

        let saved = f.service.load_snapshot().expect("snapshot");
        assert_eq!(saved.credential.map(|c| c.username).as_deref(), Some("ada@example.com"));
        if let Some(path) = f.service.config_file.as_deref() {
            let config: Config = serde_json::from_slice(&f.files.contents(path).expect("config written")).expect("parse");
            assert_eq!(config.last_username.as_deref(), Some("ada@example.com"));
        }

        f.service.logout().await;
        assert!(f.service.load_snapshot().expect("snapshot").credential.is_none());
        assert_eq!(f.secrets.get("ada@example.com").expect("get"), None);
    }

    #[tokio::test]
    async fn test_snapshot_write_failure_is_swallowed() {
        let f = fixture();
        f.files.fail_writes(true);
        assert!(!f.service.save_snapshot());
        assert!(!f.service.save_snapshot_in_background().await.expect("join"));
    }
}
