//! Idempotent inbound provisioning
//!
//! The remark is the idempotency key. A request for a remark that already
//! exists resolves to the stored inbound and its first client, so repeating a
//! request never mints a second identity.

use crate::config::ProvisionConfig;
use crate::db::{Inbound, NewInbound, UserRecord};
use crate::error::{ProvisionError, StoreError};
use crate::identity::{ClientIdGenerator, RandomClientIds};
use crate::link;
use crate::restart::RestartCoordinator;
use crate::settings::InboundSettings;
use rand::Rng;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bytes in one GiB, the unit quotas are requested in
pub const BYTES_PER_GIB: u64 = 1 << 30;

/// Store operations the provisioner depends on
pub trait InboundStore: Send + Sync {
    /// Insert atomically, reporting remark and port collisions as distinct errors
    fn create_inbound(&self, inbound: &NewInbound) -> Result<Inbound, StoreError>;

    fn find_inbound_by_remark(&self, remark: &str) -> Result<Option<Inbound>, StoreError>;

    /// The user that owns provisioned inbounds, if any exists
    fn primary_owner(&self) -> Result<Option<UserRecord>, StoreError>;

    fn list_inbounds(&self) -> Result<Vec<Inbound>, StoreError>;

    fn count_inbounds(&self) -> Result<i64, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub remark: String,
    pub quota_gib: u64,
}

impl ProvisionRequest {
    pub fn new(remark: impl Into<String>, quota_gib: u64) -> Self {
        Self {
            remark: remark.into(),
            quota_gib,
        }
    }
}

/// Result of a provisioning request
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub inbound: Inbound,
    /// The effective client identity, new or pre-existing
    pub client_id: Uuid,
    /// False when the remark already existed
    pub created: bool,
}

/// Uniform random port selection over a half-open range
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: Range<u16>,
}

impl PortAllocator {
    pub fn new(range: Range<u16>) -> anyhow::Result<Self> {
        if range.is_empty() {
            anyhow::bail!("port range {}..{} is empty", range.start, range.end);
        }
        Ok(Self { range })
    }

    pub fn pick(&self) -> u16 {
        rand::thread_rng().gen_range(self.range.clone())
    }
}

pub struct Provisioner {
    store: Arc<dyn InboundStore>,
    coordinator: Arc<RestartCoordinator>,
    config: ProvisionConfig,
    ports: PortAllocator,
    ids: Box<dyn ClientIdGenerator>,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn InboundStore>,
        coordinator: Arc<RestartCoordinator>,
        config: ProvisionConfig,
    ) -> anyhow::Result<Self> {
        config.validate().map_err(anyhow::Error::msg)?;
        let ports = PortAllocator::new(config.port_range())?;

        Ok(Self {
            store,
            coordinator,
            config,
            ports,
            ids: Box::new(RandomClientIds),
        })
    }

    /// Replace the client identity source (builder pattern)
    pub fn with_id_generator(mut self, ids: Box<dyn ClientIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Create the inbound for a remark, or resolve the one that already exists.
    ///
    /// Leading and trailing whitespace is trimmed from the remark before it is
    /// used as the key, so `" office"` and `"office"` name the same inbound.
    ///
    /// Both outcomes signal the restart coordinator. Failures leave the store
    /// and the dirty flag untouched.
    pub fn provision(&self, request: &ProvisionRequest) -> Result<Provisioned, ProvisionError> {
        let remark = request.remark.trim();
        if remark.is_empty() {
            return Err(ProvisionError::InvalidRequest(
                "remark must not be empty".to_string(),
            ));
        }
        let total = quota_bytes(request.quota_gib)?;

        let owner = self
            .store
            .primary_owner()
            .map_err(ProvisionError::ProvisioningFailed)?
            .ok_or(ProvisionError::NoOwnerAvailable)?;

        let client_id = self.ids.generate();
        let settings = InboundSettings::single_client(client_id, &self.config.flow);
        let stream_settings = self.config.transport.stream_settings();

        let attempts = self.config.port_attempts;
        for attempt in 1..=attempts {
            let port = self.ports.pick();
            let candidate = NewInbound {
                user_id: owner.id,
                total,
                remark: remark.to_string(),
                enable: true,
                expiry_time: 0,
                listen: self.config.listen.clone(),
                port,
                protocol: self.config.protocol,
                settings: settings.clone(),
                stream_settings: stream_settings.clone(),
                sniffing: self.config.sniffing.clone(),
                tag: format!("inbound-{}", port),
            };

            match self.store.create_inbound(&candidate) {
                Ok(inbound) => {
                    info!(remark, port, id = inbound.id, "Provisioned inbound");
                    self.coordinator.signal_change();
                    return Ok(Provisioned {
                        inbound,
                        client_id,
                        created: true,
                    });
                }
                Err(StoreError::RemarkConflict(_)) => {
                    return self.resolve_existing(remark);
                }
                Err(StoreError::PortConflict(port)) => {
                    // SQLite reports only one violated constraint per insert
                    if self
                        .store
                        .find_inbound_by_remark(remark)
                        .map_err(|e| self.conflict_lookup_error(remark, e))?
                        .is_some()
                    {
                        return self.resolve_existing(remark);
                    }
                    warn!(remark, port, attempt, attempts, "Port already in use, retrying");
                }
                Err(e) => return Err(ProvisionError::ProvisioningFailed(e)),
            }
        }

        warn!(remark, attempts, "Port allocation exhausted");
        Err(ProvisionError::PortAllocationExhausted { attempts })
    }

    /// Idempotency path: reuse the stored inbound and its first client
    fn resolve_existing(&self, remark: &str) -> Result<Provisioned, ProvisionError> {
        let inbound = self
            .store
            .find_inbound_by_remark(remark)
            .map_err(|e| self.conflict_lookup_error(remark, e))?
            .ok_or_else(|| {
                ProvisionError::ProvisioningFailed(StoreError::NotFound(remark.to_string()))
            })?;

        let client_id =
            inbound
                .settings
                .first_client_id()
                .map_err(|e| ProvisionError::CorruptSettings {
                    remark: remark.to_string(),
                    reason: e.to_string(),
                })?;

        debug!(remark, id = inbound.id, %client_id, "Remark exists, reusing client");
        self.coordinator.signal_change();

        Ok(Provisioned {
            inbound,
            client_id,
            created: false,
        })
    }

    fn conflict_lookup_error(&self, remark: &str, err: StoreError) -> ProvisionError {
        match err {
            StoreError::Corrupt { field, reason, .. } => ProvisionError::CorruptSettings {
                remark: remark.to_string(),
                reason: format!("{}: {}", field, reason),
            },
            other => ProvisionError::ProvisioningFailed(other),
        }
    }

    /// Provision and render the share link for the caller's host
    pub fn provision_and_describe(
        &self,
        remark: &str,
        quota_gib: u64,
        request_host: &str,
    ) -> Result<String, ProvisionError> {
        let provisioned = self.provision(&ProvisionRequest::new(remark, quota_gib))?;
        Ok(link::encode(
            &provisioned.inbound,
            &provisioned.client_id,
            request_host,
        ))
    }

    pub fn list_inbounds(&self) -> Result<Vec<Inbound>, StoreError> {
        self.store.list_inbounds()
    }

    pub fn count_inbounds(&self) -> Result<i64, StoreError> {
        self.store.count_inbounds()
    }

    pub fn coordinator(&self) -> &Arc<RestartCoordinator> {
        &self.coordinator
    }
}

fn quota_bytes(quota_gib: u64) -> Result<i64, ProvisionError> {
    quota_gib
        .checked_mul(BYTES_PER_GIB)
        .and_then(|bytes| i64::try_from(bytes).ok())
        .ok_or_else(|| {
            ProvisionError::InvalidRequest(format!("quota of {} GiB is too large", quota_gib))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartConfig;
    use crate::db::Database;
    use crate::restart::tests::RecordingProxy;
    use crate::settings::{Network, Protocol, Security, Sniffing, TransportTemplate};
    use base64::Engine;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Hands out 00000000-...-0001, -0002, ...
    struct SequentialIds(AtomicU64);

    impl ClientIdGenerator for SequentialIds {
        fn generate(&self) -> Uuid {
            Uuid::from_u128(self.0.fetch_add(1, Ordering::SeqCst) as u128 + 1)
        }
    }

    /// A store whose writes always fail
    struct BrokenStore {
        inner: Database,
    }

    impl InboundStore for BrokenStore {
        fn create_inbound(&self, _inbound: &NewInbound) -> Result<Inbound, StoreError> {
            Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery))
        }

        fn find_inbound_by_remark(&self, remark: &str) -> Result<Option<Inbound>, StoreError> {
            self.inner.find_inbound_by_remark(remark)
        }

        fn primary_owner(&self) -> Result<Option<UserRecord>, StoreError> {
            self.inner.get_first_user()
        }

        fn list_inbounds(&self) -> Result<Vec<Inbound>, StoreError> {
            self.inner.list_inbounds()
        }

        fn count_inbounds(&self) -> Result<i64, StoreError> {
            self.inner.count_inbounds()
        }
    }

    /// Reports a port collision on the first insert, then delegates
    struct CollidingOnceStore {
        inner: Database,
        collided: AtomicBool,
    }

    impl InboundStore for CollidingOnceStore {
        fn create_inbound(&self, inbound: &NewInbound) -> Result<Inbound, StoreError> {
            if !self.collided.swap(true, Ordering::SeqCst) {
                return Err(StoreError::PortConflict(inbound.port));
            }
            self.inner.create_inbound(inbound)
        }

        fn find_inbound_by_remark(&self, remark: &str) -> Result<Option<Inbound>, StoreError> {
            self.inner.find_inbound_by_remark(remark)
        }

        fn primary_owner(&self) -> Result<Option<UserRecord>, StoreError> {
            self.inner.get_first_user()
        }

        fn list_inbounds(&self) -> Result<Vec<Inbound>, StoreError> {
            self.inner.list_inbounds()
        }

        fn count_inbounds(&self) -> Result<i64, StoreError> {
            self.inner.count_inbounds()
        }
    }

    struct Harness {
        db: Database,
        coordinator: Arc<RestartCoordinator>,
        provisioner: Provisioner,
    }

    fn harness_with(config: ProvisionConfig, with_owner: bool) -> Harness {
        let db = Database::open_in_memory().unwrap();
        if with_owner {
            db.create_user("admin", "admin").unwrap();
        }
        let coordinator = RestartCoordinator::new(
            Arc::new(RecordingProxy::default()),
            &RestartConfig::default(),
        );
        let provisioner = Provisioner::new(Arc::new(db.clone()), Arc::clone(&coordinator), config)
            .unwrap()
            .with_id_generator(Box::new(SequentialIds(AtomicU64::new(0))));
        Harness {
            db,
            coordinator,
            provisioner,
        }
    }

    fn harness() -> Harness {
        harness_with(ProvisionConfig::default(), true)
    }

    #[test]
    fn test_provision_office() {
        let h = harness();

        let result = h
            .provisioner
            .provision(&ProvisionRequest::new("office", 10))
            .unwrap();

        assert!(result.created);
        let inbound = &result.inbound;
        assert_eq!(inbound.remark, "office");
        assert_eq!(inbound.total, 10 * 1024 * 1024 * 1024);
        assert!(inbound.enable);
        assert_eq!(inbound.tag, format!("inbound-{}", inbound.port));
        assert!((20000..50000).contains(&inbound.port));
        assert_eq!(inbound.protocol, Protocol::Vmess);
        assert_eq!(inbound.settings.first_client_id().unwrap(), result.client_id);
        assert_eq!(inbound.settings.clients[0].flow, "xtls-rprx-direct");
        assert_eq!(inbound.settings.decryption, "none");
        assert!(inbound.settings.fallbacks.is_empty());
        assert_eq!(inbound.stream_settings.network, Network::Ws);
        assert_eq!(inbound.stream_settings.security, Security::None);
        assert_eq!(inbound.stream_settings.path(), "/");
        assert_eq!(inbound.sniffing, Sniffing::default());

        assert!(h.coordinator.is_dirty());
    }

    #[tokio::test]
    async fn test_provision_is_idempotent_per_remark() {
        let h = harness();

        let first = h
            .provisioner
            .provision(&ProvisionRequest::new("office", 10))
            .unwrap();
        h.coordinator.tick().await;

        let second = h
            .provisioner
            .provision(&ProvisionRequest::new("office", 10))
            .unwrap();

        assert!(!second.created);
        assert_eq!(second.client_id, first.client_id);
        assert_eq!(second.inbound.id, first.inbound.id);
        assert_eq!(h.db.count_inbounds().unwrap(), 1);
        // The resolution path also signals
        assert!(h.coordinator.is_dirty());
    }

    #[test]
    fn test_remark_is_trimmed() {
        let h = harness();

        let first = h
            .provisioner
            .provision(&ProvisionRequest::new("office", 1))
            .unwrap();
        let second = h
            .provisioner
            .provision(&ProvisionRequest::new("  office ", 1))
            .unwrap();

        assert_eq!(first.client_id, second.client_id);
        assert_eq!(h.db.count_inbounds().unwrap(), 1);
    }

    #[test]
    fn test_no_owner_leaves_state_untouched() {
        let h = harness_with(ProvisionConfig::default(), false);

        let err = h
            .provisioner
            .provision(&ProvisionRequest::new("office", 10))
            .unwrap_err();

        assert!(matches!(err, ProvisionError::NoOwnerAvailable));
        assert_eq!(h.db.count_inbounds().unwrap(), 0);
        assert!(!h.coordinator.is_dirty());
    }

    #[test]
    fn test_empty_remark_rejected() {
        let h = harness();

        let err = h
            .provisioner
            .provision(&ProvisionRequest::new("   ", 10))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidRequest(_)));
        assert!(!h.coordinator.is_dirty());
    }

    #[test]
    fn test_quota_overflow_rejected() {
        let h = harness();

        let err = h
            .provisioner
            .provision(&ProvisionRequest::new("office", u64::MAX / 2))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidRequest(_)));
        assert_eq!(h.db.count_inbounds().unwrap(), 0);
    }

    #[test]
    fn test_zero_quota_allowed() {
        let h = harness();

        let result = h
            .provisioner
            .provision(&ProvisionRequest::new("unlimited", 0))
            .unwrap();
        assert_eq!(result.inbound.total, 0);
    }

    #[tokio::test]
    async fn test_port_exhaustion() {
        let config = ProvisionConfig {
            port_range_start: 20000,
            port_range_end: 20001,
            port_attempts: 3,
            ..ProvisionConfig::default()
        };
        let h = harness_with(config, true);

        let first = h
            .provisioner
            .provision(&ProvisionRequest::new("office", 1))
            .unwrap();
        assert_eq!(first.inbound.port, 20000);
        h.coordinator.tick().await;

        let err = h
            .provisioner
            .provision(&ProvisionRequest::new("home", 1))
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::PortAllocationExhausted { attempts: 3 }
        ));
        assert_eq!(h.db.count_inbounds().unwrap(), 1);
        assert!(!h.coordinator.is_dirty());

        // The existing remark still resolves even though its port is the only one
        let again = h
            .provisioner
            .provision(&ProvisionRequest::new("office", 1))
            .unwrap();
        assert_eq!(again.client_id, first.client_id);
    }

    #[test]
    fn test_port_collision_retries_with_new_port() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("admin", "admin").unwrap();
        let coordinator = RestartCoordinator::new(
            Arc::new(RecordingProxy::default()),
            &RestartConfig::default(),
        );
        let store = Arc::new(CollidingOnceStore {
            inner: db.clone(),
            collided: AtomicBool::new(false),
        });
        let provisioner = Provisioner::new(
            store.clone(),
            Arc::clone(&coordinator),
            ProvisionConfig::default(),
        )
        .unwrap();

        let result = provisioner
            .provision(&ProvisionRequest::new("office", 1))
            .unwrap();

        assert!(result.created);
        assert!(store.collided.load(Ordering::SeqCst));
        assert_eq!(db.count_inbounds().unwrap(), 1);
        assert!(coordinator.is_dirty());
    }

    #[test]
    fn test_concurrent_requests_share_one_identity() {
        let h = harness();

        let results: Vec<Provisioned> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..32)
                .map(|_| {
                    scope.spawn(|| {
                        h.provisioner
                            .provision(&ProvisionRequest::new("office", 1))
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|t| t.join().unwrap()).collect()
        });

        let first_id = results[0].client_id;
        assert!(results.iter().all(|r| r.client_id == first_id));
        assert_eq!(results.iter().filter(|r| r.created).count(), 1);
        assert_eq!(h.db.count_inbounds().unwrap(), 1);

        let stored = h.db.find_inbound_by_remark("office").unwrap().unwrap();
        assert_eq!(stored.settings.first_client_id().unwrap(), first_id);
    }

    #[test]
    fn test_store_failure_is_surfaced() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("admin", "admin").unwrap();
        let coordinator = RestartCoordinator::new(
            Arc::new(RecordingProxy::default()),
            &RestartConfig::default(),
        );
        let provisioner = Provisioner::new(
            Arc::new(BrokenStore { inner: db.clone() }),
            Arc::clone(&coordinator),
            ProvisionConfig::default(),
        )
        .unwrap();

        let err = provisioner
            .provision(&ProvisionRequest::new("office", 1))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ProvisioningFailed(_)));
        assert!(!coordinator.is_dirty());
        assert_eq!(db.count_inbounds().unwrap(), 0);
    }

    #[test]
    fn test_existing_inbound_without_clients_is_corrupt() {
        let h = harness();

        let owner = h.db.get_first_user().unwrap().unwrap();
        h.db.create_inbound(&NewInbound {
            user_id: owner.id,
            total: 0,
            remark: "office".to_string(),
            enable: true,
            expiry_time: 0,
            listen: String::new(),
            port: 23456,
            protocol: Protocol::Vmess,
            settings: InboundSettings {
                clients: Vec::new(),
                decryption: "none".to_string(),
                fallbacks: Vec::new(),
            },
            stream_settings: TransportTemplate::default().stream_settings(),
            sniffing: Sniffing::default(),
            tag: "inbound-23456".to_string(),
        })
        .unwrap();

        let err = h
            .provisioner
            .provision(&ProvisionRequest::new("office", 1))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::CorruptSettings { ref remark, .. } if remark == "office"));
        assert!(!h.coordinator.is_dirty());
    }

    #[test]
    fn test_provision_and_describe_embeds_client_id() {
        let h = harness();

        let share_link = h
            .provisioner
            .provision_and_describe("office", 10, "panel.example.com:54321")
            .unwrap();

        let payload = share_link.strip_prefix("vmess://").unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&decoded).unwrap();

        let stored = h.db.find_inbound_by_remark("office").unwrap().unwrap();
        assert_eq!(
            doc["id"],
            stored.settings.first_client_id().unwrap().to_string()
        );
        assert_eq!(doc["add"], "panel.example.com");
        assert_eq!(doc["ps"], "office");
        assert_eq!(doc["port"], stored.port);

        let again = h
            .provisioner
            .provision_and_describe("office", 10, "panel.example.com:54321")
            .unwrap();
        assert_eq!(again, share_link);
    }

    #[test]
    fn test_port_allocator_stays_in_range() {
        let ports = PortAllocator::new(20000..50000).unwrap();
        for _ in 0..10_000 {
            let port = ports.pick();
            assert!((20000..50000).contains(&port));
        }
        assert!(PortAllocator::new(30000..30000).is_err());
    }

    #[test]
    fn test_quota_bytes() {
        assert_eq!(quota_bytes(10).unwrap(), 10 * 1024 * 1024 * 1024);
        assert!(quota_bytes(u64::MAX).is_err());
    }
}
