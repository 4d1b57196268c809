//! Maintenance observers
//!
//! Background tasks binding health changes and timers to maintenance
//! actions. Each task owns one trigger; the actions themselves carry the
//! re-entrancy guards, so a trigger firing mid-run is dropped there.
//!
//! Observers are started on login and aborted on logout. Errors are logged
//! at this boundary and never end a task.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::engine::health::{HealthStatus, KeyHealthState};
use crate::engine::key_manager::PoolOutcome;
use crate::engine::maintenance::Maintenance;

/// Handles of the running observer tasks
pub struct MaintenanceObservers {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MaintenanceObservers {
    /// Spawn every observer; must be called inside a tokio runtime
    pub fn start(maintenance: Arc<Maintenance>) -> Self {
        let health = maintenance.health();
        let prekeys = health.prekeys.subscribe();
        let sender_keys = health.sender_keys.subscribe();
        let identity = health.identity.subscribe();

        let tasks = vec![
            tokio::spawn(observe_prekey_pool(maintenance.clone(), prekeys)),
            tokio::spawn(observe_sender_keys(maintenance.clone(), sender_keys)),
            tokio::spawn(observe_identity(maintenance.clone(), identity)),
            tokio::spawn(self_verification(maintenance)),
        ];
        tracing::info!(observers = tasks.len(), "Started key maintenance observers");

        Self {
            tasks: Mutex::new(tasks),
        }
    }

    /// Abort every observer; calling it again does nothing
    pub fn stop(&self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        if tasks.is_empty() {
            return;
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        tracing::info!("Stopped key maintenance observers");
    }

    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.iter().any(|task| !task.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for MaintenanceObservers {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Refill the pool when it drops under the low-water mark
async fn observe_prekey_pool(maintenance: Arc<Maintenance>, mut rx: watch::Receiver<KeyHealthState>) {
    let low_water = u64::from(maintenance.config().prekey_low_water);

    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().clone();
        // Error is left for the periodic pass so a failing store is not hammered
        if state.count >= low_water || state.in_progress || state.status == HealthStatus::Error {
            continue;
        }

        tracing::debug!(count = state.count, "Prekey pool low");
        match maintenance.refill_prekeys().await {
            Ok(PoolOutcome::Refilled { batch }) => {
                tracing::info!(generated = batch.len(), "Prekey pool refilled")
            }
            Ok(PoolOutcome::Replaced { batch }) => {
                tracing::info!(generated = batch.len(), "Prekey pool replaced")
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Prekey pool refill failed: {}", e),
        }
    }
}

/// Daily rotation pass, plus an immediate one when a key crosses its threshold
async fn observe_sender_keys(maintenance: Arc<Maintenance>, mut rx: watch::Receiver<KeyHealthState>) {
    let config = maintenance.config().clone();

    // First pass shortly after startup, then daily
    let mut daily = time::interval_at(
        Instant::now() + config.sender_key_startup_delay,
        config.sender_key_check_interval,
    );
    daily.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = daily.tick() => maintenance.run_periodic().await,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = rx.borrow_and_update().clone();
                if !state.rotation_needed || state.in_progress || state.status == HealthStatus::Error {
                    continue;
                }
                tracing::info!("Sender key rotation threshold reached");
                if let Err(e) = maintenance.rotate_sender_keys().await {
                    tracing::error!("Sender key rotation failed: {}", e);
                }
            }
        }
    }
}

/// Run the dependent-key cascade whenever the identity generation moves
async fn observe_identity(maintenance: Arc<Maintenance>, mut rx: watch::Receiver<KeyHealthState>) {
    while rx.changed().await.is_ok() {
        let generation = rx.borrow_and_update().generation;
        if generation > 0 {
            maintenance.run_identity_cascade(generation).await;
        }
    }
}

/// Hourly check; the audit itself runs once per verification period
async fn self_verification(maintenance: Arc<Maintenance>) {
    let mut hourly = time::interval(maintenance.config().verification_check_interval);
    hourly.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; login has just verified
    hourly.tick().await;

    loop {
        hourly.tick().await;
        if let Err(e) = maintenance.verify_if_due().await {
            tracing::warn!("Self-verification failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::classifier::ErrorClassifier;
    use crate::engine::healing::HealingService;
    use crate::engine::health::HealthRegistry;
    use crate::engine::key_manager::KeyManager;
    use crate::engine::sender_keys::SenderKeyManager;
    use crate::engine::testing::FakeKeyServer;
    use crate::models::ProtocolAddress;
    use crate::store::{KeyStore, MemoryKeyStore};

    struct Fixture {
        keys: Arc<KeyManager>,
        sender_keys: Arc<SenderKeyManager>,
        maintenance: Arc<Maintenance>,
    }

    async fn fixture(config: EngineConfig) -> Fixture {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let server = FakeKeyServer::new();
        let health = Arc::new(HealthRegistry::new());
        let keys = Arc::new(KeyManager::new(store.clone(), health.clone(), config.clone()));
        keys.ensure_identity().await.unwrap();
        keys.rotate_signed_prekey(1).await.unwrap();
        let sender_keys = Arc::new(SenderKeyManager::new(
            store.clone(),
            server.clone(),
            health.clone(),
            config.clone(),
        ));
        let healing = Arc::new(HealingService::new(keys.clone(), server));
        let maintenance = Arc::new(Maintenance::new(
            store,
            keys.clone(),
            sender_keys.clone(),
            healing,
            Arc::new(ErrorClassifier::new()),
            health,
            config,
        ));
        maintenance
            .set_account(Some(ProtocolAddress::new("alice", 1)))
            .await;
        Fixture {
            keys,
            sender_keys,
            maintenance,
        }
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_pool_observer_refills_after_consumption() {
        let f = fixture(EngineConfig::default()).await;
        f.keys.generate_prekeys(1, 25).await.unwrap();
        let observers = MaintenanceObservers::start(f.maintenance.clone());

        for id in 1..=10 {
            f.keys.consume_prekey(id).await.unwrap();
        }

        let keys = f.keys.clone();
        wait_until(|| {
            let keys = keys.clone();
            async move { keys.prekey_ids().await.unwrap().len() >= 20 }
        })
        .await;
        let ids = f.keys.prekey_ids().await.unwrap();
        assert!(ids.iter().all(|id| *id > 10));
        assert!(ids.iter().any(|id| *id > 25));
        observers.stop();
    }

    #[tokio::test]
    async fn test_identity_observer_runs_cascade() {
        let f = fixture(EngineConfig::default()).await;
        let me = ProtocolAddress::new("alice", 1);
        f.sender_keys.get_cipher("g1", &me).encrypt(b"hello").await.unwrap();
        let observers = MaintenanceObservers::start(f.maintenance.clone());

        f.keys.regenerate_identity().await.unwrap();

        let keys = f.keys.clone();
        wait_until(|| {
            let keys = keys.clone();
            async move { !keys.is_invalidated() }
        })
        .await;
        assert_eq!(f.sender_keys.group_count().await.unwrap(), 0);
        assert_eq!(f.keys.current_signed_prekey().await.unwrap().unwrap().key_id, 2);
        observers.stop();
    }

    #[tokio::test]
    async fn test_rotation_signal_triggers_immediate_check() {
        let config = EngineConfig {
            sender_key_max_messages: 3,
            ..EngineConfig::default()
        };
        let f = fixture(config).await;
        let me = ProtocolAddress::new("alice", 1);
        let observers = MaintenanceObservers::start(f.maintenance.clone());

        for _ in 0..3 {
            f.sender_keys.get_cipher("g1", &me).encrypt(b"msg").await.unwrap();
        }

        // Well inside the startup delay, so only the signal can have done this
        let maintenance = f.maintenance.clone();
        let sender = me.clone();
        wait_until(|| {
            let maintenance = maintenance.clone();
            let sender_keys = f.sender_keys.clone();
            let sender = sender.clone();
            async move {
                let reset = sender_keys
                    .metadata("g1", &sender)
                    .await
                    .unwrap()
                    .is_some_and(|meta| meta.message_count == 0);
                reset && !maintenance.health().sender_keys.snapshot().rotation_needed
            }
        })
        .await;
        observers.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let f = fixture(EngineConfig::default()).await;
        let observers = MaintenanceObservers::start(f.maintenance.clone());
        assert!(observers.is_running());
        observers.stop();
        observers.stop();
        assert!(!observers.is_running());
    }
}
