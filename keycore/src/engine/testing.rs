//! In-process fakes for engine tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::KeyServer;
use crate::crypto::{fingerprint, PreKeyBundle};
use crate::error::{EngineError, EngineResult};
use crate::models::{KeyUpload, PreKeySync, SenderKeyRotation, ServerKeyStatus};
use crate::store::{KeyStore, MemoryKeyStore, StoreError, StoreName, StoreResult};

#[derive(Default)]
struct FakeServerState {
    status: ServerKeyStatus,
    uploads: Vec<KeyUpload>,
    rotations: Vec<SenderKeyRotation>,
    syncs: Vec<PreKeySync>,
    bundles: HashMap<(String, u32), PreKeyBundle>,
    status_calls: usize,
    fail_rotation: bool,
    offline: bool,
}

/// Key server that applies uploads to an in-memory status and records calls
#[derive(Default)]
pub struct FakeKeyServer {
    state: Mutex<FakeServerState>,
}

impl FakeKeyServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeServerState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_status(&self, status: ServerKeyStatus) {
        self.with_state(|s| s.status = status);
    }

    pub fn status(&self) -> ServerKeyStatus {
        self.with_state(|s| s.status.clone())
    }

    pub fn uploads(&self) -> Vec<KeyUpload> {
        self.with_state(|s| s.uploads.clone())
    }

    pub fn rotations(&self) -> Vec<SenderKeyRotation> {
        self.with_state(|s| s.rotations.clone())
    }

    pub fn syncs(&self) -> Vec<PreKeySync> {
        self.with_state(|s| s.syncs.clone())
    }

    pub fn status_calls(&self) -> usize {
        self.with_state(|s| s.status_calls)
    }

    pub fn add_bundle(&self, user_id: &str, device_id: u32, bundle: PreKeyBundle) {
        self.with_state(|s| {
            s.bundles.insert((user_id.to_string(), device_id), bundle);
        });
    }

    pub fn fail_rotation(&self, fail: bool) {
        self.with_state(|s| s.fail_rotation = fail);
    }

    pub fn set_offline(&self, offline: bool) {
        self.with_state(|s| s.offline = offline);
    }

    fn check_online(state: &FakeServerState) -> EngineResult<()> {
        if state.offline {
            return Err(EngineError::Network("Request timeout".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyServer for FakeKeyServer {
    async fn key_status(&self, _user_id: &str, _device_id: u32) -> EngineResult<ServerKeyStatus> {
        self.with_state(|s| {
            Self::check_online(s)?;
            s.status_calls += 1;
            Ok(s.status.clone())
        })
    }

    async fn upload_keys(&self, upload: &KeyUpload) -> EngineResult<()> {
        self.with_state(|s| {
            Self::check_online(s)?;
            if let Some(identity) = &upload.identity_key {
                s.status.identity_key = Some(identity.clone());
                s.status.pre_key_fingerprints.clear();
            }
            if let Some(spk) = &upload.signed_pre_key {
                s.status.signed_pre_key = Some(spk.public_key.clone());
                s.status.signed_pre_key_signature = Some(spk.signature.clone());
            }
            for prekey in &upload.pre_keys {
                let public = base64_decode(&prekey.public_key);
                s.status
                    .pre_key_fingerprints
                    .insert(prekey.key_id.to_string(), fingerprint(&public));
            }
            s.status.pre_keys_count = s.status.pre_key_fingerprints.len() as u32;
            s.uploads.push(upload.clone());
            Ok(())
        })
    }

    async fn notify_sender_key_rotation(&self, rotation: &SenderKeyRotation) -> EngineResult<()> {
        self.with_state(|s| {
            Self::check_online(s)?;
            if s.fail_rotation {
                return Err(EngineError::Server {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            s.rotations.push(rotation.clone());
            Ok(())
        })
    }

    async fn sync_prekeys(&self, sync: &PreKeySync) -> EngineResult<()> {
        self.with_state(|s| {
            Self::check_online(s)?;
            s.syncs.push(sync.clone());
            Ok(())
        })
    }

    async fn fetch_prekey_bundle(&self, user_id: &str, device_id: u32) -> EngineResult<PreKeyBundle> {
        self.with_state(|s| {
            Self::check_online(s)?;
            s.bundles
                .get(&(user_id.to_string(), device_id))
                .cloned()
                .ok_or_else(|| EngineError::Server {
                    status: 404,
                    body: format!("No bundle for {}.{}", user_id, device_id),
                })
        })
    }
}

fn base64_decode(value: &str) -> Vec<u8> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    BASE64.decode(value).unwrap()
}

/// Memory store that sleeps on every `list_keys` and counts the calls
pub struct SlowKeyStore {
    inner: MemoryKeyStore,
    delay: Duration,
    list_calls: AtomicUsize,
}

impl SlowKeyStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryKeyStore::new(),
            delay,
            list_calls: AtomicUsize::new(0),
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyStore for SlowKeyStore {
    async fn get(&self, store: StoreName, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(store, key).await
    }

    async fn put(&self, store: StoreName, key: &str, value: &[u8]) -> StoreResult<()> {
        self.inner.put(store, key, value).await
    }

    async fn delete(&self, store: StoreName, key: &str) -> StoreResult<()> {
        self.inner.delete(store, key).await
    }

    async fn list_keys(&self, store: StoreName) -> StoreResult<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.list_keys(store).await
    }
}

/// Memory store whose next writes to chosen stores fail
pub struct FailingKeyStore {
    inner: MemoryKeyStore,
    failing_puts: Mutex<HashMap<StoreName, usize>>,
    failing_deletes: Mutex<HashMap<StoreName, usize>>,
}

impl FailingKeyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryKeyStore::new(),
            failing_puts: Mutex::new(HashMap::new()),
            failing_deletes: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `count` puts into `store`
    pub fn fail_puts(&self, store: StoreName, count: usize) {
        self.failing_puts.lock().unwrap().insert(store, count);
    }

    /// Fail the next `count` deletes from `store`
    pub fn fail_deletes(&self, store: StoreName, count: usize) {
        self.failing_deletes.lock().unwrap().insert(store, count);
    }

    fn take_failure(failures: &Mutex<HashMap<StoreName, usize>>, store: StoreName) -> bool {
        let mut failures = failures.lock().unwrap();
        match failures.get_mut(&store) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl KeyStore for FailingKeyStore {
    async fn get(&self, store: StoreName, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(store, key).await
    }

    async fn put(&self, store: StoreName, key: &str, value: &[u8]) -> StoreResult<()> {
        if Self::take_failure(&self.failing_puts, store) {
            return Err(StoreError::Unavailable(format!("disk full writing {:?}/{}", store, key)));
        }
        self.inner.put(store, key, value).await
    }

    async fn delete(&self, store: StoreName, key: &str) -> StoreResult<()> {
        if Self::take_failure(&self.failing_deletes, store) {
            return Err(StoreError::Unavailable(format!("disk full deleting {:?}/{}", store, key)));
        }
        self.inner.delete(store, key).await
    }

    async fn list_keys(&self, store: StoreName) -> StoreResult<Vec<String>> {
        self.inner.list_keys(store).await
    }
}
