//! Observable key health
//!
//! One [`HealthCell`] per key kind. Cells are never persisted; managers
//! rebuild them from the key store whenever they touch the kind. Subscribers
//! get a `watch` receiver and are woken on every update; dropping the
//! receiver unsubscribes.
//!
//! Cells also carry the in-progress flag for the maintenance action that
//! owns the kind. [`ActionGuard::try_begin`] is the only way to set it and
//! the returned token clears it on drop, so every exit path releases it.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Key kinds with their own health state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Identity,
    SignedPreKey,
    PreKeyPool,
    SenderKey,
    Session,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Identity => "identity",
            KeyKind::SignedPreKey => "signed_prekey",
            KeyKind::PreKeyPool => "prekey_pool",
            KeyKind::SenderKey => "sender_key",
            KeyKind::Session => "session",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthStatus {
    /// Not checked since startup
    #[default]
    Unknown,
    Healthy,
    /// Usable but needs maintenance (pool low, rotation due, stale sessions)
    Degraded,
    /// Last maintenance attempt failed
    Error,
}

/// Snapshot of one key kind's health
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyHealthState {
    /// Records of this kind (prekeys in the pool, groups, sessions...)
    pub count: u64,
    /// Sessions unused for longer than the staleness window
    pub stale: u64,
    /// Sessions with decrypt failures since their last success
    pub corrupted: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_rotation: Option<DateTime<Utc>>,
    pub status: HealthStatus,
    pub in_progress: bool,
    pub last_error: Option<String>,
    /// Current key fingerprint, for kinds that have a single current key
    pub fingerprint: Option<String>,
    /// Bumped each time the identity is replaced
    pub generation: u64,
    /// Raised when a sender key crossed its rotation threshold
    pub rotation_needed: bool,
}

/// Re-entrancy guard for one maintenance action
#[derive(Debug, Default)]
pub struct ActionGuard {
    busy: AtomicBool,
}

impl ActionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the action; `None` if a run is already in flight
    pub fn try_begin(&self) -> Option<GuardToken<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GuardToken { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the claimed action when dropped
#[derive(Debug)]
pub struct GuardToken<'a> {
    guard: &'a ActionGuard,
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

/// Observable health for one key kind
pub struct HealthCell {
    kind: KeyKind,
    state: watch::Sender<KeyHealthState>,
    guard: ActionGuard,
}

impl HealthCell {
    pub fn new(kind: KeyKind) -> Self {
        let (state, _) = watch::channel(KeyHealthState::default());
        Self {
            kind,
            state,
            guard: ActionGuard::new(),
        }
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn subscribe(&self) -> watch::Receiver<KeyHealthState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> KeyHealthState {
        self.state.borrow().clone()
    }

    /// Modify the state and notify every subscriber
    pub fn update(&self, f: impl FnOnce(&mut KeyHealthState)) {
        self.state.send_modify(f);
    }

    /// Record a successful check
    pub fn mark_checked(&self, count: u64, status: HealthStatus) {
        self.update(|state| {
            state.count = count;
            state.status = status;
            state.last_check = Some(Utc::now());
            state.last_error = None;
        });
    }

    pub fn mark_error(&self, error: &impl std::fmt::Display) {
        let message = error.to_string();
        tracing::error!(kind = self.kind.as_str(), "Key maintenance failed: {}", message);
        self.update(|state| {
            state.status = HealthStatus::Error;
            state.last_error = Some(message);
            state.last_check = Some(Utc::now());
        });
    }

    /// Claim this kind's maintenance action and publish the in-progress flag
    pub fn try_begin(&self) -> Option<InProgress<'_>> {
        let token = self.guard.try_begin()?;
        self.update(|state| state.in_progress = true);
        Some(InProgress {
            cell: self,
            _token: token,
        })
    }

    /// Claim the action, waiting for a run already in flight to finish
    pub async fn begin(&self) -> InProgress<'_> {
        loop {
            if let Some(running) = self.try_begin() {
                return running;
            }
            let mut rx = self.subscribe();
            let _ = rx.wait_for(|state| !state.in_progress).await;
            // The flag is published just before the token is released
            tokio::task::yield_now().await;
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.guard.is_busy()
    }
}

/// In-progress marker for a [`HealthCell`]; cleared on drop
pub struct InProgress<'a> {
    cell: &'a HealthCell,
    _token: GuardToken<'a>,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.cell.update(|state| state.in_progress = false);
    }
}

/// Health cells for every key kind
pub struct HealthRegistry {
    pub identity: HealthCell,
    pub signed_prekey: HealthCell,
    pub prekeys: HealthCell,
    pub sender_keys: HealthCell,
    pub sessions: HealthCell,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            identity: HealthCell::new(KeyKind::Identity),
            signed_prekey: HealthCell::new(KeyKind::SignedPreKey),
            prekeys: HealthCell::new(KeyKind::PreKeyPool),
            sender_keys: HealthCell::new(KeyKind::SenderKey),
            sessions: HealthCell::new(KeyKind::Session),
        }
    }

    pub fn get(&self, kind: KeyKind) -> &HealthCell {
        match kind {
            KeyKind::Identity => &self.identity,
            KeyKind::SignedPreKey => &self.signed_prekey,
            KeyKind::PreKeyPool => &self.prekeys,
            KeyKind::SenderKey => &self.sender_keys,
            KeyKind::Session => &self.sessions,
        }
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_rejects_reentry_and_releases_on_drop() {
        let guard = ActionGuard::new();
        let token = guard.try_begin();
        assert!(token.is_some());
        assert!(guard.try_begin().is_none());

        drop(token);
        assert!(guard.try_begin().is_some());
    }

    #[test]
    fn test_in_progress_flag_released_on_early_return() {
        let cell = HealthCell::new(KeyKind::PreKeyPool);

        fn failing(cell: &HealthCell) -> Result<(), &'static str> {
            let _running = cell.try_begin().ok_or("busy")?;
            Err("storage failure")
        }

        assert_eq!(failing(&cell), Err("storage failure"));
        assert!(!cell.is_in_progress());
        assert!(!cell.snapshot().in_progress);
    }

    #[tokio::test]
    async fn test_begin_waits_for_running_action() {
        let cell = std::sync::Arc::new(HealthCell::new(KeyKind::PreKeyPool));
        let running = cell.try_begin().unwrap();

        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move {
                let _running = cell.begin().await;
                cell.snapshot().in_progress
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(running);
        assert!(waiter.await.unwrap());
        assert!(!cell.is_in_progress());
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let cell = HealthCell::new(KeyKind::SenderKey);
        let mut rx = cell.subscribe();

        cell.mark_checked(3, HealthStatus::Healthy);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().count, 3);

        cell.mark_error(&"server unreachable");
        rx.changed().await.unwrap();
        let state = rx.borrow_and_update().clone();
        assert_eq!(state.status, HealthStatus::Error);
        assert_eq!(state.last_error.as_deref(), Some("server unreachable"));
    }
}
