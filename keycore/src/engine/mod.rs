//! Key lifecycle engine
//!
//! Managers for each key kind, the healing and maintenance layers on top of
//! them, and the [`CryptoService`] facade that wires everything for one
//! signed-in device.

pub mod classifier;
pub mod healing;
pub mod health;
pub mod key_manager;
pub mod maintenance;
pub mod observers;
pub mod sender_keys;
pub mod service;
pub mod session_manager;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::{ErrorCategory, ErrorClassifier, ErrorContext, ErrorObservation, Severity};
pub use healing::{HealingReason, HealingService, VerificationResult};
pub use health::{HealthCell, HealthRegistry, HealthStatus, KeyHealthState, KeyKind};
pub use key_manager::{IdentityOrigin, KeyManager, PoolOutcome};
pub use sender_keys::{RotationMetadata, SenderKeyManager};
pub use service::{CryptoService, LoginReport};
pub use session_manager::SessionManager;
