//! Error Classifier
//!
//! Maps raw failures into categories that tell callers whether to retry,
//! heal or surface the error. Nothing here acts on the category; the
//! facade and healing flow decide.
//!
//! Classification is by lowercase substring on the error text, checked in
//! a fixed order. The order matters: a message mentioning both "decrypt" and
//! "identity" is an encryption error.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::EngineError;

/// Observations kept for diagnostics
const RECENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Decrypt/MAC failures and anything unrecognized
    Encryption,
    /// Missing session; re-establish it
    Healing,
    /// Identity problems; re-verify, never auto-trust
    Validation,
    /// Transport failures; retry with backoff
    Network,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Encryption => "encryption",
            ErrorCategory::Healing => "healing",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Network => "network",
        }
    }

    /// What a caller is expected to do about it
    pub fn default_action(&self) -> RecoveryAction {
        match self {
            ErrorCategory::Encryption => RecoveryAction::Surface,
            ErrorCategory::Healing => RecoveryAction::ReestablishSession,
            ErrorCategory::Validation => RecoveryAction::ReverifyKeys,
            ErrorCategory::Network => RecoveryAction::RetryWithBackoff,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Show the failure; do not retry the same ciphertext
    Surface,
    ReestablishSession,
    ReverifyKeys,
    RetryWithBackoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
    /// Identity-layer corruption; needs the healing flow and the user
    Critical,
}

/// Where an error happened
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub peer: Option<String>,
    pub operation: String,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            peer: None,
            operation: operation.into(),
        }
    }

    pub fn with_peer(mut self, peer: impl fmt::Display) -> Self {
        self.peer = Some(peer.to_string());
        self
    }
}

/// One recorded failure
#[derive(Debug, Clone)]
pub struct ErrorObservation {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub context: ErrorContext,
    pub at: DateTime<Utc>,
}

/// Categorize an error message
pub fn classify_message(message: &str) -> ErrorCategory {
    let message = message.to_lowercase();
    if message.contains("decrypt") || message.contains("mac") {
        ErrorCategory::Encryption
    } else if message.contains("no session") {
        ErrorCategory::Healing
    } else if message.contains("identity") || message.contains("untrusted") {
        ErrorCategory::Validation
    } else if message.contains("network") || message.contains("timeout") {
        ErrorCategory::Network
    } else {
        ErrorCategory::Encryption
    }
}

/// Categorize an engine error; transport failures are recognized by kind
pub fn classify(error: &EngineError) -> ErrorCategory {
    if error.is_network() {
        ErrorCategory::Network
    } else {
        classify_message(&error.to_string())
    }
}

pub fn severity_of(error: &EngineError, category: ErrorCategory) -> Severity {
    match (error, category) {
        (EngineError::IdentityCorrupted(_), _) => Severity::Critical,
        (_, ErrorCategory::Network) | (_, ErrorCategory::Healing) => Severity::Warning,
        _ => Severity::Error,
    }
}

#[derive(Default)]
struct ClassifierLog {
    recent: VecDeque<ErrorObservation>,
    counts: HashMap<ErrorCategory, u64>,
}

/// Records classified failures
#[derive(Default)]
pub struct ErrorClassifier {
    log: Mutex<ClassifierLog>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify and record `error`
    pub fn record(&self, error: &EngineError, context: ErrorContext) -> ErrorObservation {
        let category = classify(error);
        let severity = severity_of(error, category);
        self.record_with(category, severity, error.to_string(), context)
    }

    /// Record an observation whose category and severity are already known
    pub fn record_with(
        &self,
        category: ErrorCategory,
        severity: Severity,
        message: String,
        context: ErrorContext,
    ) -> ErrorObservation {
        let observation = ErrorObservation {
            category,
            severity,
            message,
            context,
            at: Utc::now(),
        };

        let peer = observation.context.peer.as_deref().unwrap_or("-");
        match severity {
            Severity::Critical => tracing::error!(
                category = %category,
                operation = %observation.context.operation,
                peer,
                "CRITICAL crypto error: {}",
                observation.message
            ),
            Severity::Error => tracing::error!(
                category = %category,
                operation = %observation.context.operation,
                peer,
                "Crypto error: {}",
                observation.message
            ),
            Severity::Warning => tracing::warn!(
                category = %category,
                operation = %observation.context.operation,
                peer,
                "Crypto warning: {}",
                observation.message
            ),
        }

        if let Ok(mut log) = self.log.lock() {
            *log.counts.entry(category).or_insert(0) += 1;
            if log.recent.len() == RECENT_CAPACITY {
                log.recent.pop_front();
            }
            log.recent.push_back(observation.clone());
        }
        observation
    }

    /// Recent observations, oldest first
    pub fn recent(&self) -> Vec<ErrorObservation> {
        self.log
            .lock()
            .map(|log| log.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, category: ErrorCategory) -> u64 {
        self.log
            .lock()
            .map(|log| log.counts.get(&category).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn has_critical(&self) -> bool {
        self.recent().iter().any(|o| o.severity == Severity::Critical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoError;

    #[test]
    fn test_message_classification_table() {
        assert_eq!(classify_message("Decryption failed: bad padding"), ErrorCategory::Encryption);
        assert_eq!(classify_message("Bad MAC: AES-GCM"), ErrorCategory::Encryption);
        assert_eq!(classify_message("No session for peer: bob.1"), ErrorCategory::Healing);
        assert_eq!(classify_message("Untrusted identity for peer"), ErrorCategory::Validation);
        assert_eq!(classify_message("Network error: Request timeout"), ErrorCategory::Network);
        assert_eq!(classify_message("something odd"), ErrorCategory::Encryption);
    }

    #[test]
    fn test_classification_order_is_significant() {
        // Decrypt wins over identity, no session wins over network
        assert_eq!(
            classify_message("decrypt failed after identity change"),
            ErrorCategory::Encryption
        );
        assert_eq!(
            classify_message("no session: network timeout"),
            ErrorCategory::Healing
        );
    }

    #[test]
    fn test_engine_error_classification_and_severity() {
        let network = EngineError::Network("connection refused".to_string());
        assert_eq!(classify(&network), ErrorCategory::Network);
        assert_eq!(severity_of(&network, ErrorCategory::Network), Severity::Warning);

        let no_session = EngineError::NoSession("bob.1".to_string());
        assert_eq!(classify(&no_session), ErrorCategory::Healing);

        let untrusted: EngineError = CryptoError::UntrustedIdentity("bob.1".to_string()).into();
        assert_eq!(classify(&untrusted), ErrorCategory::Validation);
        assert_eq!(ErrorCategory::Validation.default_action(), RecoveryAction::ReverifyKeys);

        let corrupted = EngineError::IdentityCorrupted("bad record".to_string());
        let category = classify(&corrupted);
        assert_eq!(category, ErrorCategory::Validation);
        assert_eq!(severity_of(&corrupted, category), Severity::Critical);
    }

    #[test]
    fn test_log_is_bounded_and_counted() {
        let classifier = ErrorClassifier::new();
        for i in 0..(RECENT_CAPACITY + 5) {
            classifier.record(
                &EngineError::NoSession(format!("peer.{}", i)),
                ErrorContext::new("encrypt").with_peer(format!("peer.{}", i)),
            );
        }
        let recent = classifier.recent();
        assert_eq!(recent.len(), RECENT_CAPACITY);
        assert_eq!(recent[0].context.peer.as_deref(), Some("peer.5"));
        assert_eq!(classifier.count(ErrorCategory::Healing), (RECENT_CAPACITY + 5) as u64);
        assert!(!classifier.has_critical());

        classifier.record(
            &EngineError::IdentityCorrupted("unreadable".to_string()),
            ErrorContext::new("ensure_identity"),
        );
        assert!(classifier.has_critical());
    }
}
