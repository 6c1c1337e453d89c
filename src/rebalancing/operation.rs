//! Rebalance operation lifecycle.
//!
//! ```text
//!  PLANNED ──start──► IN_PROGRESS ──complete──► COMPLETED
//!                          │
//!                        fail
//!                          ▼
//!                       FAILED ──rollback──► ROLLED_BACK
//! ```
//!
//! Every transition is a compare-and-swap on the current state, so a
//! second `start`, `complete` or `rollback` fails instead of repeating work.

use crate::error::{AuthError, Error, RebalanceError, Result};
use crate::types::{now_millis, ShardId, TokenRange};
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceState {
    Planned,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl RebalanceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RebalanceState::Planned,
            1 => RebalanceState::InProgress,
            2 => RebalanceState::Completed,
            3 => RebalanceState::Failed,
            _ => RebalanceState::RolledBack,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RebalanceState::Planned => 0,
            RebalanceState::InProgress => 1,
            RebalanceState::Completed => 2,
            RebalanceState::Failed => 3,
            RebalanceState::RolledBack => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceState::Planned => "PLANNED",
            RebalanceState::InProgress => "IN_PROGRESS",
            RebalanceState::Completed => "COMPLETED",
            RebalanceState::Failed => "FAILED",
            RebalanceState::RolledBack => "ROLLED_BACK",
        }
    }

    /// No further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RebalanceState::Completed | RebalanceState::RolledBack)
    }

    /// Planned or running.
    pub fn is_active(&self) -> bool {
        matches!(self, RebalanceState::Planned | RebalanceState::InProgress)
    }
}

impl fmt::Display for RebalanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory progress figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalanceProgress {
    pub records_migrated: u64,
    pub total_records: u64,
    pub bytes_transferred: u64,
    pub progress_percent: f64,
    pub started_at_ms: u64,
    /// Extrapolated from elapsed time and percent complete.
    pub estimated_completion_ms: Option<u64>,
}

/// Serializable view of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceStatus {
    pub id: String,
    pub source_shard_id: ShardId,
    pub target_shard_id: ShardId,
    pub range: TokenRange,
    pub state: RebalanceState,
    pub progress: RebalanceProgress,
    pub error_message: Option<String>,
    pub authorized_by: Option<String>,
    pub created_at_ms: u64,
}

pub type ProgressCallback = Box<dyn Fn(&RebalanceProgress) + Send + Sync>;

#[derive(Debug, Default)]
struct OperationDetails {
    progress: RebalanceProgress,
    error_message: Option<String>,
    authorized_by: Option<String>,
    /// Keys the copy added to the target; rollback deletes exactly these.
    created_keys: Vec<String>,
}

/// Moves `range` from `source` to `target`.
pub struct RebalanceOperation {
    id: String,
    source_shard_id: ShardId,
    target_shard_id: ShardId,
    range: TokenRange,
    created_at_ms: u64,
    state: AtomicU8,
    details: Mutex<OperationDetails>,
    callback: Mutex<Option<ProgressCallback>>,
}

impl RebalanceOperation {
    pub fn new(
        source_shard_id: impl Into<ShardId>,
        target_shard_id: impl Into<ShardId>,
        range: TokenRange,
    ) -> std::result::Result<Self, RebalanceError> {
        let source_shard_id = source_shard_id.into();
        let target_shard_id = target_shard_id.into();
        if source_shard_id.is_empty() || target_shard_id.is_empty() {
            return Err(RebalanceError::Invalid(
                "source and target shard ids must not be empty".into(),
            ));
        }
        if source_shard_id == target_shard_id {
            return Err(RebalanceError::Invalid(format!(
                "source and target are both {}",
                source_shard_id
            )));
        }
        if range.start >= range.end {
            return Err(RebalanceError::Invalid(format!("empty token range {}", range)));
        }

        let now = now_millis();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            source_shard_id,
            target_shard_id,
            range,
            created_at_ms: now,
            state: AtomicU8::new(RebalanceState::Planned.as_u8()),
            details: Mutex::new(OperationDetails {
                progress: RebalanceProgress {
                    started_at_ms: now,
                    ..Default::default()
                },
                ..Default::default()
            }),
            callback: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_shard_id(&self) -> &str {
        &self.source_shard_id
    }

    pub fn target_shard_id(&self) -> &str {
        &self.target_shard_id
    }

    pub fn range(&self) -> TokenRange {
        self.range
    }

    pub fn state(&self) -> RebalanceState {
        RebalanceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(
        &self,
        from: RebalanceState,
        to: RebalanceState,
    ) -> std::result::Result<(), RebalanceError> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| RebalanceError::InvalidTransition {
                from: RebalanceState::from_u8(actual).to_string(),
                to: to.to_string(),
            })?;
        info!(operation_id = %self.id, %from, %to, "Rebalance state changed");
        Ok(())
    }

    /// `PLANNED -> IN_PROGRESS`, after the operator signature checks out.
    pub fn start(&self, authorizer: &dyn OperatorAuthorizer, operator_signature: &str) -> Result<()> {
        let current = self.state();
        if current != RebalanceState::Planned {
            return Err(RebalanceError::InvalidTransition {
                from: current.to_string(),
                to: RebalanceState::InProgress.to_string(),
            }
            .into());
        }

        let operator = authorizer.authorize(self, operator_signature).map_err(|e| {
            warn!(operation_id = %self.id, reason = e.label(), "Rebalance authorization rejected");
            Error::Auth(e)
        })?;

        self.transition(RebalanceState::Planned, RebalanceState::InProgress)?;
        let mut details = self.details.lock();
        details.authorized_by = Some(operator);
        details.progress.started_at_ms = now_millis();
        Ok(())
    }

    /// `IN_PROGRESS -> COMPLETED`.
    pub fn complete(&self) -> std::result::Result<(), RebalanceError> {
        self.transition(RebalanceState::InProgress, RebalanceState::Completed)?;
        let mut details = self.details.lock();
        details.progress.progress_percent = 100.0;
        details.progress.estimated_completion_ms = Some(now_millis());
        Ok(())
    }

    /// `IN_PROGRESS -> FAILED`. Does not roll anything back.
    pub fn fail(&self, reason: impl Into<String>) -> std::result::Result<(), RebalanceError> {
        let reason = reason.into();
        self.transition(RebalanceState::InProgress, RebalanceState::Failed)?;
        warn!(operation_id = %self.id, %reason, "Rebalance failed");
        self.details.lock().error_message = Some(reason);
        Ok(())
    }

    /// `FAILED -> ROLLED_BACK`.
    pub fn rollback(&self) -> std::result::Result<(), RebalanceError> {
        self.transition(RebalanceState::Failed, RebalanceState::RolledBack)
    }

    pub fn error_message(&self) -> Option<String> {
        self.details.lock().error_message.clone()
    }

    pub fn progress(&self) -> RebalanceProgress {
        self.details.lock().progress.clone()
    }

    pub fn set_created_keys(&self, keys: Vec<String>) {
        self.details.lock().created_keys = keys;
    }

    /// Drain the keys recorded by [`set_created_keys`](Self::set_created_keys).
    pub fn take_created_keys(&self) -> Vec<String> {
        std::mem::take(&mut self.details.lock().created_keys)
    }

    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self.callback.lock() = Some(callback);
    }

    pub fn set_total_records(&self, total: u64) {
        self.details.lock().progress.total_records = total;
    }

    /// Record migration progress and recompute percent and ETA.
    pub fn update_progress(&self, records_migrated: u64, bytes_transferred: u64) {
        let snapshot = {
            let mut details = self.details.lock();
            let progress = &mut details.progress;
            progress.records_migrated = records_migrated;
            progress.bytes_transferred = bytes_transferred;

            if progress.total_records > 0 {
                progress.progress_percent =
                    (records_migrated as f64 / progress.total_records as f64 * 100.0).min(100.0);
                if progress.progress_percent > 0.0 {
                    let elapsed = now_millis().saturating_sub(progress.started_at_ms) as f64;
                    let total = elapsed * 100.0 / progress.progress_percent;
                    progress.estimated_completion_ms =
                        Some(progress.started_at_ms + total as u64);
                }
            }
            progress.clone()
        };

        if let Some(callback) = self.callback.lock().as_ref() {
            callback(&snapshot);
        }
    }

    /// Message an operator signs to authorize this operation.
    pub fn authorization_message(&self) -> String {
        format!(
            "rebalance|{}|{}|{}|{}|{}",
            self.id, self.source_shard_id, self.target_shard_id, self.range.start, self.range.end
        )
    }

    pub fn status(&self) -> RebalanceStatus {
        let details = self.details.lock();
        RebalanceStatus {
            id: self.id.clone(),
            source_shard_id: self.source_shard_id.clone(),
            target_shard_id: self.target_shard_id.clone(),
            range: self.range,
            state: self.state(),
            progress: details.progress.clone(),
            error_message: details.error_message.clone(),
            authorized_by: details.authorized_by.clone(),
            created_at_ms: self.created_at_ms,
        }
    }
}

impl fmt::Debug for RebalanceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RebalanceOperation")
            .field("id", &self.id)
            .field("source", &self.source_shard_id)
            .field("target", &self.target_shard_id)
            .field("range", &self.range)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Operator authorization
// ============================================================================

/// Decides whether an operator may start a rebalance.
pub trait OperatorAuthorizer: Send + Sync {
    /// Returns the operator id on success.
    fn authorize(
        &self,
        operation: &RebalanceOperation,
        signature: &str,
    ) -> std::result::Result<String, AuthError>;
}

/// Operators identified by Ed25519 keys.
///
/// The signature string is `operator_id:base64(sig)` where `sig` signs
/// [`RebalanceOperation::authorization_message`].
#[derive(Debug, Default)]
pub struct Ed25519OperatorAuthorizer {
    operators: RwLock<HashMap<String, VerifyingKey>>,
}

impl Ed25519OperatorAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_operator(&self, operator_id: impl Into<String>, key: VerifyingKey) {
        self.operators.write().insert(operator_id.into(), key);
    }

    pub fn remove_operator(&self, operator_id: &str) -> bool {
        self.operators.write().remove(operator_id).is_some()
    }

    /// Produce the signature string for `operation`.
    pub fn sign(operator_id: &str, key: &SigningKey, operation: &RebalanceOperation) -> String {
        let signature = key.sign(operation.authorization_message().as_bytes());
        format!("{}:{}", operator_id, Base64.encode(signature.to_bytes()))
    }
}

impl OperatorAuthorizer for Ed25519OperatorAuthorizer {
    fn authorize(
        &self,
        operation: &RebalanceOperation,
        signature: &str,
    ) -> std::result::Result<String, AuthError> {
        let (operator_id, encoded) = signature
            .split_once(':')
            .filter(|(id, sig)| !id.is_empty() && !sig.is_empty())
            .ok_or_else(|| AuthError::Unauthorized("missing operator signature".into()))?;

        let key = self
            .operators
            .read()
            .get(operator_id)
            .copied()
            .ok_or_else(|| AuthError::Unauthorized(format!("unknown operator {}", operator_id)))?;

        let raw = Base64
            .decode(encoded.as_bytes())
            .map_err(|e| AuthError::MalformedSignature(e.to_string()))?;
        let signature =
            Signature::from_slice(&raw).map_err(|e| AuthError::MalformedSignature(e.to_string()))?;
        key.verify_strict(operation.authorization_message().as_bytes(), &signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        Ok(operator_id.to_string())
    }
}
