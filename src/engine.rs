//! Execution engine: the single place jobs are gated, locked, timed out and
//! their failures classified
//!
//! Transient RPC failures are counted across invocations; hitting the
//! configured threshold latches safe-mode until an operator clears it.

use crate::clock::now_ts;
use crate::store::{LockType, Store};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;

pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Substrings that mark a failure as a transient RPC problem
const RPC_TRANSIENT_PATTERNS: [&str; 5] =
    ["503", "429", "timeout", "ECONNREFUSED", "fetch failed"];

pub fn is_transient_rpc_error(message: &str) -> bool {
    RPC_TRANSIENT_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// A schedulable unit of work protected by a durable lock
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;
    fn lock_type(&self) -> LockType;
    fn timeout_ms(&self) -> u64;
    /// Runs to a human-readable summary; every external call inside is an
    /// await point and therefore a cancellation point
    async fn run(&self) -> Result<String, JobError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(String),
    Skipped(String),
    TimedOut,
    Failed(String),
}

pub struct ExecutionEngine {
    store: Store,
    max_rpc_errors: u32,
}

impl ExecutionEngine {
    pub fn new(store: Store, max_rpc_errors: u32) -> Self {
        Self {
            store,
            max_rpc_errors,
        }
    }

    pub async fn execute(&self, job: &dyn Job) -> JobOutcome {
        // Gate: latched safe-mode skips everything
        match self.store.is_safe_mode() {
            Ok(true) => {
                let reason = self
                    .store
                    .safe_mode_reason()
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| "unknown".to_string());
                log::warn!("⛔ {} skipped: safe mode latched ({})", job.name(), reason);
                return JobOutcome::Skipped(format!("safe mode latched: {}", reason));
            }
            Ok(false) => {}
            Err(e) => return JobOutcome::Failed(format!("safe mode check failed: {}", e)),
        }

        // Single-flight lock; a held lock is a clean skip
        match self
            .store
            .acquire_lock(job.lock_type(), now_ts(), std::process::id())
        {
            Ok(true) => {}
            Ok(false) => {
                log::info!("⏭️  {} skipped: lock held", job.name());
                return JobOutcome::Skipped("lock held".to_string());
            }
            Err(e) => return JobOutcome::Failed(format!("lock acquire failed: {}", e)),
        }

        let outcome = match timeout(Duration::from_millis(job.timeout_ms()), job.run()).await {
            // Deadline: the job future is dropped at its pending await point.
            // Not an RPC failure, so the counter is untouched.
            Err(_) => {
                log::error!("⏱️  {} timed out after {}ms", job.name(), job.timeout_ms());
                JobOutcome::TimedOut
            }
            Ok(Ok(summary)) => {
                if let Err(e) = self.store.set_rpc_error_count(0) {
                    log::warn!("⚠️  Could not reset RPC error counter: {}", e);
                }
                log::info!("✅ {}: {}", job.name(), summary);
                JobOutcome::Completed(summary)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                if is_transient_rpc_error(&message) {
                    self.count_rpc_error(&message);
                } else {
                    log::error!("❌ {} failed: {}", job.name(), message);
                }
                JobOutcome::Failed(message)
            }
        };

        if let Err(e) = self.store.release_lock(job.lock_type()) {
            log::warn!("⚠️  Lock release failed for {}: {}", job.lock_type(), e);
        }
        outcome
    }

    fn count_rpc_error(&self, message: &str) {
        let count = self.store.rpc_error_count().unwrap_or(0) + 1;
        if let Err(e) = self.store.set_rpc_error_count(count) {
            log::warn!("⚠️  Could not persist RPC error counter: {}", e);
        }
        log::error!(
            "❌ Transient RPC failure {}/{}: {}",
            count,
            self.max_rpc_errors,
            message
        );
        if count >= self.max_rpc_errors {
            let reason = format!("{} consecutive RPC errors", count);
            if let Err(e) = self.store.enter_safe_mode(&reason) {
                log::error!("❌ Could not latch safe mode: {}", e);
            } else {
                log::error!("🛑 Safe mode latched: {}", reason);
            }
        }
    }
}
