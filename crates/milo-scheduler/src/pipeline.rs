//! Dispatch pipeline — recipients → lock → fresh session → BulkDispatcher → history.
//!
//! Shared by the scheduler loop and the manual trigger so both paths load
//! recipients, serialize batches, and record runs the same way.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use milo_core::error::Result;
use milo_core::traits::{ContentRenderer, DispatchLedger, RecipientSource, RunHistory, SessionFactory};
use milo_core::types::{DispatchBatchResult, DispatchRun, RunTrigger};
use tokio::sync::watch;

use crate::dispatch::BulkDispatcher;
use crate::locks::DispatchLocks;

/// What to do when another batch for the same report type is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Queue behind the running batch (scheduler).
    Wait,
    /// Return `DispatchInProgress` immediately (manual trigger).
    FailFast,
}

impl LockMode {
    pub fn for_trigger(trigger: RunTrigger) -> Self {
        match trigger {
            RunTrigger::Scheduled => LockMode::Wait,
            RunTrigger::Manual => LockMode::FailFast,
        }
    }
}

/// Runs one report batch. The scheduler and the HTTP gateway depend on this
/// rather than on the concrete pipeline.
#[async_trait]
pub trait ReportDispatch: Send + Sync {
    async fn run(
        &self,
        report_type: &str,
        scope: Option<i64>,
        trigger: RunTrigger,
    ) -> Result<DispatchBatchResult>;
}

pub struct DispatchPipeline {
    recipients: Arc<dyn RecipientSource>,
    ledger: Arc<dyn DispatchLedger>,
    sessions: Arc<dyn SessionFactory>,
    renderer: Arc<dyn ContentRenderer>,
    history: Option<Arc<dyn RunHistory>>,
    locks: Arc<DispatchLocks>,
    dispatcher: BulkDispatcher,
}

impl DispatchPipeline {
    pub fn new(
        recipients: Arc<dyn RecipientSource>,
        ledger: Arc<dyn DispatchLedger>,
        sessions: Arc<dyn SessionFactory>,
        renderer: Arc<dyn ContentRenderer>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            recipients,
            ledger,
            sessions,
            renderer,
            history: None,
            locks: Arc::new(DispatchLocks::new()),
            dispatcher: BulkDispatcher::new(op_timeout),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn RunHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_locks(mut self, locks: Arc<DispatchLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.dispatcher = self.dispatcher.with_shutdown(shutdown);
        self
    }

    pub fn locks(&self) -> &Arc<DispatchLocks> {
        &self.locks
    }

    async fn record(&self, run: DispatchRun) {
        let Some(history) = &self.history else {
            return;
        };
        if let Err(e) = history.record_run(&run).await {
            tracing::warn!("⚠️ Failed to record dispatch run for {}: {e}", run.report_type);
        }
    }
}

#[async_trait]
impl ReportDispatch for DispatchPipeline {
    async fn run(
        &self,
        report_type: &str,
        scope: Option<i64>,
        trigger: RunTrigger,
    ) -> Result<DispatchBatchResult> {
        let _guard = match LockMode::for_trigger(trigger) {
            LockMode::Wait => self.locks.acquire(report_type).await,
            LockMode::FailFast => self.locks.try_acquire(report_type)?,
        };

        let started_at = Utc::now();
        let recipients = self.recipients.active_recipients(report_type, scope).await?;
        tracing::info!(
            "📬 {} dispatch of '{}' (scope: {:?}) — {} recipient(s)",
            trigger.as_str(),
            report_type,
            scope,
            recipients.len()
        );

        let mut session = self.sessions.create();
        let result = self
            .dispatcher
            .dispatch(
                session.as_mut(),
                &recipients,
                scope,
                self.renderer.as_ref(),
                self.ledger.as_ref(),
            )
            .await;

        self.record(DispatchRun {
            id: 0,
            report_type: report_type.to_string(),
            scope,
            trigger,
            started_at,
            finished_at: Utc::now(),
            result: result.clone(),
        })
        .await;

        Ok(result)
    }
}
