//! Bulk dispatch — one rendered message per active, deduplicated recipient
//! over a single transport session.
//!
//! Per-recipient failures (render errors, rejected sends, send timeouts) are
//! recorded and the batch moves on. Only connect/authenticate failures abort
//! the whole batch. A disconnect detected after a failed send gets exactly one
//! reconnect attempt.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use milo_core::error::{DispatchPhase, MiloError, Result};
use milo_core::traits::{ContentRenderer, DispatchLedger, TransportSession};
use milo_core::types::{DispatchBatchResult, DispatchOutcome, RecipientRecord};
use tokio::sync::watch;

/// Sends one batch. Stateless apart from its limits, so it can be reused.
#[derive(Debug, Clone)]
pub struct BulkDispatcher {
    op_timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl BulkDispatcher {
    pub fn new(op_timeout: Duration) -> Self {
        Self {
            op_timeout,
            shutdown: None,
        }
    }

    /// Stop between recipients once `true` is published on this channel.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Deliver to every eligible recipient. Never panics or returns early
    /// without closing an opened session.
    pub async fn dispatch(
        &self,
        session: &mut dyn TransportSession,
        recipients: &[RecipientRecord],
        scope: Option<i64>,
        renderer: &dyn ContentRenderer,
        ledger: &dyn DispatchLedger,
    ) -> DispatchBatchResult {
        let (eligible, mut outcomes) = dedup_eligible(recipients);

        if eligible.is_empty() {
            tracing::info!("📭 No eligible recipients — transport not opened");
            return DispatchBatchResult::from_outcomes(&outcomes, None);
        }

        tracing::info!(
            "📨 Dispatching to {} recipient(s) via {} ({} duplicate(s) skipped)",
            eligible.len(),
            session.name(),
            outcomes.len()
        );

        if self.shutdown_requested() {
            tracing::warn!("🛑 Shutdown requested, transport not opened");
            fail_remaining(&mut outcomes, &eligible, CANCELLED);
            return DispatchBatchResult::from_outcomes(&outcomes, None);
        }

        if let Err(e) = self.open(session).await {
            tracing::error!("❌ Transport unavailable, aborting batch: {e}");
            let reason = e.to_string();
            outcomes.extend(eligible.iter().map(|r| DispatchOutcome::failed(r, reason.clone())));
            session.close().await;
            return DispatchBatchResult::from_outcomes(&outcomes, Some(reason));
        }

        let (sent_updates, batch) = self.send_all(session, &eligible, scope, renderer).await;
        outcomes.extend(batch);
        session.close().await;

        if !sent_updates.is_empty()
            && let Err(e) = ledger.record_sent(&sent_updates).await
        {
            tracing::error!(
                "⚠️ Failed to record last_sent_at for {} recipient(s): {e}",
                sent_updates.len()
            );
        }

        let result = DispatchBatchResult::from_outcomes(&outcomes, None);
        tracing::info!(
            "✅ Batch done: attempted={} sent={} failed={} skipped_duplicate={}",
            result.attempted,
            result.sent,
            result.failed,
            result.skipped_duplicate
        );
        result
    }

    /// The send loop. Returns staged ledger updates plus one outcome per recipient.
    async fn send_all(
        &self,
        session: &mut dyn TransportSession,
        eligible: &[&RecipientRecord],
        scope: Option<i64>,
        renderer: &dyn ContentRenderer,
    ) -> (Vec<(i64, DateTime<Utc>)>, Vec<DispatchOutcome>) {
        let mut outcomes = Vec::with_capacity(eligible.len());
        let mut staged = Vec::new();
        let mut reconnected = false;

        for (idx, recipient) in eligible.iter().enumerate() {
            if self.shutdown_requested() {
                tracing::warn!(
                    "🛑 Shutdown requested — {} recipient(s) not attempted",
                    eligible.len() - idx
                );
                fail_remaining(&mut outcomes, &eligible[idx..], CANCELLED);
                break;
            }

            let message = match renderer.render(recipient, scope) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("⚠️ Render failed for {}: {e}", recipient.email);
                    outcomes.push(DispatchOutcome::failed(recipient, e.to_string()));
                    continue;
                }
            };

            let sent = self
                .timed(DispatchPhase::Send, session.send(recipient, &message))
                .await;
            let err = match sent {
                Ok(()) => {
                    let outcome = DispatchOutcome::sent(recipient);
                    staged.push((recipient.id, outcome.timestamp));
                    outcomes.push(outcome);
                    continue;
                }
                Err(e) => e,
            };

            tracing::warn!("⚠️ Send failed for {}: {err}", recipient.email);
            outcomes.push(DispatchOutcome::failed(recipient, err.to_string()));

            if self.still_connected(session).await {
                continue;
            }

            let remaining = &eligible[idx + 1..];
            if reconnected {
                tracing::error!("❌ Transport dropped again after reconnect — giving up");
                fail_remaining(&mut outcomes, remaining, "unreachable: transport disconnected");
                break;
            }

            reconnected = true;
            tracing::warn!("🔄 Transport disconnected — reconnecting once");
            if let Err(e) = self.open(session).await {
                tracing::error!("❌ Reconnect failed: {e}");
                fail_remaining(&mut outcomes, remaining, &format!("unreachable: {e}"));
                break;
            }
            tracing::info!("🔌 Reconnected, resuming with {} recipient(s)", remaining.len());
        }

        (staged, outcomes)
    }

    async fn open(&self, session: &mut dyn TransportSession) -> Result<()> {
        self.timed(DispatchPhase::Connect, session.connect()).await?;
        self.timed(DispatchPhase::Authenticate, session.authenticate())
            .await
    }

    async fn still_connected(&self, session: &mut dyn TransportSession) -> bool {
        tokio::time::timeout(self.op_timeout, session.is_connected())
            .await
            .unwrap_or(false)
    }

    async fn timed<F>(&self, phase: DispatchPhase, fut: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MiloError::timeout(phase, self.op_timeout)),
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// Keep active recipients, first occurrence of each email wins.
fn dedup_eligible(recipients: &[RecipientRecord]) -> (Vec<&RecipientRecord>, Vec<DispatchOutcome>) {
    let mut seen = HashSet::new();
    let mut eligible = Vec::new();
    let mut skipped = Vec::new();
    for recipient in recipients.iter().filter(|r| r.active) {
        if seen.insert(recipient.dedup_key()) {
            eligible.push(recipient);
        } else {
            tracing::debug!("Skipping duplicate recipient {}", recipient.email);
            skipped.push(DispatchOutcome::skipped(recipient));
        }
    }
    (eligible, skipped)
}

const CANCELLED: &str = "cancelled: shutdown in progress";

fn fail_remaining(outcomes: &mut Vec<DispatchOutcome>, remaining: &[&RecipientRecord], reason: &str) {
    outcomes.extend(remaining.iter().map(|r| DispatchOutcome::failed(r, reason)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockLedger, MockSession, SendBehaviour, recipient};
    use milo_core::types::Message;

    fn render_ok(r: &RecipientRecord, _scope: Option<i64>) -> Result<Message> {
        Ok(Message::new("Daily incidents", format!("Hello {}", r.name)))
    }

    fn dispatcher() -> BulkDispatcher {
        BulkDispatcher::new(Duration::from_millis(200))
    }

    fn three() -> Vec<RecipientRecord> {
        vec![
            recipient(1, "one@x.com"),
            recipient(2, "two@x.com"),
            recipient(3, "three@x.com"),
        ]
    }

    fn assert_invariant(result: &DispatchBatchResult) {
        assert_eq!(
            result.attempted,
            result.sent + result.failed + result.skipped_duplicate
        );
    }

    #[tokio::test]
    async fn test_all_sent_single_session() {
        let mut session = MockSession::new();
        let ledger = MockLedger::default();
        let result = dispatcher()
            .dispatch(&mut session, &three(), None, &render_ok, &ledger)
            .await;

        assert_eq!(result.sent, 3);
        assert_eq!(result.failed, 0);
        assert_invariant(&result);
        assert_eq!(session.connect_calls, 1);
        assert_eq!(session.auth_calls, 1);
        assert_eq!(session.close_calls, 1);
        assert_eq!(ledger.calls(), 1);
        assert_eq!(ledger.sent_ids(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_case_insensitive_dedup_first_wins() {
        let recipients = vec![
            recipient(1, "A@x.com"),
            recipient(2, "a@x.com"),
            recipient(3, "b@x.com"),
        ];
        let mut session = MockSession::new();
        let ledger = MockLedger::default();
        let result = dispatcher()
            .dispatch(&mut session, &recipients, None, &render_ok, &ledger)
            .await;

        assert_eq!(result.skipped_duplicate, 1);
        assert_eq!(result.sent, 2);
        assert_eq!(result.attempted, 3);
        assert_invariant(&result);
        assert_eq!(session.sent_to, vec!["A@x.com".to_string(), "b@x.com".to_string()]);
        assert_eq!(ledger.sent_ids(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_inactive_recipients_filtered() {
        let mut recipients = three();
        recipients[1].active = false;
        let mut session = MockSession::new();
        let ledger = MockLedger::default();
        let result = dispatcher()
            .dispatch(&mut session, &recipients, None, &render_ok, &ledger)
            .await;

        assert_eq!(result.attempted, 2);
        assert_eq!(result.sent, 2);
        assert!(!session.sent_to.contains(&"two@x.com".to_string()));
    }

    #[tokio::test]
    async fn test_empty_eligible_never_connects() {
        let mut inactive = recipient(1, "one@x.com");
        inactive.active = false;

        for recipients in [vec![], vec![inactive]] {
            let mut session = MockSession::new();
            let ledger = MockLedger::default();
            let result = dispatcher()
                .dispatch(&mut session, &recipients, None, &render_ok, &ledger)
                .await;

            assert_eq!(result, DispatchBatchResult::default());
            assert_eq!(session.connect_calls, 0);
            assert_eq!(session.close_calls, 0);
            assert_eq!(ledger.calls(), 0);
        }
    }

    #[tokio::test]
    async fn test_transient_send_failure_no_reconnect() {
        let mut session = MockSession::new().on_send("two@x.com", SendBehaviour::Reject);
        let ledger = MockLedger::default();
        let result = dispatcher()
            .dispatch(&mut session, &three(), None, &render_ok, &ledger)
            .await;

        assert_eq!(result.sent, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failed_emails, vec!["two@x.com".to_string()]);
        assert_invariant(&result);
        assert_eq!(session.connect_calls, 1);
        assert_eq!(session.liveness_checks, 1);
        assert_eq!(session.close_calls, 1);
        assert_eq!(ledger.sent_ids(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_disconnect_then_successful_reconnect() {
        let mut session = MockSession::new().on_send("two@x.com", SendBehaviour::Disconnect);
        let ledger = MockLedger::default();
        let result = dispatcher()
            .dispatch(&mut session, &three(), None, &render_ok, &ledger)
            .await;

        assert_eq!(session.connect_calls, 2);
        assert_eq!(session.auth_calls, 2);
        assert_eq!(session.sent_to.last().map(String::as_str), Some("three@x.com"));
        assert_eq!(result.sent, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(session.close_calls, 1);
        assert_invariant(&result);
    }

    #[tokio::test]
    async fn test_disconnect_then_failed_reconnect_fails_remaining() {
        let mut recipients = three();
        recipients.push(recipient(4, "four@x.com"));
        let mut session = MockSession::new()
            .on_send("two@x.com", SendBehaviour::Disconnect)
            .fail_connect_on(2);
        let ledger = MockLedger::default();
        let result = dispatcher()
            .dispatch(&mut session, &recipients, None, &render_ok, &ledger)
            .await;

        assert_eq!(session.sent_to, vec!["one@x.com".to_string(), "two@x.com".to_string()]);
        assert_eq!(session.connect_calls, 2);
        assert_eq!(result.sent, 1);
        assert_eq!(result.failed, 3);
        assert_eq!(
            result.failed_emails,
            vec!["two@x.com".to_string(), "three@x.com".to_string(), "four@x.com".to_string()]
        );
        assert!(result.connection_error.is_none());
        assert_eq!(session.close_calls, 1);
        assert_eq!(ledger.sent_ids(), vec![1]);
        assert_invariant(&result);
    }

    #[tokio::test]
    async fn test_second_disconnect_does_not_reconnect_again() {
        let mut session = MockSession::new()
            .on_send("one@x.com", SendBehaviour::Disconnect)
            .on_send("two@x.com", SendBehaviour::Disconnect);
        let ledger = MockLedger::default();
        let result = dispatcher()
            .dispatch(&mut session, &three(), None, &render_ok, &ledger)
            .await;

        assert_eq!(session.connect_calls, 2);
        assert_eq!(result.sent, 0);
        assert_eq!(result.failed, 3);
        assert_eq!(session.sent_to.len(), 2);
        assert_eq!(ledger.calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_aborts_batch() {
        let mut session = MockSession::new().fail_connect_on(1);
        let ledger = MockLedger::default();
        let result = dispatcher()
            .dispatch(&mut session, &three(), None, &render_ok, &ledger)
            .await;

        assert_eq!(result.attempted, 3);
        assert_eq!(result.failed, 3);
        assert_eq!(result.sent, 0);
        assert!(result.connection_error.is_some());
        assert!(result.is_delivery_failure());
        assert!(session.sent_to.is_empty());
        assert_eq!(session.auth_calls, 0);
        assert_eq!(session.close_calls, 1);
        assert_eq!(ledger.calls(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_batch() {
        let mut session = MockSession::new().fail_auth();
        let ledger = MockLedger::default();
        let result = dispatcher()
            .dispatch(&mut session, &three(), None, &render_ok, &ledger)
            .await;

        assert_eq!(result.failed, 3);
        assert!(result.connection_error.as_deref().unwrap_or("").contains("Authentication"));
        assert!(session.sent_to.is_empty());
        assert_eq!(session.close_calls, 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_is_connection_error() {
        let mut session = MockSession::new().hang_connect();
        let ledger = MockLedger::default();
        let result = BulkDispatcher::new(Duration::from_millis(20))
            .dispatch(&mut session, &three(), None, &render_ok, &ledger)
            .await;

        assert_eq!(result.failed, 3);
        assert!(result.connection_error.as_deref().unwrap_or("").contains("connect"));
        assert_eq!(session.close_calls, 1);
    }

    #[tokio::test]
    async fn test_send_timeout_is_per_recipient() {
        let mut session = MockSession::new().on_send("two@x.com", SendBehaviour::Hang);
        let ledger = MockLedger::default();
        let result = BulkDispatcher::new(Duration::from_millis(20))
            .dispatch(&mut session, &three(), None, &render_ok, &ledger)
            .await;

        assert_eq!(result.sent, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failed_emails, vec!["two@x.com".to_string()]);
        assert_eq!(session.connect_calls, 1);
    }

    #[tokio::test]
    async fn test_render_failure_never_reconnects() {
        let render = |r: &RecipientRecord, scope: Option<i64>| {
            if r.id == 2 {
                Err(MiloError::render("template missing"))
            } else {
                render_ok(r, scope)
            }
        };
        let mut session = MockSession::new();
        let ledger = MockLedger::default();
        let result = dispatcher()
            .dispatch(&mut session, &three(), None, &render, &ledger)
            .await;

        assert_eq!(result.sent, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(session.connect_calls, 1);
        assert_eq!(session.liveness_checks, 0);
        assert_eq!(ledger.sent_ids(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_shutdown_finishes_current_send_then_stops() {
        let (tx, rx) = watch::channel(false);
        // Flip the shutdown flag while the first recipient is in flight.
        let render = move |r: &RecipientRecord, scope: Option<i64>| {
            if r.id == 1 {
                let _ = tx.send(true);
            }
            render_ok(r, scope)
        };
        let mut session = MockSession::new();
        let ledger = MockLedger::default();
        let result = dispatcher()
            .with_shutdown(rx)
            .dispatch(&mut session, &three(), None, &render, &ledger)
            .await;

        assert_eq!(session.sent_to, vec!["one@x.com".to_string()]);
        assert_eq!(result.sent, 1);
        assert_eq!(result.failed, 2);
        assert_eq!(session.close_calls, 1);
        assert_eq!(ledger.sent_ids(), vec![1]);
        assert_invariant(&result);
    }

    #[tokio::test]
    async fn test_shutdown_before_batch_never_connects() {
        let (_tx, rx) = watch::channel(true);
        let mut session = MockSession::new();
        let ledger = MockLedger::default();
        let result = dispatcher()
            .with_shutdown(rx)
            .dispatch(&mut session, &three(), None, &render_ok, &ledger)
            .await;

        assert_eq!(session.connect_calls, 0);
        assert_eq!(session.auth_calls, 0);
        assert_eq!(result.sent, 0);
        assert_eq!(result.failed, 3);
        assert!(result.connection_error.is_none());
        assert_eq!(ledger.calls(), 0);
        assert_invariant(&result);
    }

    #[tokio::test]
    async fn test_ledger_failure_does_not_change_counts() {
        let mut session = MockSession::new();
        let ledger = MockLedger::failing();
        let result = dispatcher()
            .dispatch(&mut session, &three(), None, &render_ok, &ledger)
            .await;
        assert_eq!(result.sent, 3);
        assert_eq!(ledger.calls(), 1);
    }
}
