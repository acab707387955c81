//! Collaborator traits — the seams between the dispatch engine and the outside world.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{DispatchRun, Message, RecipientRecord, ScheduleConfig, ScheduleKey};

/// A connect/authenticate/send channel owned by exactly one batch.
///
/// Implementations must tolerate `connect` being called again after a
/// disconnect (one reconnect per batch) and `close` on a half-open session.
#[async_trait]
pub trait TransportSession: Send {
    /// Short name for logs ("smtp", "memory").
    fn name(&self) -> &str;

    /// Open the underlying connection.
    async fn connect(&mut self) -> Result<()>;

    /// Authenticate on the open connection.
    async fn authenticate(&mut self) -> Result<()>;

    /// Deliver one message to one recipient.
    async fn send(&mut self, recipient: &RecipientRecord, message: &Message) -> Result<()>;

    /// Liveness check, used after a failed send.
    async fn is_connected(&mut self) -> bool;

    /// Release the connection. Must be safe to call on a never-opened session.
    async fn close(&mut self);
}

/// Creates a fresh, unopened session for each batch.
pub trait SessionFactory: Send + Sync {
    fn create(&self) -> Box<dyn TransportSession>;
}

/// Yields recipients for a report, optionally scoped to a project.
#[async_trait]
pub trait RecipientSource: Send + Sync {
    async fn active_recipients(&self, report_type: &str, scope: Option<i64>)
    -> Result<Vec<RecipientRecord>>;
}

/// Receives `last_sent_at` write-backs for recipients that were actually notified.
#[async_trait]
pub trait DispatchLedger: Send + Sync {
    async fn record_sent(&self, updates: &[(i64, DateTime<Utc>)]) -> Result<()>;
}

/// Append-only history of finished batches.
#[async_trait]
pub trait RunHistory: Send + Sync {
    /// Store one run, returning its id.
    async fn record_run(&self, run: &DispatchRun) -> Result<i64>;
}

/// Read/write access to schedule configuration.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Snapshot of one schedule, `None` if it was never configured.
    async fn load_schedule(&self, key: &ScheduleKey) -> Result<Option<ScheduleConfig>>;

    /// All configured schedules (active or not).
    async fn list_schedules(&self) -> Result<Vec<ScheduleConfig>>;

    /// Persist the idempotency marker for a fired schedule.
    async fn mark_fired(&self, key: &ScheduleKey, at: DateTime<Utc>) -> Result<()>;
}

/// Pure function from recipient (and scope) to rendered message.
pub trait ContentRenderer: Send + Sync {
    fn render(&self, recipient: &RecipientRecord, scope: Option<i64>) -> Result<Message>;
}

impl<F> ContentRenderer for F
where
    F: Fn(&RecipientRecord, Option<i64>) -> Result<Message> + Send + Sync,
{
    fn render(&self, recipient: &RecipientRecord, scope: Option<i64>) -> Result<Message> {
        self(recipient, scope)
    }
}
