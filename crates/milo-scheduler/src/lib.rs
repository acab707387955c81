//! # Milo Scheduler
//!
//! Decides *when* a recurring report fires and delivers it to every active
//! recipient over a single transport session.
//!
//! ## Architecture
//! ```text
//! SchedulerRegistry
//!   └── TriggerScheduler (one tokio task per report schedule)
//!         poll 60s → in window & not fired? → mark fired → DispatchPipeline
//!         └── sleep until next occurrence (interruptible: shutdown / reload)
//!
//! DispatchPipeline (scheduler + manual trigger)
//!   ├── RecipientSource → active recipients for (report_type, scope)
//!   ├── DispatchLocks   → one batch per report type at a time
//!   └── BulkDispatcher
//!         ├── dedup (case-insensitive email, first wins)
//!         ├── connect + authenticate (once, one reconnect on disconnect)
//!         ├── render → send, per recipient, in order
//!         ├── close (always)
//!         └── DispatchLedger.record_sent(sent only)
//! ```

pub mod dispatch;
pub mod engine;
pub mod locks;
pub mod persistence;
pub mod pipeline;
pub mod recurrence;

#[cfg(test)]
mod testing;

pub use dispatch::BulkDispatcher;
pub use engine::{Clock, SchedulerOptions, SchedulerRegistry, SchedulerState, SystemClock, TriggerScheduler};
pub use locks::DispatchLocks;
pub use persistence::{NewRecipient, RecipientUpdate, ReportDb};
pub use pipeline::{DispatchPipeline, LockMode, ReportDispatch};
