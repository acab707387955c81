//! In-memory fakes shared by the scheduler tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use milo_core::error::{MiloError, Result};
use milo_core::traits::{
    DispatchLedger, RecipientSource, ScheduleStore, SessionFactory, TransportSession,
};
use milo_core::types::{
    DEFAULT_REPORT_TYPE, DispatchBatchResult, Message, RecipientRecord, RunTrigger, ScheduleConfig,
    ScheduleKey,
};

use crate::pipeline::ReportDispatch;

pub fn recipient(id: i64, email: &str) -> RecipientRecord {
    RecipientRecord {
        id,
        email: email.into(),
        name: format!("User {id}"),
        report_type: DEFAULT_REPORT_TYPE.into(),
        scope: None,
        active: true,
        last_sent_at: None,
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SendBehaviour {
    /// Server rejects the message, connection stays up.
    Reject,
    /// Send fails and the connection is gone.
    Disconnect,
    /// Send never completes.
    Hang,
}

#[derive(Default)]
pub struct MockSession {
    pub connect_calls: usize,
    pub auth_calls: usize,
    pub close_calls: usize,
    pub liveness_checks: usize,
    /// Every send attempt, in order.
    pub sent_to: Vec<String>,
    connected: bool,
    behaviours: HashMap<String, SendBehaviour>,
    fail_connect_on: Option<usize>,
    fail_auth: bool,
    hang_connect: bool,
    delivered: Option<Arc<Mutex<Vec<String>>>>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_send(mut self, email: &str, behaviour: SendBehaviour) -> Self {
        self.behaviours.insert(email.to_string(), behaviour);
        self
    }

    /// Fail the n-th connect call (1-based).
    pub fn fail_connect_on(mut self, nth: usize) -> Self {
        self.fail_connect_on = Some(nth);
        self
    }

    pub fn fail_auth(mut self) -> Self {
        self.fail_auth = true;
        self
    }

    pub fn hang_connect(mut self) -> Self {
        self.hang_connect = true;
        self
    }
}

#[async_trait]
impl TransportSession for MockSession {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&mut self) -> Result<()> {
        self.connect_calls += 1;
        if self.hang_connect {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.fail_connect_on == Some(self.connect_calls) {
            self.connected = false;
            return Err(MiloError::connection("connection refused"));
        }
        self.connected = true;
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<()> {
        self.auth_calls += 1;
        if self.fail_auth {
            return Err(MiloError::auth("535 bad credentials"));
        }
        Ok(())
    }

    async fn send(&mut self, recipient: &RecipientRecord, _message: &Message) -> Result<()> {
        self.sent_to.push(recipient.email.clone());
        match self.behaviours.get(&recipient.email).copied() {
            Some(SendBehaviour::Reject) => Err(MiloError::send("550 mailbox unavailable")),
            Some(SendBehaviour::Disconnect) => {
                self.connected = false;
                Err(MiloError::send("connection reset"))
            }
            Some(SendBehaviour::Hang) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
            None => {
                if let Some(log) = &self.delivered {
                    log.lock().unwrap().push(recipient.email.clone());
                }
                Ok(())
            }
        }
    }

    async fn is_connected(&mut self) -> bool {
        self.liveness_checks += 1;
        self.connected
    }

    async fn close(&mut self) {
        self.close_calls += 1;
        self.connected = false;
    }
}

/// Hands out fresh mock sessions and records what they delivered.
#[derive(Default)]
pub struct MockFactory {
    pub created: AtomicUsize,
    pub delivered: Arc<Mutex<Vec<String>>>,
    pub refuse_connect: bool,
}

impl MockFactory {
    pub fn refusing() -> Self {
        Self {
            refuse_connect: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

impl SessionFactory for MockFactory {
    fn create(&self) -> Box<dyn TransportSession> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut session = MockSession::new();
        session.delivered = Some(self.delivered.clone());
        if self.refuse_connect {
            session = session.fail_connect_on(1);
        }
        Box::new(session)
    }
}

#[derive(Default)]
pub struct MockLedger {
    batches: Mutex<Vec<Vec<(i64, DateTime<Utc>)>>>,
    failing: bool,
}

impl MockLedger {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn sent_ids(&self) -> Vec<i64> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|(id, _)| *id)
            .collect()
    }
}

#[async_trait]
impl DispatchLedger for MockLedger {
    async fn record_sent(&self, updates: &[(i64, DateTime<Utc>)]) -> Result<()> {
        self.batches.lock().unwrap().push(updates.to_vec());
        if self.failing {
            return Err(MiloError::database("disk I/O error"));
        }
        Ok(())
    }
}

/// Static recipient list keyed by report type.
#[derive(Default)]
pub struct MemoryRecipients {
    pub recipients: Vec<RecipientRecord>,
    pub fail: bool,
}

impl MemoryRecipients {
    pub fn new(recipients: Vec<RecipientRecord>) -> Self {
        Self {
            recipients,
            fail: false,
        }
    }
}

#[async_trait]
impl RecipientSource for MemoryRecipients {
    async fn active_recipients(&self, report_type: &str, scope: Option<i64>) -> Result<Vec<RecipientRecord>> {
        if self.fail {
            return Err(MiloError::database("recipient table locked"));
        }
        Ok(self
            .recipients
            .iter()
            .filter(|r| r.report_type == report_type && r.active)
            .filter(|r| scope.is_none() || r.scope == scope)
            .cloned()
            .collect())
    }
}

/// Schedules held in memory; loads can be made to fail a number of times.
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: Mutex<HashMap<ScheduleKey, ScheduleConfig>>,
    failing_loads: AtomicUsize,
    pub marks: Mutex<Vec<(ScheduleKey, DateTime<Utc>)>>,
}

impl MemoryScheduleStore {
    pub fn with(schedules: Vec<ScheduleConfig>) -> Self {
        let store = Self::default();
        for schedule in schedules {
            store.put(schedule);
        }
        store
    }

    pub fn put(&self, schedule: ScheduleConfig) {
        self.schedules
            .lock()
            .unwrap()
            .insert(schedule.key(), schedule);
    }

    pub fn get(&self, key: &ScheduleKey) -> Option<ScheduleConfig> {
        self.schedules.lock().unwrap().get(key).cloned()
    }

    pub fn fail_next_loads(&self, n: usize) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    pub fn mark_count(&self) -> usize {
        self.marks.lock().unwrap().len()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn load_schedule(&self, key: &ScheduleKey) -> Result<Option<ScheduleConfig>> {
        let failing = self.failing_loads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_loads.store(failing - 1, Ordering::SeqCst);
            return Err(MiloError::database("database is locked"));
        }
        Ok(self.get(key))
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleConfig>> {
        Ok(self.schedules.lock().unwrap().values().cloned().collect())
    }

    async fn mark_fired(&self, key: &ScheduleKey, at: DateTime<Utc>) -> Result<()> {
        let mut schedules = self.schedules.lock().unwrap();
        let schedule = schedules
            .get_mut(key)
            .ok_or_else(|| MiloError::NotFound(key.to_string()))?;
        schedule.last_run_at = Some(at);
        self.marks.lock().unwrap().push((key.clone(), at));
        Ok(())
    }
}

/// One recorded pipeline invocation.
#[derive(Debug, Clone)]
pub struct DispatchCall {
    pub report_type: String,
    pub scope: Option<i64>,
    pub trigger: RunTrigger,
    /// The schedule's `last_run_at` as seen when dispatch started.
    pub marker_at_call: Option<DateTime<Utc>>,
}

/// Records calls instead of sending anything.
#[derive(Default)]
pub struct RecordingDispatch {
    pub calls: Mutex<Vec<DispatchCall>>,
    pub store: Option<Arc<MemoryScheduleStore>>,
    pub fail: bool,
}

impl RecordingDispatch {
    pub fn observing(store: Arc<MemoryScheduleStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<DispatchCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportDispatch for RecordingDispatch {
    async fn run(
        &self,
        report_type: &str,
        scope: Option<i64>,
        trigger: RunTrigger,
    ) -> Result<DispatchBatchResult> {
        let marker_at_call = self
            .store
            .as_ref()
            .and_then(|s| s.get(&ScheduleKey::new(report_type, scope)))
            .and_then(|s| s.last_run_at);
        self.calls.lock().unwrap().push(DispatchCall {
            report_type: report_type.to_string(),
            scope,
            trigger,
            marker_at_call,
        });
        if self.fail {
            return Err(MiloError::connection("smtp down"));
        }
        Ok(DispatchBatchResult {
            attempted: 1,
            sent: 1,
            ..Default::default()
        })
    }
}
