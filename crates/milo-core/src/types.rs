//! Domain types — schedules, recipients, messages, and dispatch outcomes.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::{MiloError, Result};

/// Report type used when none is given (the daily incident digest).
pub const DEFAULT_REPORT_TYPE: &str = "daily_incidents";

/// How often a scheduled report recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    Manual,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Manual => "manual",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = MiloError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(Frequency::Manual),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(MiloError::InvalidInput(format!("Unknown frequency: '{other}'"))),
        }
    }
}

/// Identifies one schedule: a report type, optionally scoped to a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleKey {
    pub report_type: String,
    pub scope: Option<i64>,
}

impl ScheduleKey {
    pub fn new(report_type: &str, scope: Option<i64>) -> Self {
        Self {
            report_type: report_type.to_string(),
            scope,
        }
    }
}

impl std::fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.scope {
            Some(scope) => write!(f, "{}@project:{}", self.report_type, scope),
            None => write!(f, "{}@all", self.report_type),
        }
    }
}

/// Recurrence configuration for one report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub report_type: String,
    pub scope: Option<i64>,
    pub frequency: Frequency,
    /// Local time of day ("HH:MM") the report should fire at.
    #[serde(with = "hhmm")]
    pub time_of_day: NaiveTime,
    /// 0 = Sunday .. 6 = Saturday, used by weekly schedules.
    pub weekday: Option<u32>,
    /// 1..31, used by monthly schedules. Clamped to short months.
    pub month_day: Option<u32>,
    pub active: bool,
    /// Persisted idempotency marker: when the schedule last fired.
    pub last_run_at: Option<DateTime<Utc>>,
}

impl ScheduleConfig {
    /// Defaults shown for a report that has never been scheduled.
    pub fn default_for(key: &ScheduleKey) -> Self {
        Self {
            report_type: key.report_type.clone(),
            scope: key.scope,
            frequency: Frequency::Manual,
            time_of_day: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            weekday: Some(1),
            month_day: Some(1),
            active: false,
            last_run_at: None,
        }
    }

    pub fn key(&self) -> ScheduleKey {
        ScheduleKey::new(&self.report_type, self.scope)
    }

    /// Whether the scheduler should consider this schedule at all.
    pub fn is_schedulable(&self) -> bool {
        self.active && self.frequency != Frequency::Manual
    }

    /// Check field consistency for the configured frequency.
    pub fn validate(&self) -> Result<()> {
        if self.report_type.trim().is_empty() {
            return Err(MiloError::InvalidInput("report_type is required".into()));
        }
        match self.frequency {
            Frequency::Weekly => match self.weekday {
                Some(d) if d <= 6 => Ok(()),
                Some(d) => Err(MiloError::InvalidInput(format!(
                    "weekday must be 0-6 (Sunday-Saturday), got {d}"
                ))),
                None => Err(MiloError::InvalidInput("weekly schedule needs a weekday".into())),
            },
            Frequency::Monthly => match self.month_day {
                Some(d) if (1..=31).contains(&d) => Ok(()),
                Some(d) => Err(MiloError::InvalidInput(format!(
                    "month_day must be 1-31, got {d}"
                ))),
                None => Err(MiloError::InvalidInput("monthly schedule needs a month_day".into())),
            },
            Frequency::Daily | Frequency::Manual => Ok(()),
        }
    }
}

/// Serde helper for "HH:MM" times.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    /// Parse "HH:MM" (or "HH:MM:SS").
    pub fn parse(raw: &str) -> Result<NaiveTime, String> {
        let raw = raw.trim();
        NaiveTime::parse_from_str(raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .map_err(|e| format!("Invalid time '{raw}' (expected HH:MM): {e}"))
    }
}

/// A notification target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub report_type: String,
    pub scope: Option<i64>,
    pub active: bool,
    pub last_sent_at: Option<DateTime<Utc>>,
}

impl RecipientRecord {
    /// Normalised email used for duplicate detection.
    pub fn dedup_key(&self) -> String {
        self.email.trim().to_lowercase()
    }
}

/// Rendered content for one recipient. Opaque to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

impl Message {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Per-recipient result inside one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeStatus {
    Sent,
    Failed(String),
    SkippedDuplicate,
}

/// What happened to one recipient in a batch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub recipient: RecipientRecord,
    pub status: OutcomeStatus,
    pub timestamp: DateTime<Utc>,
}

impl DispatchOutcome {
    pub fn sent(recipient: &RecipientRecord) -> Self {
        Self::with_status(recipient, OutcomeStatus::Sent)
    }

    pub fn failed(recipient: &RecipientRecord, reason: impl Into<String>) -> Self {
        Self::with_status(recipient, OutcomeStatus::Failed(reason.into()))
    }

    pub fn skipped(recipient: &RecipientRecord) -> Self {
        Self::with_status(recipient, OutcomeStatus::SkippedDuplicate)
    }

    fn with_status(recipient: &RecipientRecord, status: OutcomeStatus) -> Self {
        Self {
            recipient: recipient.clone(),
            status,
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate counts for one dispatch run. Returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchBatchResult {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped_duplicate: usize,
    pub failed_emails: Vec<String>,
    /// Set when the batch could not connect or authenticate at all.
    pub connection_error: Option<String>,
}

impl DispatchBatchResult {
    /// Fold a list of outcomes into counts.
    pub fn from_outcomes(outcomes: &[DispatchOutcome], connection_error: Option<String>) -> Self {
        let mut result = Self {
            attempted: outcomes.len(),
            connection_error,
            ..Self::default()
        };
        for outcome in outcomes {
            match &outcome.status {
                OutcomeStatus::Sent => result.sent += 1,
                OutcomeStatus::Failed(_) => {
                    result.failed += 1;
                    result.failed_emails.push(outcome.recipient.email.clone());
                }
                OutcomeStatus::SkippedDuplicate => result.skipped_duplicate += 1,
            }
        }
        result
    }

    /// True when nothing could be delivered because the transport never came up.
    pub fn is_delivery_failure(&self) -> bool {
        self.connection_error.is_some() && self.sent == 0
    }
}

/// What started a dispatch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }
}

impl std::str::FromStr for RunTrigger {
    type Err = MiloError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(RunTrigger::Scheduled),
            "manual" => Ok(RunTrigger::Manual),
            other => Err(MiloError::InvalidInput(format!("Unknown run trigger: '{other}'"))),
        }
    }
}

/// History row for one finished batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRun {
    #[serde(default)]
    pub id: i64,
    pub report_type: String,
    pub scope: Option<i64>,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub result: DispatchBatchResult,
}

/// Loose email syntax check used when recipients are added.
pub fn is_valid_email(email: &str) -> bool {
    static EMAIL_RE: OnceLock<Option<regex::Regex>> = OnceLock::new();
    let re = EMAIL_RE.get_or_init(|| regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok());
    email.len() <= 200 && re.as_ref().is_some_and(|re| re.is_match(email.trim()))
}
