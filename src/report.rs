//! Plain report renderer used by the binary.
//!
//! Report *content* (incident tables, charts) is composed elsewhere; this
//! renders the notification envelope each recipient receives.

use chrono::{FixedOffset, NaiveDate, Utc};
use milo_core::error::{MiloError, Result};
use milo_core::traits::ContentRenderer;
use milo_core::types::{Message, RecipientRecord};

pub struct ReportRenderer {
    utc_offset: FixedOffset,
    dashboard_url: Option<String>,
}

impl ReportRenderer {
    pub fn new(utc_offset: FixedOffset) -> Self {
        Self {
            utc_offset,
            dashboard_url: None,
        }
    }

    pub fn with_dashboard_url(mut self, url: impl Into<String>) -> Self {
        self.dashboard_url = Some(url.into());
        self
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.utc_offset).date_naive()
    }

    fn render_for(&self, recipient: &RecipientRecord, scope: Option<i64>, date: NaiveDate) -> Result<Message> {
        if recipient.report_type.trim().is_empty() {
            return Err(MiloError::render(format!(
                "recipient {} has no report type",
                recipient.email
            )));
        }

        let title = report_title(&recipient.report_type);
        let scope_label = match scope {
            Some(project) => format!("Project #{project}"),
            None => "All projects".to_string(),
        };
        let greeting = if recipient.name.trim().is_empty() {
            "Hello".to_string()
        } else {
            format!("Hello {}", escape_html(recipient.name.trim()))
        };
        let link = self
            .dashboard_url
            .as_deref()
            .map(|url| format!("<p><a href=\"{0}\">{0}</a></p>", escape_html(url)))
            .unwrap_or_default();

        let subject = format!("Milo {title}: {scope_label}, {}", date.format("%Y-%m-%d"));
        let body = format!(
            "<html><body>\n<h2>{title}</h2>\n<p>{greeting},</p>\n<p>Your {title} report for {scope_label} on {date} is ready.</p>\n{link}\n<p>You receive this because you are subscribed to Milo reports.</p>\n</body></html>",
            title = escape_html(&title),
            date = date.format("%A %d %B %Y"),
        );
        Ok(Message::new(subject, body))
    }
}

impl ContentRenderer for ReportRenderer {
    fn render(&self, recipient: &RecipientRecord, scope: Option<i64>) -> Result<Message> {
        self.render_for(recipient, scope, self.today())
    }
}

/// "daily_incidents" → "Daily Incidents"
fn report_title(report_type: &str) -> String {
    report_type
        .split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
