//! SMTP transport session — one explicit lettre connection per batch.
//!
//! Unlike the pooled `AsyncSmtpTransport`, the raw `AsyncSmtpConnection` lets
//! the dispatcher drive connect, authenticate, send, NOOP liveness, and QUIT
//! itself, which is what one-connection-per-batch delivery needs.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::{Address, Message as LettreMessage};
use milo_core::config::{SmtpConfig, SmtpSecurity};
use milo_core::error::{DispatchPhase, MiloError, Result};
use milo_core::traits::{SessionFactory, TransportSession};
use milo_core::types::{Message, RecipientRecord};

/// SMTP session backed by a single lettre connection.
pub struct SmtpSession {
    config: SmtpConfig,
    conn: Option<AsyncSmtpConnection>,
    /// Set while a transaction is on the wire. Still set afterwards means the
    /// send future was dropped and replies on the socket no longer line up.
    in_flight: bool,
}

impl SmtpSession {
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            config,
            conn: None,
            in_flight: false,
        }
    }

    /// Abort a connection whose last transaction never completed.
    async fn drop_if_desynced(&mut self) -> bool {
        if !self.in_flight {
            return false;
        }
        self.in_flight = false;
        if let Some(mut conn) = self.conn.take() {
            tracing::warn!("⚠️ SMTP transaction interrupted, dropping connection");
            conn.abort().await;
        }
        true
    }

    fn hello_name(&self) -> ClientId {
        ClientId::Domain(self.config.hello_name.clone())
    }

    fn tls_parameters(&self) -> Result<TlsParameters> {
        TlsParameters::new(self.config.host.clone())
            .map_err(|e| MiloError::connection(format!("TLS parameters: {e}")))
    }

    /// Connect, authenticate, and close again. Used by the connectivity check.
    pub async fn probe(config: SmtpConfig) -> Result<()> {
        let limit = config.op_timeout();
        let mut session = Self::new(config);
        let outcome: Result<()> = async {
            tokio::time::timeout(limit, session.connect())
                .await
                .map_err(|_| MiloError::timeout(DispatchPhase::Connect, limit))??;
            tokio::time::timeout(limit, session.authenticate())
                .await
                .map_err(|_| MiloError::timeout(DispatchPhase::Authenticate, limit))??;
            Ok(())
        }
        .await;
        session.close().await;
        outcome
    }

    /// Build the RFC 5322 message for one recipient.
    fn build_email(&self, recipient: &RecipientRecord, message: &Message) -> Result<LettreMessage> {
        let from_address: Address = self
            .config
            .from_email
            .parse()
            .map_err(|e| MiloError::config(format!("Invalid from address: {e}")))?;
        let to_address: Address = recipient
            .email
            .trim()
            .parse()
            .map_err(|e| MiloError::send(format!("Invalid to address '{}': {e}", recipient.email)))?;

        let from = Mailbox::new(Some(self.config.from_name.clone()), from_address);
        let to_name = (!recipient.name.is_empty()).then(|| recipient.name.clone());
        let to = Mailbox::new(to_name, to_address);

        let builder = LettreMessage::builder()
            .from(from)
            .to(to)
            .subject(message.subject.clone());

        let email = if looks_like_html(&message.body) {
            builder.multipart(MultiPart::alternative_plain_html(
                strip_html(&message.body),
                message.body.clone(),
            ))
        } else {
            builder.singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_PLAIN)
                    .body(message.body.clone()),
            )
        };

        email.map_err(|e| MiloError::send(format!("Build email: {e}")))
    }
}

#[async_trait]
impl TransportSession for SmtpSession {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn connect(&mut self) -> Result<()> {
        // Reconnect: drop whatever is left of the previous connection.
        if let Some(mut stale) = self.conn.take() {
            stale.abort().await;
        }
        self.in_flight = false;

        let hello = self.hello_name();
        let server = (self.config.host.as_str(), self.config.port);
        let timeout = Some(self.config.op_timeout());

        let implicit_tls = match self.config.security {
            SmtpSecurity::Tls => Some(self.tls_parameters()?),
            SmtpSecurity::Starttls | SmtpSecurity::None => None,
        };

        let mut conn = AsyncSmtpConnection::connect_tokio1(server, timeout, &hello, implicit_tls, None)
            .await
            .map_err(|e| {
                MiloError::connection(format!(
                    "SMTP connect {}:{}: {e}",
                    self.config.host, self.config.port
                ))
            })?;

        if self.config.security == SmtpSecurity::Starttls {
            if !conn.can_starttls() {
                conn.abort().await;
                return Err(MiloError::connection(format!(
                    "{} does not offer STARTTLS",
                    self.config.host
                )));
            }
            let params = self.tls_parameters()?;
            if let Err(e) = conn.starttls(params, &hello).await {
                conn.abort().await;
                return Err(MiloError::connection(format!("STARTTLS: {e}")));
            }
        }

        tracing::debug!(
            "🔌 SMTP connected: {}:{} ({:?})",
            self.config.host,
            self.config.port,
            self.config.security
        );
        self.conn = Some(conn);
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<()> {
        if self.config.username.is_empty() && self.config.security == SmtpSecurity::None {
            tracing::debug!("SMTP relay without credentials — skipping AUTH");
            return Ok(());
        }
        if !self.config.has_credentials() {
            return Err(MiloError::config("SMTP credentials not set"));
        }

        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| MiloError::connection("authenticate before connect"))?;
        let creds = Credentials::new(self.config.username.clone(), self.config.password.clone());
        conn.auth(&[Mechanism::Plain, Mechanism::Login], &creds)
            .await
            .map_err(|e| MiloError::auth(format!("SMTP auth as {}: {e}", self.config.username)))?;
        Ok(())
    }

    async fn send(&mut self, recipient: &RecipientRecord, message: &Message) -> Result<()> {
        let email = self.build_email(recipient, message)?;
        if self.drop_if_desynced().await {
            return Err(MiloError::send("previous SMTP transaction was interrupted"));
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| MiloError::send("session is not connected"))?;

        self.in_flight = true;
        let sent = conn.send(email.envelope(), &email.formatted()).await;
        self.in_flight = false;
        sent.map_err(|e| MiloError::send(format!("SMTP send to {}: {e}", recipient.email)))?;

        tracing::info!("📤 Email sent to: {}", recipient.email);
        Ok(())
    }

    async fn is_connected(&mut self) -> bool {
        if self.drop_if_desynced().await {
            return false;
        }
        match self.conn.as_mut() {
            Some(conn) => !conn.has_broken() && conn.test_connected().await,
            None => false,
        }
    }

    async fn close(&mut self) {
        if self.drop_if_desynced().await {
            return;
        }
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if conn.has_broken() {
            conn.abort().await;
            return;
        }
        if let Err(e) = conn.quit().await {
            tracing::debug!("SMTP QUIT failed, aborting: {e}");
            conn.abort().await;
        }
    }
}

/// Creates a fresh SMTP session per batch.
#[derive(Debug, Clone)]
pub struct SmtpSessionFactory {
    config: SmtpConfig,
}

impl SmtpSessionFactory {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for SmtpSessionFactory {
    fn create(&self) -> Box<dyn TransportSession> {
        Box::new(SmtpSession::new(self.config.clone()))
    }
}

fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start();
    head.starts_with('<') && body.contains("</")
}

/// Plain-text fallback for HTML bodies.
fn strip_html(html: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
