//! Milo report dispatch CLI.
//!
//! Usage:
//!   milo serve                     # HTTP gateway + background schedulers
//!   milo send daily_incidents      # Dispatch a report once, now
//!   milo send daily_incidents --project-id 4
//!   milo check-smtp                # Connect + authenticate against SMTP

mod report;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use milo_channels::{SmtpSession, SmtpSessionFactory};
use milo_core::config::MiloConfig;
use milo_core::types::{DEFAULT_REPORT_TYPE, DispatchBatchResult, RunTrigger};
use milo_gateway::AppState;
use milo_scheduler::{DispatchPipeline, ReportDb, ReportDispatch, SchedulerOptions, SchedulerRegistry};
use tokio::sync::watch;

use crate::report::ReportRenderer;

#[derive(Parser)]
#[command(name = "milo", version, about = "Scheduled report dispatch for Milo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway and the report schedulers
    Serve {
        /// Override the gateway port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Dispatch a report to its recipients right now
    Send {
        /// Report type to send
        #[arg(default_value = DEFAULT_REPORT_TYPE)]
        report_type: String,
        /// Limit to one project's recipients
        #[arg(long)]
        project_id: Option<i64>,
    },
    /// Check SMTP connectivity and credentials
    CheckSmtp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "milo=debug,milo_channels=debug,milo_scheduler=debug,milo_gateway=debug,tower_http=debug"
    } else {
        "milo=info,milo_channels=info,milo_scheduler=info,milo_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => MiloConfig::load_from(&PathBuf::from(shellexpand::tilde(path).to_string()))?,
        None => MiloConfig::load()?,
    };

    match cli.command {
        Commands::Serve { port } => serve(config, port).await,
        Commands::Send {
            report_type,
            project_id,
        } => send(config, &report_type, project_id).await,
        Commands::CheckSmtp => {
            println!("📧 Checking {}:{} ...", config.smtp.host, config.smtp.port);
            SmtpSession::probe(config.smtp.clone()).await?;
            println!("✅ SMTP connection and login OK");
            Ok(())
        }
    }
}

fn open_db(config: &MiloConfig) -> anyhow::Result<Arc<ReportDb>> {
    let path = config.database.resolved_path();
    let db = ReportDb::open(&path)?;
    tracing::info!("🗄️ Report database: {}", path.display());
    Ok(Arc::new(db))
}

fn build_pipeline(config: &MiloConfig, db: Arc<ReportDb>) -> DispatchPipeline {
    let options = SchedulerOptions::from_config(&config.scheduler);
    let mut renderer = ReportRenderer::new(options.utc_offset);
    if let Some(url) = &config.gateway.public_url {
        renderer = renderer.with_dashboard_url(url.clone());
    }
    DispatchPipeline::new(
        db.clone(),
        db.clone(),
        Arc::new(SmtpSessionFactory::new(config.smtp.clone())),
        Arc::new(renderer),
        config.smtp.op_timeout(),
    )
    .with_history(db)
}

async fn serve(mut config: MiloConfig, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.gateway.port = port;
    }
    if !config.smtp.has_credentials() {
        tracing::warn!("⚠️ SMTP credentials are not configured; report sends will fail to authenticate");
    }

    let db = open_db(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch: Arc<dyn ReportDispatch> =
        Arc::new(build_pipeline(&config, db.clone()).with_shutdown(shutdown_rx.clone()));
    let options = SchedulerOptions::from_config(&config.scheduler);

    let mut state = AppState::new(db.clone(), dispatch.clone(), options.utc_offset);
    let registry = if config.scheduler.enabled {
        let registry = Arc::new(SchedulerRegistry::new(db.clone(), dispatch, options));
        registry.start().await?;
        state = state.with_registry(registry.clone());
        Some(registry)
    } else {
        tracing::info!("⏸️ Scheduler disabled; reports only go out on manual trigger");
        None
    };

    let gateway_config = config.gateway.clone();
    let mut server = tokio::spawn(async move {
        milo_gateway::start(&gateway_config, Arc::new(state), shutdown_rx).await
    });

    let early_exit = tokio::select! {
        joined = &mut server => Some(joined),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
    };

    tracing::info!("👋 Shutting down");
    shutdown_tx.send_replace(true);
    if let Some(registry) = registry {
        registry.shutdown().await;
    }
    match early_exit {
        Some(joined) => joined?,
        None => server.await?,
    }
}

async fn send(config: MiloConfig, report_type: &str, project_id: Option<i64>) -> anyhow::Result<()> {
    let db = open_db(&config)?;
    let pipeline = build_pipeline(&config, db);
    let result = pipeline.run(report_type, project_id, RunTrigger::Manual).await?;
    print_result(report_type, &result);

    if result.is_delivery_failure() {
        anyhow::bail!(
            "report not delivered: {}",
            result.connection_error.as_deref().unwrap_or("transport unavailable")
        );
    }
    Ok(())
}

fn print_result(report_type: &str, result: &DispatchBatchResult) {
    println!("📨 {report_type}");
    println!("   Attempted:  {}", result.attempted);
    println!("   Sent:       {}", result.sent);
    println!("   Failed:     {}", result.failed);
    println!("   Duplicates: {}", result.skipped_duplicate);
    for email in &result.failed_emails {
        println!("   ✗ {email}");
    }
    if let Some(err) = &result.connection_error {
        println!("   ⚠️ {err}");
    }
}
