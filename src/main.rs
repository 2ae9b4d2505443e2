//! Impact Ledger daemon and CLI
//!
//! ## Usage
//!
//! ```bash
//! # Run the HTTP API with scheduled accrual
//! impact-ledger serve --http-port 8095
//!
//! # Record a measurement and accrue it
//! impact-ledger record --category residue --value 12.5 --source-kind delivery --source-ref d-981
//! impact-ledger accrue
//!
//! # Issue a certificate
//! impact-ledger quota register --project reforest-01
//! impact-ledger issue --quota <quota-id>
//!
//! # Public verification
//! impact-ledger verify 3F9A...
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use impact_ledger::db::measurements::{RecordMeasurementInput, RecordOutcome};
use impact_ledger::services::events::spawn_logging_listener;
use impact_ledger::{AccrualEngine, Category, Config, HttpServer, IssueOutcome, LedgerDb, QuotaStatus, Services};

#[derive(Parser, Debug)]
#[command(name = "impact-ledger")]
#[command(about = "Accrual and issuance ledger for UIB tokens and CDV certificates")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "IMPACT_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (holds ledger.db)
    #[arg(long, env = "IMPACT_LEDGER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API and the accrual scheduler
    Serve {
        /// HTTP API port
        #[arg(long, env = "IMPACT_LEDGER_HTTP_PORT")]
        http_port: Option<u16>,

        /// Accrual interval in seconds (0 disables the scheduler)
        #[arg(long)]
        accrual_interval_secs: Option<u64>,
    },

    /// Run the accrual engine once
    Accrue {
        /// Only this category
        #[arg(long)]
        category: Option<Category>,
    },

    /// Record an impact measurement
    Record {
        #[arg(long)]
        category: Category,
        /// Raw value (kg, hours or units, by category)
        #[arg(long)]
        value: String,
        #[arg(long, default_value = "manual")]
        source_kind: String,
        #[arg(long)]
        source_ref: Option<String>,
        #[arg(long)]
        subject_id: Option<String>,
        /// RFC 3339 timestamp (default: now)
        #[arg(long)]
        recorded_at: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },

    /// Manage investor quotas
    #[command(subcommand)]
    Quota(QuotaCommands),

    /// Issue a certificate for a quota
    Issue {
        #[arg(long)]
        quota: String,
    },

    /// Show token stock per category
    Stock,

    /// Look up a certificate by validation hash
    Verify { hash: String },

    /// Write the effective configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
enum QuotaCommands {
    /// Register a quota awaiting a certificate
    Register {
        #[arg(long)]
        project: String,
        #[arg(long)]
        investor: Option<String>,
    },

    /// List quotas
    List {
        #[arg(long)]
        status: Option<QuotaStatus>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("impact_ledger=info".parse()?))
        .init();

    let cli = Cli::parse();

    // Load config
    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Commands::Serve {
        http_port,
        accrual_interval_secs,
    } = &cli.command
    {
        if let Some(port) = http_port {
            config.http_port = *port;
        }
        if let Some(secs) = accrual_interval_secs {
            config.accrual_interval_secs = *secs;
        }
    }

    config.validate()?;

    if let Commands::InitConfig { force } = cli.command {
        let path = cli.config.unwrap_or_else(|| config.config_path());
        if path.exists() && !force {
            anyhow::bail!("{} exists, pass --force to overwrite", path.display());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        config.save(&path)?;
        info!(path = %path.display(), "Wrote config");
        return Ok(());
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let db = Arc::new(LedgerDb::open(&config.data_dir, config.busy_timeout())?);
    let services = Arc::new(Services::new(db, &config)?);

    match cli.command {
        Commands::Serve { .. } => serve(services, &config).await?,

        Commands::Accrue { category } => {
            let accrual = services.accrual.clone();
            match category {
                Some(category) => {
                    let unit = tokio::task::spawn_blocking(move || accrual.run_category(category)).await??;
                    print_json(&unit)?;
                }
                None => {
                    let report = tokio::task::spawn_blocking(move || accrual.run()).await?;
                    print_json(&report)?;
                }
            }
        }

        Commands::Record {
            category,
            value,
            source_kind,
            source_ref,
            subject_id,
            recorded_at,
            note,
        } => {
            let outcome = services.intake.record(RecordMeasurementInput {
                id: None,
                category,
                raw_value: value,
                recorded_at,
                source_kind,
                source_ref,
                subject_id,
                note,
            })?;
            match outcome {
                RecordOutcome::Inserted(m) => print_json(&m)?,
                RecordOutcome::Duplicate(m) => {
                    warn!(id = %m.id, "Measurement already recorded for this source");
                    print_json(&m)?;
                }
            }
        }

        Commands::Quota(QuotaCommands::Register { project, investor }) => {
            let quota = services.issuer.register_quota(&project, investor.as_deref())?;
            print_json(&quota)?;
        }

        Commands::Quota(QuotaCommands::List { status }) => {
            print_json(&services.issuer.list_quotas(status)?)?;
        }

        Commands::Issue { quota } => {
            let outcome = services.issuer.issue(&quota)?;
            print_json(&outcome)?;
            if !matches!(outcome, IssueOutcome::Issued(_)) {
                std::process::exit(2);
            }
        }

        Commands::Stock => print_json(&services.stock.stock_report()?)?,

        Commands::Verify { hash } => match services.issuer.verify(&hash)? {
            Some(certificate) => print_json(&certificate)?,
            None => anyhow::bail!("No certificate with validation hash {}", hash),
        },

        // Returned before the database was opened
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

async fn serve(services: Arc<Services>, config: &Config) -> anyhow::Result<()> {
    info!(
        data_dir = %config.data_dir.display(),
        http_port = config.http_port,
        accrual_interval_secs = config.accrual_interval_secs,
        "Starting impact-ledger"
    );

    let _audit = spawn_logging_listener(services.events.clone());

    let scheduler = (config.accrual_interval_secs > 0).then(|| {
        tokio::spawn(accrual_loop(
            services.accrual.clone(),
            Duration::from_secs(config.accrual_interval_secs),
        ))
    });
    if scheduler.is_none() {
        info!("Accrual scheduler disabled; use POST /accrual/run");
    }

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(services, http_addr));

    info!("HTTP API available at http://{}", http_addr);
    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    if let Some(handle) = scheduler {
        handle.abort();
    }

    Ok(())
}

/// Run the accrual engine every `period` on the blocking pool
async fn accrual_loop(engine: Arc<AccrualEngine>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let engine = engine.clone();
        match tokio::task::spawn_blocking(move || engine.run()).await {
            Ok(report) if !report.errors.is_empty() => {
                warn!(errors = report.errors.len(), "Scheduled accrual finished with errors");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Scheduled accrual task panicked"),
        }
    }
}
