//! The `indexpilot` binary: a thin command surface over the runtime and the
//! read API. Exit codes: 0 success, 2 gate/bypass denied, 3 planner
//! unavailable, 4 permission, 5 connectivity, >=64 bug.
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use catalog::BootstrapMode;
use clap::{
    Parser,
    Subcommand,
};
use common::types::MutationId;
use pg::PostgresAdapter;
use pilot::{
    bypass::BypassLevel,
    Bypass,
    Config,
    Runtime,
    Scheduler,
};

#[derive(Parser)]
#[command(name = "indexpilot", about = "Autonomous index management for Postgres")]
struct Cli {
    /// Connection string of the managed database.
    #[arg(long, env = "INDEXPILOT_DATABASE_URL")]
    database_url: String,

    /// Declarative schema file; omitted means live introspection.
    #[arg(long)]
    schema_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap metadata tables and the catalog. Idempotent.
    Init,
    /// Force one decision engine pass.
    Analyze,
    /// Force one maintenance loop pass.
    Maintain,
    /// Emit health and mutation summary.
    Report,
    /// Reverse a mutation by id.
    Rollback { mid: u64 },
    /// Toggle a bypass level.
    Bypass {
        #[arg(value_parser = ["set", "unset"])]
        action: String,
        level: String,
        #[arg(default_value = "")]
        name: String,
    },
    /// Run the daemon: scheduler plus read API.
    Run {
        #[arg(long, default_value = "127.0.0.1:8090")]
        listen: SocketAddr,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    match runtime.block_on(run(cli)) {
        Ok(()) => {},
        Err(e) => {
            errors::report_error(&e);
            std::process::exit(pilot::exit_code_for(&e));
        },
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config {
        database_url: cli.database_url.clone(),
        schema_file: cli.schema_file.clone(),
    };
    let db = Arc::new(PostgresAdapter::new(config.database_url.clone()));
    db.bootstrap().await?;

    let bypass = Arc::new(Bypass::from_env_value(
        &std::env::var("INDEXPILOT_BYPASS_MODE").unwrap_or_default(),
    ));
    let bootstrap: BootstrapMode = config.bootstrap_mode()?;
    let runtime = Runtime::start(db, bootstrap, bypass).await?;

    match cli.command {
        Command::Init => {
            // Bootstrap already ran; starting the runtime re-diffed the
            // catalog.
            println!("initialized; catalog entries: {}", runtime.catalog.entries().len());
        },
        Command::Analyze => {
            runtime.decision_pass(chrono::Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&runtime.read_api.performance())?);
        },
        Command::Maintain => {
            runtime.maintenance_pass(chrono::Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&runtime.read_api.health())?);
        },
        Command::Report => {
            let summary = serde_json::json!({
                "health": runtime.read_api.health(),
                "performance": runtime.read_api.performance(),
                "mutations": runtime.read_api.mutations(MutationId(0)).len(),
                "bypass": runtime.read_api.bypass(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        },
        Command::Rollback { mid } => {
            let rollback_mid = runtime.rollback.rollback(MutationId(mid)).await?;
            println!("rolled back {} as {rollback_mid}", MutationId(mid));
        },
        Command::Bypass {
            action,
            level,
            name,
        } => {
            let level = BypassLevel::parse(&level)
                .ok_or_else(|| anyhow::anyhow!("unknown bypass level {level:?}"))?;
            if action == "set" {
                runtime.bypass.set(level, &name);
            } else {
                runtime.bypass.unset(level, &name);
            }
            println!("{}", serde_json::to_string_pretty(&runtime.bypass.effective())?);
        },
        Command::Run { listen } => {
            let handle = Scheduler::start(runtime.clone());
            let router = runtime.read_api.clone().router();
            let listener = tokio::net::TcpListener::bind(listen).await?;
            tracing::info!("read API listening on {listen}");
            tokio::select! {
                result = axum::serve(listener, router) => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                },
            }
            handle.shutdown(&runtime).await;
        },
    }
    Ok(())
}
