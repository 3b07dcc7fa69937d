use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use datagouv_pipelines::{
    config::Settings,
    pipelines::{Context, PipelineKind},
};
use std::path::PathBuf;
use tokio::time::{timeout, Instant};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "datagouv-pipelines", about = "Run data.gouv.fr data pipelines")]
struct Cli {
    /// Settings file (YAML). Missing file means defaults.
    #[arg(long, env = "PIPELINES_CONFIG", default_value = "pipelines.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every DAG definition as JSON for the scheduler.
    List,
    /// Run one pipeline end to end.
    Run {
        #[arg(value_enum)]
        pipeline: PipelineKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            let defs: Vec<_> = PipelineKind::ALL.iter().map(|k| k.definition()).collect();
            for d in &defs {
                d.validate()?;
            }
            println!("{}", serde_json::to_string_pretty(&defs)?);
            Ok(())
        }
        Command::Run { pipeline } => {
            // ─── 2) settings, loaded once ────────────────────────────
            let settings = Settings::load(&cli.config)?;
            let ctx = Context::new(settings)?;

            // ─── 3) run bounded by the dag timeout ───────────────────
            let dag = pipeline.definition();
            info!(dag = dag.dag_id, timeout = ?dag.timeout, "startup");
            let start = Instant::now();
            let outcome = timeout(dag.timeout, pipeline.run(&ctx))
                .await
                .with_context(|| format!("dag {} exceeded {:?}", dag.dag_id, dag.timeout))
                .and_then(|r| r);
            match &outcome {
                Ok(()) => info!(dag = dag.dag_id, elapsed = ?start.elapsed(), "all done"),
                Err(e) => error!(dag = dag.dag_id, "run failed: {:#}", e),
            }
            outcome
        }
    }
}
