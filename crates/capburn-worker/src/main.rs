//! Caption burn-in worker binary.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use capburn_worker::{
    create_job, init_tracing, load_request, plan_json, probe_hw, run_render, telemetry,
    WorkerConfig, WorkerError,
};

#[derive(Debug, Parser)]
#[command(name = "capburn-worker", version, about = "Burn captions into video with FFmpeg")]
struct Cli {
    /// Parent directory for job temp files (overrides CAPBURN_WORK_DIR)
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Encode in software only
    #[arg(long, global = true)]
    no_hw: bool,

    /// Emit JSON logs (same as LOG_FORMAT=json)
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Render a request file
    Render {
        /// RenderRequest JSON
        request: PathBuf,

        /// Output path, replacing the one in the request
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Print the effective captions and chunk plan without rendering
        #[arg(long)]
        plan_only: bool,
    },
    /// Print the hardware encoder selection
    ProbeHw,
}

impl Cli {
    fn apply(&self, config: &mut WorkerConfig) {
        if let Some(dir) = &self.work_dir {
            config.work_dir = dir.clone();
        }
        if self.no_hw {
            config.hw_preference.clear();
        }
        config.json_logs |= self.json_logs;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = WorkerConfig::from_env();
    cli.apply(&mut config);
    init_tracing(config.json_logs);

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<WorkerError>()
                .map(WorkerError::exit_code)
                .unwrap_or(1);
            error!("{:#}", e);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(command: Command, config: WorkerConfig) -> anyhow::Result<()> {
    if let Some(addr) = config.metrics_addr {
        telemetry::init_metrics(addr)?;
    }

    match command {
        Command::Render {
            request,
            output,
            plan_only,
        } => {
            let render_request = load_request(&request, output.as_deref()).await?;

            if plan_only {
                println!("{}", plan_json(&config, &render_request).await?);
                return Ok(());
            }

            let job = create_job(&config)?;
            let cancel = job.cancel_handle();
            let signals = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Received interrupt, cancelling render");
                    cancel.cancel();
                }
            });

            let result = run_render(job, &render_request).await;
            signals.abort();

            let path = result.with_context(|| format!("render of {} failed", request.display()))?;
            info!(output = %path.display(), "Render finished");
            println!("{}", path.display());
        }
        Command::ProbeHw => {
            let report = probe_hw(&config).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
