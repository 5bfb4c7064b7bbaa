use clap::Parser;
use miette::{Context, IntoDiagnostic, Result};
use mfa::agent::Agent;
use mfa::config::Cfg;
use mfa::lifecycle::{self, Worker};
use mfa::logging::{self, LogHandle};
use tracing::info;

/// Mail filter agent: runs SMTP transactions past the configured filters.
#[derive(Parser, Debug)]
#[command(name = "mfa", version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "mfa.toml")]
    config: String,

    /// Serve in this process instead of forking a worker
    #[arg(long)]
    foreground: bool,

    /// Log filter overriding the configured level (e.g. "debug")
    #[arg(long)]
    log_level: Option<String>,
}

// No runtime may exist before the fork, so main stays synchronous.
fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Cfg::load(&args.config).wrap_err("loading config")?;
    let log = logging::init(&cfg.log, args.log_level.as_deref())?;

    if !args.foreground {
        if let Worker::Parent(pid) = lifecycle::fork_worker()? {
            info!(%pid, "started mail filter worker");
            let code = lifecycle::wait_worker(pid)?;
            std::process::exit(code);
        }
    }

    lifecycle::drop_privileges(&cfg.agent)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .into_diagnostic()
        .wrap_err("building tokio runtime")?;
    runtime.block_on(serve(cfg, log))
}

async fn serve(cfg: Cfg, log: LogHandle) -> Result<()> {
    let agent = Agent::connect(&cfg.peers, log)
        .await
        .wrap_err("connecting to peers")?;
    agent.run().await?;
    Ok(())
}
