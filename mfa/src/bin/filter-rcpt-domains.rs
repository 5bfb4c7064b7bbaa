use clap::Parser;
use filter_api::{Channel, FilterRuntime, MailAddress};
use miette::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Mail filter refusing recipients in the given domains.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Domains whose recipients are refused.
    #[arg(required = true)]
    domains: Vec<String>,

    /// Reply code used for refused recipients.
    #[arg(long, default_value_t = 550)]
    code: u32,
}

fn is_refused(domains: &[String], rcpt: &MailAddress) -> bool {
    domains.iter().any(|d| rcpt.domain.eq_ignore_ascii_case(d))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // stdout carries the channel to the agent.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let domains = args.domains;
    let code = args.code;

    let mut runtime = FilterRuntime::new(Channel::stdio());
    runtime.on_rcpt(move |decisions, id, rcpt| {
        if is_refused(&domains, rcpt) {
            info!(session_id = id, %rcpt, "refusing recipient");
            let status = format!("5.7.1 Recipient domain {} not accepted", rcpt.domain);
            decisions.reject(id, code, &status)?;
            return Ok(());
        }
        decisions.accept(id)
    });

    runtime.run().await?;
    Ok(())
}
