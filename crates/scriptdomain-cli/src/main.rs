use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use scriptdomain_host::{CallReply, DomainHost, ExportOutcome, PendingExport, RuntimeConfig, WasmRuntime};
use tracing::{info, warn};

mod logging;

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Runtime configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory containing resource modules (overrides the config file)
    #[arg(short, long)]
    resources: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start every resource and drive them until interrupted
    Run,

    /// Call one export and print its result
    Invoke {
        resource: String,
        export: String,

        /// Argument bytes passed to the export
        #[arg(default_value = "")]
        args: String,

        /// How long to keep ticking while the export is pending
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RuntimeConfig> {
    let Some(path) = path else {
        return Ok(RuntimeConfig::default());
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = RuntimeConfig::from_toml_str(&text)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Print a successful reply, or turn a failed one into the command's error
fn render(target: &str, reply: CallReply) -> anyhow::Result<()> {
    if !reply.status.is_success() {
        bail!(
            "{} failed with status {}: {}",
            target,
            reply.status,
            reply.diagnostic.unwrap_or_default()
        );
    }
    if let Some(payload) = reply.payload {
        println!("{}", String::from_utf8_lossy(payload.as_bytes()));
    }
    Ok(())
}

async fn run(host: &DomainHost, frame_interval: Duration, started: Instant) -> anyhow::Result<()> {
    let mut frames = tokio::time::interval(frame_interval);
    frames.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = frames.tick() => {
                host.frame(elapsed_ms(started));
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                info!("Interrupted, stopping resources");
                return Ok(());
            }
        }
    }
}

async fn invoke(
    host: &DomainHost,
    frame_interval: Duration,
    started: Instant,
    (resource, export): (&str, &str),
    args: &[u8],
    timeout: Duration,
) -> anyhow::Result<()> {
    let target = format!("{}:{}", resource, export);
    let reply = match host.invoke_export(resource, export, args) {
        Ok(ExportOutcome::Ready(payload)) => CallReply::ok(payload),
        Ok(ExportOutcome::Pending(pending)) => {
            info!("{} pending as async call {}", target, pending.async_id());
            let Some(reply) = wait_pending(host, frame_interval, started, pending, timeout).await
            else {
                bail!("{} did not complete within {:?}", target, timeout);
            };
            reply
        }
        Err(e) => CallReply::from_error(&e),
    };
    render(&target, reply)
}

/// Keep ticking so the script gets a chance to deliver the result
async fn wait_pending(
    host: &DomainHost,
    frame_interval: Duration,
    started: Instant,
    pending: PendingExport,
    timeout: Duration,
) -> Option<CallReply> {
    let result = pending.wait();
    tokio::pin!(result);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut frames = tokio::time::interval(frame_interval);

    loop {
        tokio::select! {
            completion = &mut result => {
                return Some(match completion {
                    Ok(completed) => completed.into_reply(),
                    Err(e) => CallReply::from_error(&e),
                });
            }
            _ = &mut deadline => return None,
            _ = frames.tick() => {
                host.frame(elapsed_ms(started));
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init_logging(cli.log_file.as_deref())?;

    let mut config = load_config(cli.config.as_ref())?;
    if let Some(dir) = cli.resources {
        config.resource_dir = Some(dir);
    }
    if !config.enabled {
        warn!("Scripting is disabled in the config, nothing to do");
        return Ok(());
    }

    let runtime = WasmRuntime::new(config.wasm.clone())?;
    let host = DomainHost::from_config(&config);
    let dir = config.resource_dir();
    let started = Instant::now();

    if host.load_resources(&runtime, &dir, &config) == 0 {
        warn!("No resources started from {}", dir.display());
    }

    let frame_interval = Duration::from_millis(config.frame_interval_ms);
    let result = match &cli.command {
        Command::Run => run(&host, frame_interval, started).await,
        Command::Invoke {
            resource,
            export,
            args,
            timeout_ms,
        } => {
            invoke(
                &host,
                frame_interval,
                started,
                (resource.as_str(), export.as_str()),
                args.as_bytes(),
                Duration::from_millis(*timeout_ms),
            )
            .await
        }
    };

    for (resource, bytes) in host.memory_usage() {
        info!("{} used {} bytes", resource, bytes);
    }
    host.stop_all();
    result
}
