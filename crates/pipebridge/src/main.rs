use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pipebridge::bridge::DEFAULT_MAX_REPLY_BYTES;
use pipebridge::bridge::transport::{DEFAULT_IN_PIPE, DEFAULT_OUT_PIPE};
use pipebridge::transport::http::DEFAULT_MAX_BODY_BYTES;
use pipebridge::{
    BodyLimit, BridgeService, OversizePolicy, PipePaths, ServerConfig, ServiceConfig, open_pipes,
    run_once, serve,
};

#[derive(Parser, Debug)]
#[command(
    name = "pipebridge",
    version,
    about = "Relay HTTP POST bodies to a JSON worker over named pipes",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(flatten)]
    serve: ServeArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve HTTP (the default).
    Serve(ServeArgs),
    /// Answer a single request read from stdin, then exit.
    Oneshot(OneshotArgs),
}

#[derive(Args, Debug, Clone)]
struct ChannelArgs {
    /// Seconds to wait for the channel plus the worker's reply.
    #[arg(long, value_name = "SECS", env = "PIPEBRIDGE_EXCHANGE_TIMEOUT_SECS", default_value_t = 30)]
    exchange_timeout_secs: u64,

    /// Largest reply accepted from the worker.
    #[arg(long, value_name = "BYTES", env = "PIPEBRIDGE_MAX_REPLY_BYTES", default_value_t = DEFAULT_MAX_REPLY_BYTES)]
    max_reply_bytes: usize,
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// FIFO the worker reads requests from.
    #[arg(long, value_name = "PATH", env = "PIPEBRIDGE_IN_PIPE", default_value = DEFAULT_IN_PIPE)]
    in_pipe: PathBuf,

    /// FIFO the worker writes replies to.
    #[arg(long, value_name = "PATH", env = "PIPEBRIDGE_OUT_PIPE", default_value = DEFAULT_OUT_PIPE)]
    out_pipe: PathBuf,

    #[arg(long, env = "PIPEBRIDGE_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PIPEBRIDGE_PORT", default_value_t = 8080)]
    port: u16,

    /// Request body cap.
    #[arg(long, value_name = "BYTES", env = "PIPEBRIDGE_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    /// What to do with bodies over the cap: truncate or reject.
    #[arg(long, value_name = "POLICY", env = "PIPEBRIDGE_OVERSIZE", default_value_t = OversizePolicy::Truncate)]
    oversize: OversizePolicy,

    #[arg(long, value_name = "SECS", env = "PIPEBRIDGE_HEADER_TIMEOUT_SECS", default_value_t = 5)]
    header_timeout_secs: u64,

    #[command(flatten)]
    channel: ChannelArgs,
}

#[derive(Args, Debug, Clone)]
struct OneshotArgs {
    /// FIFO the worker reads requests from.
    in_pipe: PathBuf,

    /// FIFO the worker writes replies to.
    out_pipe: PathBuf,

    #[command(flatten)]
    channel: ChannelArgs,
}

impl ChannelArgs {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            exchange_timeout: Duration::from_secs(self.exchange_timeout_secs),
        }
    }
}

/// Logs go to stderr; stdout carries the response in oneshot mode.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PIPEBRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("pipebridge={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let paths = PipePaths {
        inbound: args.in_pipe,
        outbound: args.out_pipe,
    };
    let channel = open_pipes(&paths, args.channel.max_reply_bytes)
        .context("failed to open worker pipes")?;
    let service = Arc::new(BridgeService::new(channel, args.channel.service_config()));

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        body_limit: BodyLimit {
            max_bytes: args.max_body_bytes,
            policy: args.oversize,
        },
        header_read_timeout: Duration::from_secs(args.header_timeout_secs),
        ..ServerConfig::default()
    };

    tracing::info!(
        inbound = %paths.inbound.display(),
        outbound = %paths.outbound.display(),
        max_body_bytes = config.body_limit.max_bytes,
        oversize = %config.body_limit.policy,
        "Worker pipes open"
    );

    serve(config, service).await
}

async fn run_oneshot(args: OneshotArgs) -> anyhow::Result<()> {
    let paths = PipePaths {
        inbound: args.in_pipe,
        outbound: args.out_pipe,
    };
    let channel = open_pipes(&paths, args.channel.max_reply_bytes)
        .context("failed to open worker pipes")?;
    let service = BridgeService::new(channel, args.channel.service_config());

    let reply_bytes = run_once(tokio::io::stdin(), tokio::io::stdout(), &service)
        .await
        .context("oneshot exchange failed")?;
    tracing::debug!(reply_bytes, "Oneshot exchange complete");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command.unwrap_or(Command::Serve(cli.serve)) {
        Command::Serve(args) => run_server(args).await,
        Command::Oneshot(args) => run_oneshot(args).await,
    }
}
