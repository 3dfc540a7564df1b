//! Sends requests through the full dispatch stack and reports what came back.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use http::Method;
use netdispatch::{
    CacheStrategy, DispatchConfig, DispatchExt, DispatchOptions, NetworkInterface, SharedDispatcher,
};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PoolKind {
    Api,
    Download,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Parser)]
#[command(name = "netdispatch-probe")]
#[command(about = "Fetch URLs through the launcher's network stack")]
struct Args {
    /// URLs to fetch, in order
    #[arg(required = true)]
    urls: Vec<String>,

    /// YAML configuration file
    #[arg(short, long, env = "NETDISPATCH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(short = 'X', long, default_value = "GET")]
    method: Method,

    #[arg(long, value_enum, default_value = "api")]
    pool: PoolKind,

    /// Fetch every URL this many times
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Bypass the response cache
    #[arg(long)]
    no_cache: bool,

    /// Proxy URL, replacing the configured one
    #[arg(long)]
    proxy: Option<String>,

    /// Socket connect timeout in milliseconds
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    /// Print the network status as JSON when done
    #[arg(long)]
    status: bool,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(args: &Args) {
    let default = if args.verbose { "netdispatch=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn build_network(args: &Args) -> Result<NetworkInterface> {
    let config = DispatchConfig::load(args.config.as_deref()).context("loading configuration")?;
    let network = NetworkInterface::in_memory(config).context("building network stack")?;

    if let Some(proxy) = &args.proxy {
        let mut settings = (*network.settings()).clone();
        settings.http_proxy_enabled = true;
        settings.http_proxy = Some(SecretString::from(proxy.clone()));
        network.apply_settings(settings);
    }
    if let Some(ms) = args.connect_timeout_ms {
        network.set_connect_timeout(Duration::from_millis(ms));
    }
    Ok(network)
}

fn request_for(args: &Args, url: &str, signal: &CancellationToken) -> Result<DispatchOptions> {
    let mut builder = DispatchOptions::builder()
        .url(url)
        .with_context(|| format!("invalid url {url}"))?
        .method(args.method.clone())
        .signal(signal.child_token());
    if args.no_cache {
        builder = builder.cache_strategy(CacheStrategy::NetworkOnly);
    }
    Ok(builder.build()?)
}

async fn fetch(dispatcher: &SharedDispatcher, opts: DispatchOptions) {
    let target = opts
        .url()
        .map_or_else(|_| opts.path.clone(), String::from);
    let label = format!("{} {target}", opts.method);
    let started = Instant::now();
    match dispatcher.request(opts).await {
        Ok(resp) => {
            println!(
                "{label} -> {} ({} bytes, {} headers, {} ms)",
                resp.status,
                resp.body.len(),
                resp.headers.len(),
                started.elapsed().as_millis()
            );
            if let Some(age) = resp.headers.first("age") {
                println!("  served from cache, age {age}s");
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "request failed");
            println!("{label} -> error: {err}");
            if let Some(cached) = err.cached() {
                println!(
                    "  stale copy available: {} ({} bytes)",
                    cached.status(),
                    cached.body().len()
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let network = build_network(&args)?;
    let dispatcher = match args.pool {
        PoolKind::Api => network.api_dispatcher(),
        PoolKind::Download => network.download_dispatcher(),
    };

    let signal = CancellationToken::new();
    let on_interrupt = signal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, aborting in-flight requests");
            on_interrupt.cancel();
        }
    });

    for _ in 0..args.repeat.max(1) {
        for url in &args.urls {
            if signal.is_cancelled() {
                break;
            }
            let opts = request_for(&args, url, &signal)?;
            fetch(&dispatcher, opts).await;
        }
    }

    if args.status {
        let status = network.network_status();
        println!("{}", serde_json::to_string_pretty(&status)?);
    }
    Ok(())
}
