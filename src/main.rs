//! Sumi-Fetch main entry point
//!
//! This is the command-line interface for the Sumi-Fetch fetch core.

use clap::Parser;
use std::path::PathBuf;
use sumi_fetch::config::{load_config_with_hash, Config};
use sumi_fetch::crawler::{Coordinator, CrawlReport};
use sumi_fetch::state::{status, CrawlUri, FormField, HasFetchStats};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Sumi-Fetch: a polite, quota-aware HTTP fetcher
///
/// Sumi-Fetch fetches the given URIs, records the raw exchange, honors
/// per-server, per-host and per-queue quotas, and reports what it got.
#[derive(Parser, Debug)]
#[command(name = "sumi-fetch")]
#[command(version = "1.0.0")]
#[command(about = "A polite, quota-aware HTTP fetcher", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// URIs to fetch
    #[arg(value_name = "URL", required_unless_present = "dry_run")]
    urls: Vec<String>,

    /// Send the URIs as form POSTs with this field (name=value, repeatable)
    #[arg(long = "post", value_name = "NAME=VALUE")]
    post: Vec<String>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be fetched without fetching
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, _config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let fields = parse_fields(&cli.post)?;
    let uris = build_uris(&cli.urls, &fields)?;

    if cli.dry_run {
        handle_dry_run(&config, &uris);
        return Ok(());
    }

    let coordinator = Coordinator::new(&config)?;
    let report = coordinator.run(uris).await;
    print_report(&report);
    print_server_stats(&coordinator);

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_fetch=info,warn"),
            1 => EnvFilter::new("sumi_fetch=debug,info"),
            2 => EnvFilter::new("sumi_fetch=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Splits `name=value` arguments into form fields
fn parse_fields(args: &[String]) -> Result<Vec<FormField>, Box<dyn std::error::Error>> {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((name, value)) => Ok(FormField::new(name, value)),
            None => Err(format!("form field '{}' is not NAME=VALUE", arg).into()),
        })
        .collect()
}

fn build_uris(urls: &[String], fields: &[FormField]) -> sumi_fetch::Result<Vec<CrawlUri>> {
    let mut uris = Vec::with_capacity(urls.len());
    for raw in urls {
        let url = Url::parse(raw)?;
        let curi = if fields.is_empty() {
            CrawlUri::new(url)
        } else {
            CrawlUri::post(url, fields.to_vec())
        };
        uris.push(curi);
    }
    Ok(uris)
}

/// Handles the --dry-run mode: shows the effective settings and the queues
fn handle_dry_run(config: &Config, uris: &[CrawlUri]) {
    println!("=== Sumi-Fetch Dry Run ===\n");

    println!("User Agent: {}", config.user_agent.user_agent());

    println!("\nFetch:");
    println!("  Timeout: {}s", config.fetch.timeout_seconds);
    println!("  Socket timeout: {}ms", config.fetch.so_timeout_ms);
    println!("  Max length: {} bytes", config.fetch.max_length_bytes);
    println!("  Max rate: {} KB/s", config.fetch.max_fetch_kb_sec);
    println!("  HTTP/1.1: {}", config.fetch.use_http11);
    println!("  Credentials: {}", config.credentials.len());
    println!(
        "  Max concurrent queues: {}",
        config.crawler.max_concurrent_queues
    );

    println!("\nURIs ({}):", uris.len());
    for curi in uris {
        println!("  - {} [queue {}]", curi, curi.class_key);
    }

    println!("\n✓ Configuration is valid");
}

fn print_report(report: &CrawlReport) {
    for outcome in &report.outcomes {
        let curi = &outcome.curi;
        let code = if curi.fetch_status > 0 {
            curi.fetch_status.to_string()
        } else {
            format!("{} ({})", curi.fetch_status, status::describe(curi.fetch_status))
        };
        println!(
            "{} {} {}B {}ms {} {}",
            code,
            curi.uri,
            curi.content_size,
            curi.fetch_duration_ms(),
            curi.content_digest.as_deref().unwrap_or("-"),
            if curi.annotations.is_empty() {
                "-".to_string()
            } else {
                curi.annotations.join(",")
            }
        );
    }
    println!(
        "\n{} URIs, {} successes, {} retired in {:.2?}",
        report.outcomes.len(),
        report.successes(),
        report.retired().count(),
        report.elapsed
    );
}

fn print_server_stats(coordinator: &Coordinator) {
    println!("\nServers:");
    for server in coordinator.servers().servers() {
        let stats = server.substats().snapshot();
        println!(
            "  {}: {} responses, {} successes, {} bytes",
            server.key(),
            stats.fetch_responses,
            stats.fetch_successes,
            stats.total_bytes
        );
    }
}
