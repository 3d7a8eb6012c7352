//! Administrative CLI for the predicate statistics store.
//!
//! ```text
//! statsdb <endpoint-url> [-u user] [-p pass] -r
//! ```
//!
//! Connects to the remote stats store and recomputes the summary aggregates
//! from the recorded samples. Exits 0 on success and 1 on usage or I/O
//! errors; failures are printed, never raised as panics.

use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use semfed::{PredicateStatsStore, SparqlStatsBackend, StatsConfig};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(
    name = "statsdb",
    about = "Administer the predicate statistics store",
    disable_version_flag = true
)]
struct Args {
    /// SPARQL endpoint URL of the stats store
    endpoint: String,

    /// Username for basic authentication
    #[arg(short = 'u', long = "username")]
    username: Option<String>,

    /// Password for basic authentication
    #[arg(short = 'p', long = "password")]
    password: Option<String>,

    /// Recompute summary statistics from the recorded samples
    #[arg(short = 'r', long = "recompute")]
    recompute: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // usage problems exit 1, matching the documented contract
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    if !args.recompute {
        eprintln!("nothing to do: pass -r to recompute summary statistics");
        return ExitCode::from(1);
    }

    if url::Url::parse(&args.endpoint).is_err() {
        eprintln!("invalid endpoint URL: {}", args.endpoint);
        return ExitCode::from(1);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("statsdb: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let credentials = match (args.username, args.password) {
        (Some(user), Some(pass)) => Some((user, pass)),
        (Some(user), None) => Some((user, String::new())),
        _ => None,
    };

    let backend = SparqlStatsBackend::new(&args.endpoint, credentials)
        .context("failed to set up stats store client")?;
    let store = PredicateStatsStore::open(Arc::new(backend), StatsConfig::default())
        .await
        .context("failed to load samples from the stats store")?;

    let samples = store.sample_count().await;
    store
        .recompute_stats()
        .await
        .context("failed to recompute summary statistics")?;

    println!("recomputed summary statistics over {samples} samples");
    Ok(())
}
