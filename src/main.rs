//! Pipeline Orchestrator - dependent multi-network DeFi transaction pipelines
//!
//! Runs one fixed pipeline: a wrap, swap, supply and borrow sequence on a
//! mainnet fork and a vault deposit on Sepolia, with explicit nonce
//! management and dependency-aware confirmation waits.

use anyhow::{Context, Result};
use ethers::types::Address;
use ethers::utils::format_ether;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

mod chain;
mod config;
mod contract;
mod coordination;
mod error;
mod metrics;
mod pipeline;
mod tx;

use chain::{ChainConnection, ChainManager};
use config::Settings;
use coordination::{Orchestrator, RunReport};
use pipeline::{ForkContracts, FORK_CHAIN_ID};
use tx::{Credential, NonceTracker};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Pipeline Orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} networks",
        settings.enabled_networks().len()
    );

    let credentials = load_credentials(&settings)?;

    let chains = ChainManager::new(&settings).await?;
    info!("Chain connections initialized");

    let pipeline = pipeline::build_pipeline(&settings, &chains, &credentials)?;

    println!("== Balances before ==");
    print_balances(&settings, &chains, &credentials).await;

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(NonceTracker::new()),
        settings.orchestrator.clone(),
    ));

    let mut run = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run(pipeline).await }
    });

    let report = tokio::select! {
        res = &mut run => res?,
        _ = shutdown_signal() => {
            warn!("Shutdown signal received; waiting for steps already in flight");
            orchestrator.stop().await;
            run.await?
        }
    }?;

    print_report(&report);

    println!("== Balances after ==");
    print_balances(&settings, &chains, &credentials).await;

    if settings.metrics.enabled {
        println!("== Metrics ==");
        print!("{}", metrics::render());
    }

    if !report.is_success() {
        warn!("Run {} finished with failures", report.run_id);
        std::process::exit(1);
    }

    info!("Run {} completed", report.run_id);
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pipeline_orchestrator=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Load the credential of every enabled network from its environment variable
fn load_credentials(settings: &Settings) -> Result<HashMap<String, Credential>> {
    let mut credentials = HashMap::new();

    for (network, config) in settings.enabled_networks() {
        if credentials.contains_key(&config.credential) {
            continue;
        }
        let entry = settings
            .credentials
            .get(&config.credential)
            .with_context(|| format!("Network {} has no credential entry", network))?;
        let credential = Credential::from_env(&config.credential, &entry.private_key_env)?;
        credentials.insert(config.credential.clone(), credential);
    }

    Ok(credentials)
}

async fn print_balances(
    settings: &Settings,
    chains: &ChainManager,
    credentials: &HashMap<String, Credential>,
) {
    let lines = futures::future::join_all(chains.connections().into_iter().filter_map(
        |connection| {
            let network = settings.get_network_by_id(connection.chain_id())?;
            let credential = credentials.get(&network.credential)?;
            Some(balance_line(settings, connection, credential.address()))
        },
    ))
    .await;

    for line in lines {
        println!("{}", line);
    }
}

async fn balance_line(
    settings: &Settings,
    connection: Arc<ChainConnection>,
    owner: Address,
) -> String {
    let mut line = format!("[{}] {:?}", connection.name(), owner);

    match connection.get_balance(owner).await {
        Ok(balance) => line.push_str(&format!(" ETH={}", format_ether(balance))),
        Err(e) => line.push_str(&format!(" ETH=<{}>", e)),
    }

    if connection.chain_id() == FORK_CHAIN_ID {
        match ForkContracts::bind(settings, &connection) {
            Ok(contracts) => {
                for token in [&contracts.weth, &contracts.dai] {
                    match pipeline::token_balance(token, owner).await {
                        Ok(amount) => {
                            line.push_str(&format!(" {}={}", token.name(), format_ether(amount)))
                        }
                        Err(e) => warn!("Cannot read {} balance: {:#}", token.name(), e),
                    }
                }
            }
            Err(e) => warn!("Cannot bind fork contracts: {:#}", e),
        }
    }

    line
}

fn print_report(report: &RunReport) {
    println!("== Run {} ({}) ==", report.run_id, report.pipeline);

    for result in &report.results {
        let hash = result
            .tx_hash
            .map(|h| format!("{:?}", h))
            .unwrap_or_else(|| "-".to_string());
        let nonce = result
            .nonce
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<16} chain={:<9} status={:<10} nonce={:<5} tx={}",
            result.step_id,
            result.chain_id,
            result.status.as_str(),
            nonce,
            hash
        );

        if let Some(output) = &result.output {
            println!("  output: {:?}", output);
        }
        if let Some(error) = &result.error {
            println!("  error: {}", error);
        }
        if let Some(receipt) = &result.receipt {
            match serde_json::to_string_pretty(receipt) {
                Ok(json) => println!("  receipt: {}", json),
                Err(e) => warn!("Cannot serialize receipt for {}: {}", result.step_id, e),
            }
        }
    }

    println!(
        "Finished in {}s: {} of {} steps succeeded",
        (report.finished_at - report.started_at).num_seconds(),
        report.results.len() - report.failures().len(),
        report.results.len()
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
