//! The fixed DeFi pipeline run by the binary
//!
//! On the mainnet fork: wrap ETH, swap WETH for DAI through the router,
//! supply the DAI to the lending pool and borrow WETH against it. On Sepolia:
//! a payable deposit into the vault.

use crate::chain::{ChainConnection, ChainManager};
use crate::config::{parse_address, NetworkConfig, Settings};
use crate::contract::{ContractBinding, ContractInterface};
use crate::coordination::{Pipeline, StepArg, TransactionStep};
use crate::tx::{BoundSigner, Credential};

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use ethers::abi::Token;
use ethers::types::{Address, U256};
use ethers::utils::parse_ether;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const FORK_CHAIN_ID: u64 = 31337;
pub const SEPOLIA_CHAIN_ID: u64 = 11155111;

pub const WETH_ABI: &[&str] = &[
    "function deposit() payable",
    "function approve(address spender, uint256 amount) returns (bool)",
    "function balanceOf(address owner) view returns (uint256)",
];

pub const ERC20_ABI: &[&str] = &[
    "function approve(address spender, uint256 amount) returns (bool)",
    "function balanceOf(address owner) view returns (uint256)",
];

pub const ROUTER_ABI: &[&str] = &[
    "function swapExactTokensForTokens(uint256 amountIn, uint256 amountOutMin, address[] path, address to, uint256 deadline) returns (uint256[] amounts)",
    "function getAmountsOut(uint256 amountIn, address[] path) view returns (uint256[] amounts)",
];

pub const POOL_ABI: &[&str] = &[
    "function supply(address asset, uint256 amount, address onBehalfOf, uint16 referralCode)",
    "function borrow(address asset, uint256 amount, uint256 interestRateMode, uint16 referralCode, address onBehalfOf)",
];

pub const VAULT_ABI: &[&str] = &["function deposit() payable returns (uint256 shares)"];

/// Variable-rate borrowing on the lending pool
const VARIABLE_RATE: u64 = 2;
const SWAP_DEADLINE_MINUTES: i64 = 20;

/// Bindings for the contracts used on the fork
#[derive(Debug, Clone)]
pub struct ForkContracts {
    pub weth: Arc<ContractBinding>,
    pub dai: Arc<ContractBinding>,
    pub router: Arc<ContractBinding>,
    pub pool: Arc<ContractBinding>,
}

impl ForkContracts {
    pub fn bind(settings: &Settings, connection: &Arc<ChainConnection>) -> Result<Self> {
        let contracts = &settings.contracts;
        Ok(Self {
            weth: bind(
                "weth",
                &contracts.weth,
                WETH_ABI,
                connection,
                &["deposit", "approve", "balanceOf"],
            )?,
            dai: bind(
                "dai",
                &contracts.dai,
                ERC20_ABI,
                connection,
                &["approve", "balanceOf"],
            )?,
            router: bind(
                "router",
                &contracts.router,
                ROUTER_ABI,
                connection,
                &["swapExactTokensForTokens"],
            )?,
            pool: bind(
                "lending_pool",
                &contracts.lending_pool,
                POOL_ABI,
                connection,
                &["supply", "borrow"],
            )?,
        })
    }
}

fn bind(
    name: &str,
    address: &str,
    abi: &[&str],
    connection: &Arc<ChainConnection>,
    required: &[&str],
) -> Result<Arc<ContractBinding>> {
    let interface = Arc::new(ContractInterface::parse(abi)?);
    let binding = ContractBinding::new(
        name,
        parse_address(address)?,
        interface,
        connection.clone(),
        required,
    )?;
    Ok(Arc::new(binding))
}

fn ether(value: &str) -> Result<U256> {
    parse_ether(value).with_context(|| format!("Invalid ether amount {}", value))
}

/// Resolve the connection and signer for a network, if it is enabled and connected
fn segment_signer(
    chain_id: u64,
    settings: &Settings,
    chains: &ChainManager,
    credentials: &HashMap<String, Credential>,
) -> Result<Option<(Arc<ChainConnection>, BoundSigner)>> {
    let Some(network) = settings
        .get_network_by_id(chain_id)
        .filter(|n: &&NetworkConfig| n.enabled)
    else {
        warn!("No enabled network with chain id {}; skipping its steps", chain_id);
        return Ok(None);
    };

    let Ok(connection) = chains.get_connection(chain_id) else {
        warn!("Chain {} is not connected; skipping its steps", chain_id);
        return Ok(None);
    };

    let credential = credentials
        .get(&network.credential)
        .with_context(|| format!("Credential {} is not loaded", network.credential))?;

    Ok(Some((connection.clone(), credential.connect(connection))))
}

/// Build the full pipeline for every configured network
pub fn build_pipeline(
    settings: &Settings,
    chains: &ChainManager,
    credentials: &HashMap<String, Credential>,
) -> Result<Pipeline> {
    let mut pipeline = Pipeline::new("defi-pipeline");

    if let Some((connection, signer)) =
        segment_signer(FORK_CHAIN_ID, settings, chains, credentials)?
    {
        let contracts = ForkContracts::bind(settings, &connection)?;
        add_fork_steps(&mut pipeline, settings, &contracts, &signer)?;
    }

    if let Some((connection, signer)) =
        segment_signer(SEPOLIA_CHAIN_ID, settings, chains, credentials)?
    {
        let vault = bind(
            "vault",
            &settings.contracts.vault,
            VAULT_ABI,
            &connection,
            &["deposit"],
        )?;
        pipeline.push(
            TransactionStep::new("vault-deposit", vault, signer, "deposit")
                .value(ether(&settings.amounts.vault_deposit_eth)?)
                .gas_limit(settings.amounts.vault_gas_limit),
        );
    }

    if pipeline.is_empty() {
        anyhow::bail!("No steps to run; neither the fork nor Sepolia is available");
    }

    info!("Built pipeline {} with {} steps", pipeline.name, pipeline.len());
    Ok(pipeline)
}

fn add_fork_steps(
    pipeline: &mut Pipeline,
    settings: &Settings,
    contracts: &ForkContracts,
    signer: &BoundSigner,
) -> Result<()> {
    let amounts = &settings.amounts;
    let swap_in = ether(&amounts.swap_in_eth)?;
    let borrow = ether(&amounts.borrow_eth)?;
    let me = signer.address();
    let deadline = (Utc::now() + Duration::minutes(SWAP_DEADLINE_MINUTES)).timestamp() as u64;
    let path = Token::Array(vec![
        Token::Address(contracts.weth.address()),
        Token::Address(contracts.dai.address()),
    ]);

    pipeline.push(
        TransactionStep::new("wrap", contracts.weth.clone(), signer.clone(), "deposit")
            .value(swap_in),
    );

    // Back-to-back with the wrap; nonces keep them ordered
    pipeline.push(
        TransactionStep::new(
            "approve-router",
            contracts.weth.clone(),
            signer.clone(),
            "approve",
        )
        .args(vec![
            StepArg::address(contracts.router.address()),
            StepArg::uint(swap_in),
        ])
        .after("wrap"),
    );

    pipeline.push(
        TransactionStep::new(
            "swap",
            contracts.router.clone(),
            signer.clone(),
            "swapExactTokensForTokens",
        )
        .args(vec![
            StepArg::uint(swap_in),
            StepArg::uint(0u64),
            StepArg::Literal(path),
            StepArg::address(me),
            StepArg::uint(deadline),
        ])
        .after_confirmed("wrap")
        .after_confirmed("approve-router")
        .capture_output(),
    );

    pipeline.push(
        TransactionStep::new(
            "approve-pool",
            contracts.dai.clone(),
            signer.clone(),
            "approve",
        )
        .args(vec![
            StepArg::address(contracts.pool.address()),
            StepArg::output_last("swap", 0),
        ]),
    );

    pipeline.push(
        TransactionStep::new("supply", contracts.pool.clone(), signer.clone(), "supply")
            .args(vec![
                StepArg::address(contracts.dai.address()),
                StepArg::output_last("swap", 0),
                StepArg::address(me),
                StepArg::uint(0u64),
            ])
            .after_confirmed("approve-pool"),
    );

    pipeline.push(
        TransactionStep::new("borrow", contracts.pool.clone(), signer.clone(), "borrow")
            .args(vec![
                StepArg::address(contracts.weth.address()),
                StepArg::uint(borrow),
                StepArg::uint(VARIABLE_RATE),
                StepArg::uint(0u64),
                StepArg::address(me),
            ])
            .after("supply"),
    );

    Ok(())
}

/// Read a token balance through a binding's `balanceOf`
pub async fn token_balance(token: &ContractBinding, owner: Address) -> Result<U256> {
    let output = token
        .call("balanceOf", &[Token::Address(owner)])
        .await?;
    output
        .first()
        .cloned()
        .and_then(Token::into_uint)
        .with_context(|| format!("{} balanceOf returned no amount", token.name()))
}
