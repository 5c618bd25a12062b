//! Orchestrator: runs a pipeline of dependent transactions

use super::dependency::DependencyGraph;
use super::step::{resolve_args, Pipeline, StepResult, StepStatus, TransactionStep};
use crate::config::OrchestratorConfig;
use crate::contract::SendOverrides;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::tx::NonceTracker;

use chrono::{DateTime, Utc};
use ethers::abi::Token;
use ethers::types::{TransactionReceipt, H256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Progress reported by a running step
#[derive(Debug)]
enum StepEvent {
    Submitted {
        step: String,
        nonce: u64,
        tx_hash: H256,
        output: Option<Vec<Token>>,
        at: DateTime<Utc>,
    },
    Confirmed {
        step: String,
        receipt: TransactionReceipt,
    },
    /// Submitted without waiting for a receipt
    Released { step: String },
    Failed {
        step: String,
        nonce: Option<u64>,
        error: OrchestratorError,
    },
}

/// Outcome of a pipeline run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Results in pipeline order
    pub results: Vec<StepResult>,
}

impl RunReport {
    pub fn get(&self, step: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_id == step)
    }

    /// Steps that failed or never started
    pub fn failures(&self) -> Vec<&StepResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.status, StepStatus::Failed | StepStatus::Pending))
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failures().is_empty()
    }
}

/// Sequences dependent transaction steps across networks
pub struct Orchestrator {
    nonce_tracker: Arc<NonceTracker>,
    config: OrchestratorConfig,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl Orchestrator {
    pub fn new(nonce_tracker: Arc<NonceTracker>, config: OrchestratorConfig) -> Self {
        Self {
            nonce_tracker,
            config,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn nonce_tracker(&self) -> &Arc<NonceTracker> {
        &self.nonce_tracker
    }

    /// Stop starting new steps; steps already in flight run to completion
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Orchestrator shutdown initiated");
    }

    async fn is_stopped(&self) -> bool {
        *self.shutdown.read().await
    }

    /// Run every step of `pipeline`, returning once nothing more can start.
    ///
    /// Only an invalid pipeline is an error; step failures are reported in
    /// the returned `RunReport`.
    pub async fn run(&self, mut pipeline: Pipeline) -> OrchestratorResult<RunReport> {
        let mut graph = DependencyGraph::build(&mut pipeline)?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("run", %run_id, pipeline = %pipeline.name);

        info!(parent: &span, "Running pipeline {} ({} steps)", pipeline.name, pipeline.len());

        let steps: HashMap<String, Arc<TransactionStep>> = pipeline
            .steps
            .iter()
            .map(|s| (s.id.clone(), Arc::new(s.clone())))
            .collect();
        let mut results: HashMap<String, StepResult> = pipeline
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepResult::pending(s)))
            .collect();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut started: HashSet<String> = HashSet::new();
        let mut handles = Vec::new();
        let mut in_flight = 0usize;
        let mut halted = false;

        loop {
            if !halted && self.is_stopped().await {
                warn!(parent: &span, "Run cancelled; no further steps will start");
                halted = true;
            }

            if !halted {
                for id in graph.ready_steps(&started) {
                    started.insert(id.clone());
                    let step = steps[&id].clone();

                    let args = match resolve_args(&step.args, &results) {
                        Ok(args) => args,
                        Err(e) => {
                            error!(parent: &span, "Step {} has unresolvable arguments: {}", id, e);
                            graph.mark_failed(&id);
                            record_failure(&mut results, &id, None, e);
                            continue;
                        }
                    };

                    debug!(parent: &span, "Starting step {}", id);
                    in_flight += 1;
                    let step_span = info_span!(parent: &span, "step", step = %id, chain_id = step.chain_id());
                    handles.push(tokio::spawn(
                        execute_step(
                            step,
                            args,
                            self.nonce_tracker.clone(),
                            Duration::from_secs(self.config.confirmation_timeout_secs),
                            event_tx.clone(),
                        )
                        .instrument(step_span),
                    ));
                }
            }

            if in_flight == 0 {
                break;
            }

            let Some(event) = event_rx.recv().await else {
                break;
            };

            match event {
                StepEvent::Submitted {
                    step,
                    nonce,
                    tx_hash,
                    output,
                    at,
                } => {
                    info!(parent: &span, "Step {} submitted: {:?} (nonce {})", step, tx_hash, nonce);
                    graph.mark_submitted(&step);
                    if let Some(result) = results.get_mut(&step) {
                        crate::metrics::record_step_submitted(result.chain_id);
                        result.status = StepStatus::Submitted;
                        result.nonce = Some(nonce);
                        result.tx_hash = Some(tx_hash);
                        result.output = output;
                        result.submitted_at = Some(at);
                    }
                }
                StepEvent::Confirmed { step, receipt } => {
                    in_flight -= 1;
                    info!(parent: &span, "Step {} confirmed", step);
                    graph.mark_confirmed(&step);
                    if let Some(result) = results.get_mut(&step) {
                        let now = Utc::now();
                        if let Some(submitted) = result.submitted_at {
                            let latency = (now - submitted).num_milliseconds() as f64 / 1000.0;
                            crate::metrics::record_confirmation_latency(result.chain_id, latency);
                        }
                        crate::metrics::record_step_confirmed(result.chain_id);
                        result.status = StepStatus::Confirmed;
                        result.receipt = Some(receipt);
                        result.finished_at = Some(now);
                    }
                }
                StepEvent::Released { step } => {
                    in_flight -= 1;
                    debug!(parent: &span, "Step {} left unconfirmed by request", step);
                    if let Some(result) = results.get_mut(&step) {
                        result.finished_at = Some(Utc::now());
                    }
                }
                StepEvent::Failed { step, nonce, error } => {
                    in_flight -= 1;
                    error!(parent: &span, "Step {} failed: {}", step, error);
                    graph.mark_failed(&step);

                    let blocked = graph.transitive_dependents(&step);
                    if !blocked.is_empty() {
                        warn!(
                            parent: &span,
                            "Not starting {} step(s) that depend on {}",
                            blocked.len(),
                            step
                        );
                    }

                    if error.is_fatal() || self.config.halt_on_failure {
                        warn!(parent: &span, "Halting run after failure of {}", step);
                        halted = true;
                    }
                    record_failure(&mut results, &step, nonce, error);
                }
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(parent: &span, "Step task panicked: {}", e);
            }
        }

        // Explain every step that never started
        let cancelled = self.is_stopped().await;
        for id in graph.order() {
            if let Some(result) = results.get_mut(id) {
                if result.status != StepStatus::Pending {
                    continue;
                }
                result.error = Some(match graph.failed_ancestor(id) {
                    Some(dependency) => OrchestratorError::DependencyFailed {
                        step: id.clone(),
                        dependency,
                    },
                    None if cancelled => OrchestratorError::Cancelled { step: id.clone() },
                    None => OrchestratorError::Pipeline(format!(
                        "Step {} not started after the run halted",
                        id
                    )),
                });
            }
        }

        let report = RunReport {
            run_id,
            pipeline: pipeline.name.clone(),
            started_at,
            finished_at: Utc::now(),
            results: graph
                .order()
                .iter()
                .filter_map(|id| results.remove(id))
                .collect(),
        };

        info!(
            parent: &span,
            "Pipeline {} finished: {} of {} steps succeeded",
            report.pipeline,
            report.results.len() - report.failures().len(),
            report.results.len()
        );

        Ok(report)
    }
}

fn record_failure(
    results: &mut HashMap<String, StepResult>,
    step: &str,
    nonce: Option<u64>,
    error: OrchestratorError,
) {
    if let Some(result) = results.get_mut(step) {
        crate::metrics::record_step_failed(result.chain_id, error.kind());
        result.status = StepStatus::Failed;
        if nonce.is_some() {
            result.nonce = nonce;
        }
        result.error = Some(error);
        result.finished_at = Some(Utc::now());
    }
}

/// Execute one step: capture output, allocate a nonce, send and optionally confirm
async fn execute_step(
    step: Arc<TransactionStep>,
    args: Vec<Token>,
    nonce_tracker: Arc<NonceTracker>,
    confirmation_timeout: Duration,
    events: mpsc::UnboundedSender<StepEvent>,
) {
    let outcome = submit_step(&step, &args, &nonce_tracker).await;

    let (nonce, tx_hash, output) = match outcome {
        Ok(submitted) => submitted,
        Err((nonce, error)) => {
            let _ = events.send(StepEvent::Failed {
                step: step.id.clone(),
                nonce,
                error,
            });
            return;
        }
    };

    let _ = events.send(StepEvent::Submitted {
        step: step.id.clone(),
        nonce,
        tx_hash,
        output,
        at: Utc::now(),
    });

    if !step.requires_confirmation {
        let _ = events.send(StepEvent::Released {
            step: step.id.clone(),
        });
        return;
    }

    let event = match step
        .binding
        .connection()
        .await_confirmation(tx_hash, confirmation_timeout)
        .await
    {
        Ok(receipt) => StepEvent::Confirmed {
            step: step.id.clone(),
            receipt,
        },
        Err(error) => StepEvent::Failed {
            step: step.id.clone(),
            nonce: Some(nonce),
            error,
        },
    };
    let _ = events.send(event);
}

type Submitted = (u64, H256, Option<Vec<Token>>);

async fn submit_step(
    step: &TransactionStep,
    args: &[Token],
    nonce_tracker: &NonceTracker,
) -> Result<Submitted, (Option<u64>, OrchestratorError)> {
    let signer = &step.signer;
    let connection = step.binding.connection();

    let output = if step.capture_output {
        let decoded = step
            .binding
            .simulate(&step.method, args, signer.address(), step.value)
            .await
            .map_err(|e| (None, e))?;
        debug!("Step {} will return {:?}", step.id, decoded);
        Some(decoded)
    } else {
        None
    };

    let nonce = nonce_tracker
        .next(signer.address(), connection)
        .await
        .map_err(|e| (None, e))?;

    let overrides = SendOverrides {
        nonce,
        gas_limit: step.gas_limit,
        value: step.value,
    };

    // Nothing has left the process until `submit`, so the nonce can be handed back
    let raw = match step
        .binding
        .prepare(&step.method, args, signer, &overrides)
        .await
    {
        Ok(tx) => signer.sign(&tx).await,
        Err(e) => Err(e),
    };
    let raw = match raw {
        Ok(raw) => raw,
        Err(e) => {
            nonce_tracker
                .release(signer.address(), connection.chain_id(), nonce)
                .await;
            return Err((Some(nonce), e));
        }
    };

    let tx_hash = connection.submit(raw).await.map_err(|e| (Some(nonce), e))?;

    info!(
        "Sent {}.{} from {:?} with nonce {}: {:?}",
        step.binding.name(),
        step.method,
        signer.address(),
        nonce,
        tx_hash
    );

    Ok((nonce, tx_hash, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::FakeChain;
    use crate::contract::{ContractBinding, ContractInterface};
    use crate::coordination::step::StepArg;
    use crate::tx::signer::tests::{DEV_KEY, DEV_KEY_2};
    use crate::tx::{BoundSigner, Credential};
    use ethers::abi::encode;
    use ethers::types::{Address, U256};

    const TOKEN: &[&str] = &[
        "function approve(address spender, uint256 amount) returns (bool)",
        "function spend(uint256 amount) returns (bool)",
        "function swap(uint256 amountIn) returns (uint256[] amounts)",
        "function deposit(uint256 amount) returns (uint256)",
    ];

    struct Network {
        chain: Arc<FakeChain>,
        binding: Arc<ContractBinding>,
        signer: BoundSigner,
    }

    impl Network {
        fn new(chain_id: u64, key: &str) -> Self {
            let chain = FakeChain::new(chain_id);
            let connection = Arc::new(chain.connection(&format!("chain-{}", chain_id)));
            let binding = ContractBinding::new(
                "token",
                Address::repeat_byte(0x44),
                Arc::new(ContractInterface::parse(TOKEN).unwrap()),
                connection.clone(),
                &["approve", "spend", "swap", "deposit"],
            )
            .unwrap();
            let signer = Credential::from_private_key("dev", key)
                .unwrap()
                .connect(connection);
            Self {
                chain,
                binding: Arc::new(binding),
                signer,
            }
        }

        fn step(&self, id: &str, method: &str, args: Vec<StepArg>) -> TransactionStep {
            TransactionStep::new(id, self.binding.clone(), self.signer.clone(), method)
                .args(args)
                .gas_limit(200_000u64)
        }

        fn selector(&self, method: &str) -> [u8; 4] {
            self.binding.interface().selector(method).unwrap()
        }

        fn sent_args(&self, method: &str) -> Vec<Token> {
            let sent = self.chain.submission_for(self.selector(method)).unwrap();
            self.binding
                .interface()
                .function(method)
                .unwrap()
                .decode_input(&sent.input[4..])
                .unwrap()
        }
    }

    fn orchestrator(timeout_secs: u64) -> Orchestrator {
        Orchestrator::new(
            Arc::new(NonceTracker::new()),
            OrchestratorConfig {
                confirmation_timeout_secs: timeout_secs,
                poll_interval_ms: 5,
                halt_on_failure: false,
            },
        )
    }

    fn approve(net: &Network, id: &str) -> TransactionStep {
        net.step(
            id,
            "approve",
            vec![StepArg::address(Address::repeat_byte(0x55)), StepArg::uint(1u64)],
        )
    }

    #[tokio::test]
    async fn test_approve_then_spend() {
        let net = Network::new(31337, DEV_KEY);
        net.chain.set_transaction_count(net.signer.address(), 10);

        let mut pipeline = Pipeline::new("allowance");
        pipeline.push(approve(&net, "approve"));
        pipeline.push(
            net.step("spend", "spend", vec![StepArg::uint(1u64)])
                .after_confirmed("approve"),
        );

        let report = orchestrator(5).run(pipeline).await.unwrap();
        assert!(report.is_success());

        let approve = report.get("approve").unwrap();
        let spend = report.get("spend").unwrap();
        assert_eq!(approve.status, StepStatus::Confirmed);
        assert_eq!(spend.status, StepStatus::Confirmed);
        assert_eq!(approve.nonce, Some(10));
        assert_eq!(spend.nonce, Some(11));

        // Spend is only broadcast after the approval is mined
        let sent = net.chain.submissions();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].selector(), net.selector("approve"));
        assert_eq!(sent[1].selector(), net.selector("spend"));
        assert!(approve.finished_at.unwrap() <= spend.submitted_at.unwrap());
    }

    #[tokio::test]
    async fn test_swap_output_feeds_deposit() {
        let net = Network::new(31337, DEV_KEY);
        let swap_out = U256::from_dec_str("2431000000000000000000").unwrap();
        net.chain.respond_to_call(
            net.selector("swap"),
            encode(&[Token::Array(vec![
                Token::Uint(U256::exp10(18)),
                Token::Uint(swap_out),
            ])]),
        );

        let mut pipeline = Pipeline::new("swap-deposit");
        pipeline.push(net.step("swap", "swap", vec![StepArg::uint(U256::exp10(18))]));
        pipeline.push(net.step("deposit", "deposit", vec![StepArg::output_last("swap", 0)]));

        let report = orchestrator(5).run(pipeline).await.unwrap();
        assert!(report.is_success());

        assert_eq!(net.sent_args("deposit"), vec![Token::Uint(swap_out)]);
        assert!(report.get("swap").unwrap().output.is_some());
    }

    #[tokio::test]
    async fn test_confirmation_timeout_blocks_dependents() {
        let net = Network::new(31337, DEV_KEY);
        net.chain.stall_on(net.selector("approve"));

        let mut pipeline = Pipeline::new("timeout");
        pipeline.push(approve(&net, "approve"));
        pipeline.push(
            net.step("spend", "spend", vec![StepArg::uint(1u64)])
                .after_confirmed("approve"),
        );

        let report = orchestrator(1).run(pipeline).await.unwrap();
        assert!(!report.is_success());

        let approve = report.get("approve").unwrap();
        assert_eq!(approve.status, StepStatus::Failed);
        assert!(approve.tx_hash.is_some());
        assert!(matches!(approve.error, Some(OrchestratorError::Timeout { .. })));

        let spend = report.get("spend").unwrap();
        assert_eq!(spend.status, StepStatus::Pending);
        assert!(matches!(
            spend.error,
            Some(OrchestratorError::DependencyFailed { .. })
        ));
        assert_eq!(net.chain.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_ordering_only_does_not_wait_for_receipt() {
        let net = Network::new(31337, DEV_KEY);
        net.chain.stall_on(net.selector("approve"));

        let mut pipeline = Pipeline::new("back-to-back");
        pipeline.push(approve(&net, "approve"));
        pipeline.push(net.step("spend", "spend", vec![StepArg::uint(1u64)]).after("approve"));

        let report = orchestrator(1).run(pipeline).await.unwrap();

        let approve = report.get("approve").unwrap();
        let spend = report.get("spend").unwrap();
        assert_eq!(spend.status, StepStatus::Confirmed);
        assert_eq!(approve.status, StepStatus::Failed);
        assert!(spend.nonce.unwrap() > approve.nonce.unwrap());
    }

    #[tokio::test]
    async fn test_revert_stops_transitive_dependents_only() {
        let net = Network::new(31337, DEV_KEY);
        net.chain.revert_on(net.selector("approve"));

        let mut pipeline = Pipeline::new("revert");
        pipeline.push(approve(&net, "approve"));
        pipeline.push(
            net.step("spend", "spend", vec![StepArg::uint(1u64)])
                .after_confirmed("approve"),
        );
        pipeline.push(
            net.step("deposit", "deposit", vec![StepArg::uint(5u64)])
                .after("spend"),
        );
        pipeline.push(net.step("swap", "swap", vec![StepArg::uint(3u64)]));

        let report = orchestrator(5).run(pipeline).await.unwrap();

        assert!(matches!(
            report.get("approve").unwrap().error,
            Some(OrchestratorError::Revert { .. })
        ));
        for blocked in ["spend", "deposit"] {
            let result = report.get(blocked).unwrap();
            assert_eq!(result.status, StepStatus::Pending);
            assert!(result.tx_hash.is_none());
        }
        assert_eq!(report.get("swap").unwrap().status, StepStatus::Confirmed);
        assert_eq!(report.failures().len(), 3);
    }

    #[tokio::test]
    async fn test_networks_are_independent() {
        let fork = Network::new(31337, DEV_KEY);
        let testnet = Network::new(11155111, DEV_KEY_2);
        testnet.chain.revert_on(testnet.selector("deposit"));
        fork.chain.set_transaction_count(fork.signer.address(), 3);
        testnet.chain.set_transaction_count(testnet.signer.address(), 90);

        let mut pipeline = Pipeline::new("two-networks");
        pipeline.push(approve(&fork, "fork-approve"));
        pipeline.push(testnet.step("vault-deposit", "deposit", vec![StepArg::uint(1u64)]));
        pipeline.push(
            fork.step("fork-spend", "spend", vec![StepArg::uint(1u64)])
                .after_confirmed("fork-approve"),
        );

        let report = orchestrator(5).run(pipeline).await.unwrap();

        assert_eq!(report.get("fork-approve").unwrap().status, StepStatus::Confirmed);
        assert_eq!(report.get("fork-spend").unwrap().status, StepStatus::Confirmed);
        assert_eq!(report.get("fork-spend").unwrap().nonce, Some(4));

        let vault = report.get("vault-deposit").unwrap();
        assert_eq!(vault.status, StepStatus::Failed);
        assert_eq!(vault.nonce, Some(90));
    }

    #[tokio::test]
    async fn test_independent_steps_share_nonce_sequence() {
        let net = Network::new(31337, DEV_KEY);
        net.chain.set_transaction_count(net.signer.address(), 20);

        let mut pipeline = Pipeline::new("parallel");
        for i in 0..6 {
            pipeline.push(approve(&net, &format!("approve-{}", i)));
        }

        let orchestrator = orchestrator(5);
        let report = orchestrator.run(pipeline).await.unwrap();
        assert!(report.is_success());

        let mut nonces: Vec<u64> = report.results.iter().filter_map(|r| r.nonce).collect();
        nonces.sort_unstable();
        assert_eq!(nonces, (20..26).collect::<Vec<u64>>());
        assert_eq!(
            orchestrator
                .nonce_tracker()
                .issued(net.signer.address(), 31337)
                .await,
            nonces
        );
    }

    #[tokio::test]
    async fn test_broadcast_failure_keeps_nonce() {
        let net = Network::new(31337, DEV_KEY);
        net.chain.refuse_broadcasts();

        let mut pipeline = Pipeline::new("refused");
        pipeline.push(approve(&net, "approve"));

        let orchestrator = orchestrator(5);
        let report = orchestrator.run(pipeline).await.unwrap();

        let approve = report.get("approve").unwrap();
        assert_eq!(approve.status, StepStatus::Failed);
        assert_eq!(approve.nonce, Some(0));
        assert!(matches!(approve.error, Some(OrchestratorError::Network { .. })));
        // The payload may have reached the node, so the nonce is not reused
        assert_eq!(
            orchestrator
                .nonce_tracker()
                .peek(net.signer.address(), 31337)
                .await,
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_fire_and_forget_step_is_success() {
        let net = Network::new(31337, DEV_KEY);
        net.chain.stall_on(net.selector("approve"));

        let mut pipeline = Pipeline::new("unconfirmed");
        pipeline.push(approve(&net, "approve").fire_and_forget());

        let report = orchestrator(1).run(pipeline).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.get("approve").unwrap().status, StepStatus::Submitted);
    }

    #[tokio::test]
    async fn test_stopped_run_starts_nothing() {
        let net = Network::new(31337, DEV_KEY);

        let mut pipeline = Pipeline::new("cancelled");
        pipeline.push(approve(&net, "approve"));

        let orchestrator = orchestrator(5);
        orchestrator.stop().await;
        let report = orchestrator.run(pipeline).await.unwrap();

        assert!(net.chain.submissions().is_empty());
        assert!(matches!(
            report.get("approve").unwrap().error,
            Some(OrchestratorError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_pipeline_is_rejected_before_sending() {
        let net = Network::new(31337, DEV_KEY);

        let mut pipeline = Pipeline::new("invalid");
        pipeline.push(net.step("spend", "spend", vec![]));

        let err = orchestrator(5).run(pipeline).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Pipeline(_)));
        assert!(net.chain.submissions().is_empty());
    }
}
