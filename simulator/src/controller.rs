//! Simulation controller.

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use tallybank_common::{AccountId, Context};
use tallybank_ledger::Ledger;

use crate::customer::{Customer, CustomerFactory};
use crate::metrics::SimulationMetrics;
use crate::scenario::Workload;

/// Run parameters of the simulation.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Concurrent transfer workers.
    pub workers: usize,
    /// Transfers issued by each worker.
    pub transfers_per_worker: usize,
    /// Opening balance of every account.
    pub initial_balance: i64,
    /// Random seed for reproducibility.
    pub seed: Option<u64>,
}

/// Result of the end-of-run balance check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conservation {
    pub expected_total: i64,
    pub actual_total: i64,
    /// Accounts that ended below zero.
    pub negative_accounts: Vec<AccountId>,
}

impl Conservation {
    pub fn holds(&self) -> bool {
        self.expected_total == self.actual_total && self.negative_accounts.is_empty()
    }
}

/// Controls the simulation.
pub struct SimulationController {
    ledger: Arc<dyn Ledger>,
    config: SimulationConfig,
    /// Customers opened by `initialize`.
    customers: Vec<Customer>,
    metrics: Arc<SimulationMetrics>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(ledger: Arc<dyn Ledger>, config: SimulationConfig) -> Self {
        Self {
            ledger,
            config,
            customers: Vec::new(),
            metrics: Arc::new(SimulationMetrics::new()),
        }
    }

    /// Open the customer accounts.
    pub async fn initialize(
        &mut self,
        ctx: &Context,
        factory: &CustomerFactory,
        run_id: &str,
        count: usize,
    ) -> anyhow::Result<()> {
        if count < 2 {
            return Err(anyhow::anyhow!("At least 2 customers are needed, got {}", count));
        }
        info!(customers = count, run_id, "Initializing simulation");

        self.customers = factory
            .create_customers(ctx, run_id, count, self.config.initial_balance)
            .await?;

        for customer in &self.customers {
            debug!(
                username = %customer.user.username,
                account_id = %customer.account.id,
                balance = customer.account.balance,
                "Opened account"
            );
        }
        Ok(())
    }

    pub fn customers(&self) -> &[Customer] {
        &self.customers
    }

    pub fn metrics(&self) -> Arc<SimulationMetrics> {
        self.metrics.clone()
    }

    /// Run `workload` on all workers until they finish or `ctx` is done.
    pub async fn run(&self, ctx: &Context, workload: Workload) -> anyhow::Result<()> {
        let accounts: Arc<Vec<AccountId>> =
            Arc::new(self.customers.iter().map(|c| c.account.id).collect());
        if accounts.len() < 2 {
            return Err(anyhow::anyhow!("Simulation not initialized"));
        }

        info!(
            workload = ?workload,
            workers = self.config.workers,
            transfers_per_worker = self.config.transfers_per_worker,
            "Running workload"
        );

        let base_seed = self.config.seed;
        let handles: Vec<_> = (0..self.config.workers)
            .map(|worker| {
                let ledger = self.ledger.clone();
                let metrics = self.metrics.clone();
                let accounts = accounts.clone();
                let ctx = ctx.clone();
                let transfers = self.config.transfers_per_worker;
                let initial_balance = self.config.initial_balance;

                let mut rng = match base_seed {
                    Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(worker as u64)),
                    None => StdRng::from_entropy(),
                };

                tokio::spawn(async move {
                    for seq in 0..transfers {
                        if ctx.err().is_some() {
                            break;
                        }
                        let arg = workload.next_transfer(&accounts, initial_balance, seq, &mut rng);

                        let started = Instant::now();
                        match ledger.transfer_tx(&ctx, arg).await {
                            Ok(_) => {
                                let latency = started.elapsed().as_micros();
                                metrics.record_success(u64::try_from(latency).unwrap_or(u64::MAX));
                            }
                            Err(err) if err.is_cancellation() => break,
                            Err(err) => {
                                debug!(worker, error = %err, "Transfer rejected");
                                metrics.record_failure(err.error_code());
                            }
                        }
                    }
                })
            })
            .collect();

        for joined in futures::future::join_all(handles).await {
            joined?;
        }
        Ok(())
    }

    /// Compare the final sum of balances with the opening sum.
    pub async fn verify_conservation(&self, ctx: &Context) -> anyhow::Result<Conservation> {
        let expected_total = self.config.initial_balance * self.customers.len() as i64;
        let mut actual_total = 0;
        let mut negative_accounts = Vec::new();

        for customer in &self.customers {
            let account = self.ledger.get_account(ctx, customer.account.id).await?;
            actual_total += account.balance;
            if account.balance < 0 {
                negative_accounts.push(account.id);
            }
        }

        let conservation = Conservation {
            expected_total,
            actual_total,
            negative_accounts,
        };
        if conservation.holds() {
            info!(total = actual_total, "Money conserved");
        } else {
            warn!(?conservation, "Money not conserved");
        }
        Ok(conservation)
    }
}
