//! Transfer workloads.

use rand::rngs::StdRng;
use rand::Rng;

use tallybank_common::AccountId;
use tallybank_ledger::TransferTxParams;

/// Shape of the transfers generated by the simulation workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    /// Alternating transfers between the first two accounts.
    PingPong,
    /// Every other account pays into the first one.
    FanIn,
    /// Random distinct pairs.
    Random,
    /// Random pairs with amounts often above the source balance.
    Overdraft,
}

impl Workload {
    pub const NAMES: [&'static str; 4] = ["ping-pong", "fan-in", "random", "overdraft"];

    /// Load a workload by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "ping-pong" => Ok(Self::PingPong),
            "fan-in" => Ok(Self::FanIn),
            "random" => Ok(Self::Random),
            "overdraft" => Ok(Self::Overdraft),
            _ => Err(anyhow::anyhow!(
                "Unknown workload: {} (expected one of {})",
                name,
                Self::NAMES.join(", ")
            )),
        }
    }

    /// Produce the `seq`-th transfer of a worker.
    pub fn next_transfer(
        &self,
        accounts: &[AccountId],
        initial_balance: i64,
        seq: usize,
        rng: &mut StdRng,
    ) -> TransferTxParams {
        match self {
            Self::PingPong => {
                let (from, to) = if seq % 2 == 0 {
                    (accounts[0], accounts[1])
                } else {
                    (accounts[1], accounts[0])
                };
                TransferTxParams::new(from, to, 10)
            }
            Self::FanIn => {
                let from = accounts[1 + seq % (accounts.len() - 1)];
                TransferTxParams::new(from, accounts[0], rng.gen_range(1..=10))
            }
            Self::Random => {
                let (from, to) = random_pair(accounts, rng);
                TransferTxParams::new(from, to, rng.gen_range(1..=50))
            }
            Self::Overdraft => {
                let (from, to) = random_pair(accounts, rng);
                let high = initial_balance.max(1) * 2;
                TransferTxParams::new(from, to, rng.gen_range(1..=high))
            }
        }
    }
}

fn random_pair(accounts: &[AccountId], rng: &mut StdRng) -> (AccountId, AccountId) {
    let from = rng.gen_range(0..accounts.len());
    let mut to = rng.gen_range(0..accounts.len());
    while to == from {
        to = rng.gen_range(0..accounts.len());
    }
    (accounts[from], accounts[to])
}
