//! # Arbitrage Detection
//!
//! The pipeline only depends on [`ArbitrageDetector`]. [`TransferCycleDetector`]
//! is the structural detector the worker binary ships with: it looks at the
//! ordered transfer trace of one transaction and flags an account that sends a
//! token out and later gets strictly more of the same token back, without
//! losing anything in the other tokens it touched.

use crate::decode::TransferEvent;
use crate::error::DetectionError;
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

/// A detected arbitrage, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arbitrage {
    pub tx_hash: H256,
    pub block_number: u64,
    /// Account that closed the cycle.
    pub account: Address,
    pub profit_token: Address,
    pub profit_amount: U256,
    /// Distinct tokens in the transaction, in emission order.
    pub tokens: Vec<Address>,
    pub transfer_count: usize,
}

#[async_trait]
pub trait ArbitrageDetector: Send + Sync {
    /// Inspects one transaction's transfers, ordered by `(block, log index)`.
    async fn detect(
        &self,
        tx_hash: H256,
        transfers: &[TransferEvent],
    ) -> Result<Option<Arbitrage>, DetectionError>;
}

#[derive(Debug, Clone)]
pub struct TransferCycleDetector {
    min_distinct_tokens: usize,
}

impl Default for TransferCycleDetector {
    fn default() -> Self {
        Self {
            min_distinct_tokens: 2,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Flow {
    inflow: U256,
    outflow: U256,
}

impl TransferCycleDetector {
    pub fn find_cycle(&self, tx_hash: H256, transfers: &[TransferEvent]) -> Option<Arbitrage> {
        let tokens: IndexSet<Address> = transfers.iter().map(|t| t.token).collect();
        if tokens.len() < self.min_distinct_tokens {
            return None;
        }

        let mut visited = IndexSet::new();
        for (i, first) in transfers.iter().enumerate() {
            let account = first.from;
            // mints come from the zero address and are never the trader
            if account.is_zero() || !visited.insert(account) {
                continue;
            }
            let start_token = first.token;
            let returns_later = transfers[i + 1..]
                .iter()
                .any(|t| t.to == account && t.token == start_token);
            if !returns_later {
                continue;
            }

            let flows = account_flows(account, transfers);
            let start = flows.get(&start_token).copied().unwrap_or_default();
            if start.inflow <= start.outflow {
                continue;
            }
            let loses_elsewhere = flows
                .iter()
                .any(|(token, flow)| *token != start_token && flow.inflow < flow.outflow);
            if loses_elsewhere {
                continue;
            }

            return Some(Arbitrage {
                tx_hash,
                block_number: first.block_number,
                account,
                profit_token: start_token,
                profit_amount: start.inflow - start.outflow,
                tokens: tokens.iter().copied().collect(),
                transfer_count: transfers.len(),
            });
        }
        None
    }
}

fn account_flows(account: Address, transfers: &[TransferEvent]) -> IndexMap<Address, Flow> {
    let mut flows: IndexMap<Address, Flow> = IndexMap::new();
    for t in transfers {
        if t.from == account {
            let flow = flows.entry(t.token).or_default();
            flow.outflow = flow.outflow.saturating_add(t.value);
        }
        if t.to == account {
            let flow = flows.entry(t.token).or_default();
            flow.inflow = flow.inflow.saturating_add(t.value);
        }
    }
    flows
}

#[async_trait]
impl ArbitrageDetector for TransferCycleDetector {
    async fn detect(
        &self,
        tx_hash: H256,
        transfers: &[TransferEvent],
    ) -> Result<Option<Arbitrage>, DetectionError> {
        Ok(self.find_cycle(tx_hash, transfers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn transfer(index: u64, token: u64, from: u64, to: u64, value: u64) -> TransferEvent {
        TransferEvent {
            tx_hash: H256::from_low_u64_be(1),
            block_number: 100,
            log_index: index,
            token: addr(token),
            from: addr(from),
            to: addr(to),
            value: U256::from(value),
        }
    }

    // WETH=10, USDC=11, DAI=12; trader=1, pools=2,3,4
    fn triangle(final_amount: u64) -> Vec<TransferEvent> {
        vec![
            transfer(0, 10, 1, 2, 1_000),
            transfer(1, 11, 2, 3, 5_000),
            transfer(2, 12, 3, 4, 5_000),
            transfer(3, 10, 4, 1, final_amount),
        ]
    }

    #[test]
    fn test_detects_profitable_cycle() {
        let detector = TransferCycleDetector::default();
        let arb = detector
            .find_cycle(H256::from_low_u64_be(1), &triangle(1_050))
            .expect("cycle");
        assert_eq!(arb.account, addr(1));
        assert_eq!(arb.profit_token, addr(10));
        assert_eq!(arb.profit_amount, U256::from(50u64));
        assert_eq!(arb.tokens, vec![addr(10), addr(11), addr(12)]);
        assert_eq!(arb.transfer_count, 4);
    }

    #[test]
    fn test_ignores_unprofitable_cycle() {
        let detector = TransferCycleDetector::default();
        assert!(detector
            .find_cycle(H256::from_low_u64_be(1), &triangle(990))
            .is_none());
    }

    #[test]
    fn test_ignores_single_token_traces() {
        let detector = TransferCycleDetector::default();
        let transfers = vec![
            transfer(0, 10, 1, 2, 100),
            transfer(1, 10, 2, 3, 100),
            transfer(2, 10, 3, 1, 200),
        ];
        assert!(detector
            .find_cycle(H256::from_low_u64_be(1), &transfers)
            .is_none());
    }

    #[test]
    fn test_rejects_profit_paid_for_in_other_token() {
        let detector = TransferCycleDetector::default();
        let mut transfers = triangle(1_050);
        // trader also pays out USDC it never gets back
        transfers.push(transfer(4, 11, 1, 9, 10));
        assert!(detector
            .find_cycle(H256::from_low_u64_be(1), &transfers)
            .is_none());
    }
}
