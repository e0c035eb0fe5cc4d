//! # Batch Pipeline
//!
//! Turns the raw logs of one fetched block window into per-transaction
//! transfer traces, runs detection on them and persists what was found.
//!
//! 1. Group logs by transaction hash.
//! 2. Order each group by `(block, log index)`, the on-chain emission order.
//!    The same position twice means the window was delivered twice, which is fatal.
//! 3. Decode every log of a group; one failure drops the whole transaction.
//! 4. Keep transactions with at least `min_transfers` transfers.
//! 5. Detect, once per transaction.
//! 6. Persist the window's arbitrages in one call.

use crate::decode::{EventTable, TransferEvent};
use crate::detector::{Arbitrage, ArbitrageDetector};
use crate::error::PipelineError;
use crate::persistence::ArbitrageSink;
use ethers::types::{Log, H256};
use indexmap::IndexMap;
use std::sync::Arc;

/// One transaction's complete, ordered transfer trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCandidate {
    pub tx_hash: H256,
    pub transfers: Vec<TransferEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct AssembledBatch {
    pub candidates: Vec<TransactionCandidate>,
    /// Distinct transactions seen in the window.
    pub transactions: usize,
    /// Transactions dropped because a log failed to decode.
    pub malformed: usize,
    /// Transactions dropped for having too few transfers.
    pub too_short: usize,
    /// Logs without a transaction hash.
    pub orphan_logs: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub logs: usize,
    pub transactions: usize,
    pub candidates: usize,
    pub malformed: usize,
    pub arbitrages: usize,
    pub persisted: usize,
}

/// Steps 1 to 4: grouping, ordering, decoding and filtering.
pub fn assemble_candidates(
    logs: &[Log],
    events: &EventTable,
    min_transfers: usize,
) -> Result<AssembledBatch, PipelineError> {
    let mut batch = AssembledBatch::default();

    let mut groups: IndexMap<H256, Vec<&Log>> = IndexMap::new();
    for log in logs {
        match log.transaction_hash {
            Some(hash) => groups.entry(hash).or_default().push(log),
            None => batch.orphan_logs += 1,
        }
    }
    batch.transactions = groups.len();

    for (tx_hash, mut group) in groups {
        group.sort_by_key(|log| (log.block_number, log.log_index));
        let repeated = group.windows(2).any(|pair| {
            pair[0].log_index.is_some()
                && (pair[0].block_number, pair[0].log_index)
                    == (pair[1].block_number, pair[1].log_index)
        });
        if repeated {
            return Err(PipelineError::DuplicateTransaction(tx_hash));
        }

        let decoded: Result<Vec<TransferEvent>, _> =
            group.iter().map(|log| events.decode_transfer(log)).collect();
        let transfers = match decoded {
            Ok(transfers) => transfers,
            Err(e) => {
                log::debug!("Dropping transaction {:?}: {}", tx_hash, e);
                batch.malformed += 1;
                continue;
            }
        };

        if transfers.len() < min_transfers {
            batch.too_short += 1;
            continue;
        }
        batch.candidates.push(TransactionCandidate { tx_hash, transfers });
    }

    Ok(batch)
}

/// Steps 1 to 6 for one block window.
pub struct BatchPipeline {
    events: Arc<EventTable>,
    detector: Arc<dyn ArbitrageDetector>,
    sink: Arc<dyn ArbitrageSink>,
    min_transfers: usize,
}

impl BatchPipeline {
    pub fn new(
        events: Arc<EventTable>,
        detector: Arc<dyn ArbitrageDetector>,
        sink: Arc<dyn ArbitrageSink>,
        min_transfers: usize,
    ) -> Self {
        Self {
            events,
            detector,
            sink,
            min_transfers,
        }
    }

    /// Processes one window. Returning `Ok` means the window's results are
    /// durable and the caller may advance past it.
    pub async fn process(&self, logs: &[Log]) -> Result<BatchReport, PipelineError> {
        let batch = assemble_candidates(logs, &self.events, self.min_transfers)?;

        let mut arbitrages: Vec<Arbitrage> = Vec::new();
        for candidate in &batch.candidates {
            if let Some(arb) = self
                .detector
                .detect(candidate.tx_hash, &candidate.transfers)
                .await?
            {
                log::info!(
                    "Arbitrage in {:?} (block {}): {} of {:?}",
                    arb.tx_hash,
                    arb.block_number,
                    arb.profit_amount,
                    arb.profit_token
                );
                arbitrages.push(arb);
            }
        }

        let persisted = self.sink.persist(&arbitrages).await?;

        Ok(BatchReport {
            logs: logs.len(),
            transactions: batch.transactions,
            candidates: batch.candidates.len(),
            malformed: batch.malformed,
            arbitrages: arbitrages.len(),
            persisted,
        })
    }
}
