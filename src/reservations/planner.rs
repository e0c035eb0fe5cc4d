//! Partition planning for `bootstrap`.

use super::BlockRange;
use crate::error::ReservationError;
use rand::seq::SliceRandom;

/// Splits `[from_block, to_block_exclusive)` into `chunk_size` pieces; the
/// last one is truncated at the range end.
pub fn chunk_range(from_block: u64, to_block_exclusive: u64, chunk_size: u64) -> Vec<BlockRange> {
    let mut chunks = Vec::new();
    if chunk_size == 0 {
        return chunks;
    }
    let mut start = from_block;
    while start < to_block_exclusive {
        let end = start.saturating_add(chunk_size).min(to_block_exclusive);
        chunks.push(BlockRange::new(start, end));
        start = end;
    }
    chunks
}

/// Chunks needed so the partition covers `[start_block, end_block_inclusive]`.
///
/// `existing` is the `(min from_block, max to_block_exclusive)` span of the
/// current partition. Only the gaps in front of and behind it are planned;
/// a request that is already covered yields nothing.
pub fn plan_bootstrap(
    existing: Option<BlockRange>,
    start_block: u64,
    end_block_inclusive: u64,
    chunk_size: u64,
) -> Result<Vec<BlockRange>, ReservationError> {
    if chunk_size == 0 {
        return Err(ReservationError::InvalidRange(
            "chunk size must be positive".to_string(),
        ));
    }
    if start_block > end_block_inclusive {
        return Err(ReservationError::InvalidRange(format!(
            "start block {} is after end block {}",
            start_block, end_block_inclusive
        )));
    }
    let end_exclusive = end_block_inclusive.checked_add(1).ok_or_else(|| {
        ReservationError::InvalidRange("end block overflows".to_string())
    })?;

    let existing = match existing {
        None => return Ok(chunk_range(start_block, end_exclusive, chunk_size)),
        Some(existing) => existing,
    };

    let mut planned = Vec::new();
    if start_block < existing.from_block {
        planned.extend(chunk_range(start_block, existing.from_block, chunk_size));
    }
    if end_exclusive > existing.to_block_exclusive {
        planned.extend(chunk_range(
            existing.to_block_exclusive,
            end_exclusive,
            chunk_size,
        ));
    }
    Ok(planned)
}

/// Chunks in random order, so hot and cold ranges spread across workers.
pub fn shuffled(mut chunks: Vec<BlockRange>) -> Vec<BlockRange> {
    chunks.shuffle(&mut rand::thread_rng());
    chunks
}
