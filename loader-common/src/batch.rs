use std::num::NonZeroUsize;
use std::ops::RangeInclusive;

use tracing::warn;

use crate::mapping::Record;

/// An ordered, non-empty group of records submitted to the store in a single call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Position of this batch in the input, starting at 1.
    sequence: u64,
    /// Number of records emitted in earlier batches.
    offset: u64,
    records: Vec<Record>,
}

impl Batch {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The 1-based ordinals, among all accepted input records, covered by this batch.
    pub fn record_range(&self) -> RangeInclusive<u64> {
        (self.offset + 1)..=(self.offset + self.records.len() as u64)
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

/// Groups records into `Batch`es of at most `max_size`, preserving input order.
#[derive(Debug)]
pub struct BatchAccumulator {
    max_size: NonZeroUsize,
    buffer: Vec<Record>,
    emitted_batches: u64,
    emitted_records: u64,
}

impl BatchAccumulator {
    pub fn new(max_size: NonZeroUsize) -> Self {
        Self {
            max_size,
            buffer: Vec::with_capacity(max_size.get()),
            emitted_batches: 0,
            emitted_records: 0,
        }
    }

    /// Append a record, returning a completed batch when the buffer reaches `max_size`.
    pub fn push(&mut self, record: Record) -> Option<Batch> {
        self.buffer.push(record);

        if self.buffer.len() == self.max_size.get() {
            self.flush()
        } else {
            None
        }
    }

    /// Emit whatever is buffered, if anything. Called once the input is exhausted.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            return None;
        }

        let records = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.max_size.get()));
        let batch = Batch {
            sequence: self.emitted_batches + 1,
            offset: self.emitted_records,
            records,
        };

        self.emitted_batches += 1;
        self.emitted_records += batch.len() as u64;

        Some(batch)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn emitted_batches(&self) -> u64 {
        self.emitted_batches
    }
}

/// Terminal state of a dispatched batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Succeeded,
    PartiallyFailed,
    FullyFailed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Succeeded => "succeeded",
            BatchStatus::PartiallyFailed => "partially_failed",
            BatchStatus::FullyFailed => "fully_failed",
        }
    }
}

/// The result of submitting one `Batch`: the batch itself plus which of its records the store
/// rejected. Rejections are kept as positions into the batch, so they are always a subset of it.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    batch: Batch,
    rejected: Vec<usize>,
}

impl BatchOutcome {
    pub fn succeeded(batch: Batch) -> Self {
        Self {
            batch,
            rejected: Vec::new(),
        }
    }

    /// The whole call failed: no partial credit is given.
    pub fn failed(batch: Batch) -> Self {
        let rejected = (0..batch.len()).collect();
        Self { batch, rejected }
    }

    /// The store accepted the call but left `unprocessed` records behind. Each unprocessed record
    /// is matched to at most one record of the batch.
    pub fn with_unprocessed(batch: Batch, unprocessed: Vec<Record>) -> Self {
        let mut remaining = unprocessed;
        let rejected: Vec<usize> = batch
            .records()
            .iter()
            .enumerate()
            .filter_map(|(position, record)| {
                let found = remaining.iter().position(|r| r == record)?;
                remaining.swap_remove(found);
                Some(position)
            })
            .collect();

        if !remaining.is_empty() {
            warn!(
                batch = batch.sequence(),
                unmatched = remaining.len(),
                "store reported unprocessed items that are not part of the batch"
            );
        }

        Self { batch, rejected }
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Every record that reached a dispatch attempt.
    pub fn attempted(&self) -> &[Record] {
        self.batch.records()
    }

    pub fn rejected(&self) -> impl Iterator<Item = &Record> {
        self.rejected.iter().map(|&i| &self.batch.records[i])
    }

    pub fn accepted(&self) -> impl Iterator<Item = &Record> {
        self.batch
            .records()
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.rejected.contains(i))
            .map(|(_, record)| record)
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    pub fn status(&self) -> BatchStatus {
        if self.rejected.is_empty() {
            BatchStatus::Succeeded
        } else if self.rejected.len() == self.batch.len() {
            BatchStatus::FullyFailed
        } else {
            BatchStatus::PartiallyFailed
        }
    }
}
