use std::num::{NonZeroU32, NonZeroUsize};
use std::time;

use thiserror::Error;

use crate::store::MAX_BATCH_WRITE_ITEMS;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BudgetError {
    #[error("batch size must be between 1 and {MAX_BATCH_WRITE_ITEMS}, got {0}")]
    InvalidBatchSize(usize),
    #[error("the write budget must allow at least one write per second")]
    ZeroWrites,
    #[error("a budget of {writes_per_second} writes/s with batches of {batch_size} leaves no time between dispatches")]
    IntervalTooShort {
        batch_size: usize,
        writes_per_second: u32,
    },
}

/// A configured ceiling on writes per second, expressed as one dispatch of `batch_size` writes
/// every `dispatch_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBudget {
    batch_size: NonZeroUsize,
    writes_per_second: NonZeroU32,
}

impl WriteBudget {
    pub fn new(batch_size: usize, writes_per_second: u32) -> Result<Self, BudgetError> {
        let batch_size = NonZeroUsize::new(batch_size)
            .filter(|size| size.get() <= MAX_BATCH_WRITE_ITEMS)
            .ok_or(BudgetError::InvalidBatchSize(batch_size))?;
        let writes_per_second = NonZeroU32::new(writes_per_second).ok_or(BudgetError::ZeroWrites)?;

        let budget = Self {
            batch_size,
            writes_per_second,
        };

        if budget.dispatch_interval().is_zero() {
            return Err(BudgetError::IntervalTooShort {
                batch_size: batch_size.get(),
                writes_per_second: writes_per_second.get(),
            });
        }

        Ok(budget)
    }

    pub fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }

    pub fn writes_per_second(&self) -> u32 {
        self.writes_per_second.get()
    }

    /// Minimum time between two dispatches: `batch_size / writes_per_second` seconds.
    pub fn dispatch_interval(&self) -> time::Duration {
        let nanos =
            self.batch_size.get() as u128 * 1_000_000_000 / self.writes_per_second.get() as u128;
        time::Duration::from_nanos(nanos as u64)
    }

    /// Default bound on concurrently in-flight dispatches: two seconds worth of batches.
    pub fn default_max_in_flight(&self) -> usize {
        let per_second = (self.writes_per_second.get() as usize).div_ceil(self.batch_size.get());
        std::cmp::max(per_second * 2, 1)
    }
}
