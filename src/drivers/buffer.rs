use std::collections::VecDeque;

use crate::drivers::{ConfigError, DerivedSample};

/// Default number of derived samples kept for charting and submission.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Fixed-capacity FIFO of derived samples, most recent last.
#[derive(Clone, Debug)]
pub struct HistoryBuffer {
    samples: VecDeque<DerivedSample>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn with_capacity(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        Ok(Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    /// Appends, evicting the oldest sample when full.
    pub fn append(&mut self, sample: DerivedSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&DerivedSample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DerivedSample> {
        self.samples.iter()
    }

    /// Copy of the buffered samples, oldest first.
    pub fn snapshot(&self) -> Vec<DerivedSample> {
        self.samples.iter().copied().collect()
    }

    /// The last `count` samples, oldest first.
    pub fn recent(&self, count: usize) -> Vec<DerivedSample> {
        let skip = self.samples.len().saturating_sub(count);
        self.samples.iter().skip(skip).copied().collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
