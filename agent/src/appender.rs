use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use common::common::labels::Labels;
use common::error::{Error, Result};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// One scraped payload handed to the processing stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeSample {
    pub job_name: String,
    pub labels: Labels,
    pub body: Vec<u8>,
    pub scrape_time: SystemTime,
}

/// Handle to the inter-stage process queues, keyed per pipeline.
///
/// Implementations must be safe to push into from many scrape loops at once
/// and must refuse items rather than buffer without bound.
pub trait Appendable: Send + Sync {
    fn create_or_update_queue(&self, key: &str, capacity: usize);

    fn push(&self, key: &str, sample: ScrapeSample) -> Result<()>;
}

struct BoundedQueue {
    capacity: usize,
    items: VecDeque<ScrapeSample>,
}

/// In-memory bounded queues.
pub struct ProcessQueueManager {
    default_capacity: usize,
    queues: Mutex<HashMap<String, BoundedQueue>>,
}

impl Default for ProcessQueueManager {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl ProcessQueueManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            default_capacity: default_capacity.max(1),
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn pop(&self, key: &str) -> Option<ScrapeSample> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.get_mut(key).and_then(|q| q.items.pop_front())
    }

    pub fn drain(&self, key: &str) -> Vec<ScrapeSample> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .get_mut(key)
            .map(|q| q.items.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, key: &str) -> usize {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.get(key).map_or(0, |q| q.items.len())
    }

    pub fn keys(&self) -> Vec<String> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.keys().cloned().collect()
    }
}

impl Appendable for ProcessQueueManager {
    /// A capacity of zero selects the manager's default capacity.
    fn create_or_update_queue(&self, key: &str, capacity: usize) {
        let capacity = if capacity == 0 {
            self.default_capacity
        } else {
            capacity
        };
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(key.to_string())
            .and_modify(|q| q.capacity = capacity)
            .or_insert_with(|| BoundedQueue {
                capacity,
                items: VecDeque::new(),
            });
    }

    fn push(&self, key: &str, sample: ScrapeSample) -> Result<()> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues
            .get_mut(key)
            .ok_or_else(|| Error::QueueNotFound(key.to_string()))?;
        if queue.items.len() >= queue.capacity {
            return Err(Error::QueueFull(key.to_string()));
        }
        queue.items.push_back(sample);
        Ok(())
    }
}
