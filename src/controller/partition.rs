//! Per-partition work queues.
//!
//! Items are grouped by source host so ordering guarantees hold within a
//! source while different sources proceed independently.

use std::time::Duration;

/// Lower bound for a worker's deadline regardless of queue size.
pub const MIN_WORKER_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Upper bound for a worker's deadline regardless of queue size.
pub const MAX_WORKER_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
/// Time allowance per queued item when sizing a worker's deadline.
pub const PER_ITEM_ALLOWANCE: Duration = Duration::from_secs(210);

/// A URL claimed from the store, with its issued sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedItem {
    pub url: String,
    pub sequence: u64,
}

/// An ordered queue of claimed items for one partition. A single worker
/// drains it strictly front to back.
#[derive(Debug, Clone)]
pub struct PartitionQueue {
    pub name: String,
    pub items: Vec<ClaimedItem>,
}

impl PartitionQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Deadline for the worker draining this queue, scaled to its length
    /// and clamped so tiny queues still get a useful floor and huge ones
    /// cannot hold a worker slot indefinitely.
    pub fn worker_timeout(&self) -> Duration {
        let scaled = PER_ITEM_ALLOWANCE * self.items.len() as u32;
        scaled.clamp(MIN_WORKER_TIMEOUT, MAX_WORKER_TIMEOUT)
    }
}

/// Derive a partition name from a URL's host, falling back to a shared
/// bucket for unparseable input.
pub fn partition_of(url: &str) -> String {
    let trimmed = url.trim();
    let rest = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    if host.is_empty() {
        "unknown".to_string()
    } else {
        host.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_of(n: usize) -> PartitionQueue {
        let mut q = PartitionQueue::new("golf.example");
        for i in 0..n {
            q.items.push(ClaimedItem {
                url: format!("https://golf.example/{}", i),
                sequence: i as u64 + 1,
            });
        }
        q
    }

    #[test]
    fn test_timeout_floor_for_small_queues() {
        assert_eq!(queue_of(1).worker_timeout(), MIN_WORKER_TIMEOUT);
        assert_eq!(queue_of(4).worker_timeout(), MIN_WORKER_TIMEOUT);
    }

    #[test]
    fn test_timeout_scales_with_queue_length() {
        // 10 items at 3.5 minutes each.
        assert_eq!(queue_of(10).worker_timeout(), Duration::from_secs(2100));
    }

    #[test]
    fn test_timeout_ceiling_for_huge_queues() {
        assert_eq!(queue_of(500).worker_timeout(), MAX_WORKER_TIMEOUT);
    }

    #[test]
    fn test_partition_of_extracts_host() {
        assert_eq!(partition_of("https://Golf.example/news/a"), "golf.example");
        assert_eq!(partition_of("http://a.example"), "a.example");
        assert_eq!(partition_of("https://a.example?q=1"), "a.example");
    }

    #[test]
    fn test_partition_of_unparseable_falls_back() {
        assert_eq!(partition_of(""), "unknown");
        assert_eq!(partition_of("   "), "unknown");
    }
}
