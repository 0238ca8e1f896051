use std::collections::{HashSet, VecDeque};

/// How many leading bytes go into a chunk fingerprint.
const FINGERPRINT_PREFIX: usize = 16;

/// Drops inbound chunks that were already forwarded recently.
///
/// A chunk is identified by its length plus a hex prefix of its bytes. The
/// cache is bounded; once full the oldest fingerprint is evicted, so a
/// duplicate arriving after `capacity` newer chunks passes again.
#[derive(Debug)]
pub struct ChunkDeduplicator {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl ChunkDeduplicator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    pub fn fingerprint(bytes: &[u8]) -> String {
        let prefix = &bytes[..bytes.len().min(FINGERPRINT_PREFIX)];
        format!("{}:{}", bytes.len(), hex::encode(prefix))
    }

    /// Returns `true` if the chunk is new and should be forwarded.
    pub fn should_forward(&mut self, bytes: &[u8]) -> bool {
        let fp = Self::fingerprint(bytes);
        if self.seen.contains(&fp) {
            tracing::debug!("dropping duplicate chunk {}", fp);
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(fp.clone());
        self.order.push_back(fp);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

impl Default for ChunkDeduplicator {
    fn default() -> Self {
        Self::new(100)
    }
}
