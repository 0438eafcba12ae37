use std::collections::{BTreeMap, VecDeque};

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::document::document::Document;

/// Documents waiting for their destination client to (re)connect.
///
/// Documents are kept in FIFO order per destination. The total number of documents across all
///  destinations is bounded, and when the bound is reached, the document that was admitted
///  first is evicted, regardless of its destination. So a single flooded destination pushes out
///  older documents for all other destinations as well.
pub struct OfflineQueue {
    max_len: usize,
    next_seq: u64,
    per_client: FxHashMap<String, VecDeque<(u64, Document)>>,
    /// admission sequence number -> destination, i.e. the global FIFO order
    admission_order: BTreeMap<u64, String>,
}

impl OfflineQueue {
    pub fn new(max_len: usize) -> OfflineQueue {
        OfflineQueue {
            max_len,
            next_seq: 0,
            per_client: Default::default(),
            admission_order: Default::default(),
        }
    }

    /// total number of queued documents
    pub fn len(&self) -> usize {
        self.admission_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admission_order.is_empty()
    }

    pub fn len_for(&self, client_id: &str) -> usize {
        self.per_client.get(client_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Adds a document for a destination, returning the documents that were evicted to make room
    ///  for it. With a maximum size of 0, the document itself is returned.
    pub fn enqueue(&mut self, client_id: &str, doc: Document) -> Vec<Document> {
        if self.max_len == 0 {
            return vec![doc];
        }

        let mut evicted = Vec::new();
        while self.len() >= self.max_len {
            match self.evict_oldest() {
                Some(doc) => evicted.push(doc),
                None => break,
            }
        }
        if !evicted.is_empty() {
            debug!("evicted {} queued document(s)", evicted.len());
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.per_client.entry(client_id.to_string())
            .or_insert_with(|| {
                debug!("queue added: {}", client_id);
                VecDeque::new()
            })
            .push_back((seq, doc));
        self.admission_order.insert(seq, client_id.to_string());
        trace!("{} document(s) queued for {}, {} in total", self.len_for(client_id), client_id, self.len());

        evicted
    }

    /// removes and returns the oldest document for a destination
    pub fn dequeue(&mut self, client_id: &str) -> Option<Document> {
        let queue = self.per_client.get_mut(client_id)?;
        let (seq, doc) = queue.pop_front()?;
        let now_empty = queue.is_empty();

        self.admission_order.remove(&seq);
        if now_empty {
            self.remove_queue(client_id);
        }
        Some(doc)
    }

    /// removes and returns all documents for a destination, oldest first
    pub fn drain(&mut self, client_id: &str) -> Vec<Document> {
        let mut result = Vec::with_capacity(self.len_for(client_id));
        while let Some(doc) = self.dequeue(client_id) {
            result.push(doc);
        }
        result
    }

    fn evict_oldest(&mut self) -> Option<Document> {
        let (seq, client_id) = self.admission_order.pop_first()?;
        let queue = self.per_client.get_mut(&client_id)?;

        // the oldest document overall is also the oldest for its destination
        let (front_seq, doc) = queue.pop_front()?;
        debug_assert_eq!(front_seq, seq);

        if queue.is_empty() {
            self.remove_queue(&client_id);
        }
        Some(doc)
    }

    fn remove_queue(&mut self, client_id: &str) {
        if self.per_client.remove(client_id).is_some() {
            debug!("queue removed: {}", client_id);
        }
    }
}
