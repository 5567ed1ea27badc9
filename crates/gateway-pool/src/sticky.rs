//! Sticky session → account assignment table.
//!
//! Unbounded by contract, but capped here at a generous size so a gateway
//! fielding many distinct client sessions over a long run doesn't grow
//! without limit. Eviction only ever drops the least-recently-touched
//! mapping — never one with a request in flight, since eviction just
//! forgets the assignment and the next request for that key falls back
//! to `pick`.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;

/// Entries beyond this count evict the least-recently-touched mapping.
const DEFAULT_CAPACITY: usize = 10_000;

pub struct StickyTable {
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    assignments: HashMap<String, String>,
    /// Recency order, oldest first. A key may appear once; touching moves
    /// it to the back.
    order: VecDeque<String>,
}

impl StickyTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                assignments: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Current account for a session key, touching its recency.
    pub async fn get(&self, session_key: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        let account = inner.assignments.get(session_key).cloned();
        if account.is_some() {
            touch(&mut inner.order, session_key);
        }
        account
    }

    /// Assign a session key to an account, evicting the oldest entry if
    /// the table is at capacity and this is a new key.
    pub async fn assign(&self, session_key: &str, account_name: &str) {
        let mut inner = self.inner.lock().await;
        let is_new = !inner.assignments.contains_key(session_key);

        if is_new && inner.assignments.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.assignments.remove(&oldest);
            }
        }

        inner
            .assignments
            .insert(session_key.to_string(), account_name.to_string());
        touch(&mut inner.order, session_key);
    }

    pub async fn clear(&self, session_key: &str) {
        let mut inner = self.inner.lock().await;
        inner.assignments.remove(session_key);
        inner.order.retain(|k| k != session_key);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.assignments.len()
    }
}

impl Default for StickyTable {
    fn default() -> Self {
        Self::new()
    }
}

fn touch(order: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        order.remove(pos);
    }
    order.push_back(key.to_string());
}
