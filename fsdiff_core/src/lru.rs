//! Fixed-capacity recency map used to suppress redundant state triage.

use crate::HashMap;
use std::hash::Hash;

pub type EvictCallback<K, V> = Box<dyn FnMut(K, V) + Send>;

struct Node<K, V> {
    key: K,
    val: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU cache with O(1) `add`/`get`. Eviction is least-recent first; the
/// optional callback receives the evicted entry.
pub struct Lru<K, V> {
    max_size: usize,
    map: HashMap<K, usize>,
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    on_evict: Option<EvictCallback<K, V>>,
}

impl<K: Hash + Eq + Clone, V> Lru<K, V> {
    pub fn new(max_size: usize) -> Self {
        Self::with_evict_opt(max_size, None)
    }

    pub fn with_evict(max_size: usize, on_evict: EvictCallback<K, V>) -> Self {
        Self::with_evict_opt(max_size, Some(on_evict))
    }

    fn with_evict_opt(max_size: usize, on_evict: Option<EvictCallback<K, V>>) -> Self {
        assert!(max_size > 0, "lru requires a positive maximum size");
        Self {
            max_size,
            map: HashMap::default(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            on_evict,
        }
    }

    /// Inserts or refreshes `key`, evicting the least-recently-used entry
    /// when over capacity.
    pub fn add(&mut self, key: K, val: V) {
        if let Some(&idx) = self.map.get(&key) {
            self.nodes[idx].as_mut().unwrap().val = val;
            self.move_to_front(idx);
            return;
        }

        let idx = self.alloc_node(key.clone(), val);
        self.map.insert(key, idx);
        self.push_front(idx);

        if self.map.len() > self.max_size {
            self.remove_oldest();
        }
    }

    /// Returns the value and promotes the entry to most-recent.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.move_to_front(idx);
        Some(&self.nodes[idx].as_ref().unwrap().val)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Keys from oldest to newest.
    pub fn keys(&self) -> Vec<K> {
        let mut out = Vec::with_capacity(self.map.len());
        let mut cur = self.tail;
        while let Some(idx) = cur {
            let node = self.nodes[idx].as_ref().unwrap();
            out.push(node.key.clone());
            cur = node.prev;
        }
        out
    }

    fn alloc_node(&mut self, key: K, val: V) -> usize {
        let node = Node {
            key,
            val,
            prev: None,
            next: None,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.nodes[idx].as_mut().unwrap();
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.nodes[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn remove_oldest(&mut self) {
        let idx = match self.tail {
            Some(idx) => idx,
            None => return,
        };
        self.unlink(idx);
        let node = self.nodes[idx].take().unwrap();
        self.free.push(idx);
        self.map.remove(&node.key);
        if let Some(cb) = self.on_evict.as_mut() {
            cb(node.key, node.val);
        }
    }
}
