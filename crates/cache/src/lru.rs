//! Doubly-linked recency list with O(1) promotion and removal
//!
//! Nodes live in a slab (`Vec`) and link to each other by index; a companion
//! map from key to slab slot gives constant-time lookup. The front of the list
//! is the most recently used key, the back is the least recently used one.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
struct Node<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Recency-ordered set of keys
#[derive(Debug)]
pub struct RecencyList<K> {
    nodes: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Copy + Eq + Hash> RecencyList<K> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Mark `key` as most recently used, inserting it if absent.
    ///
    /// Returns true if the key was newly inserted.
    pub fn touch(&mut self, key: K) -> bool {
        if let Some(&slot) = self.index.get(&key) {
            self.unlink(slot);
            self.link_front(slot);
            false
        } else {
            let slot = self.alloc(key);
            self.index.insert(key, slot);
            self.link_front(slot);
            true
        }
    }

    /// Remove `key` from the list. Returns false if it was not present.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.index.remove(key) {
            Some(slot) => {
                self.unlink(slot);
                self.nodes[slot] = None;
                self.free.push(slot);
                true
            }
            None => false,
        }
    }

    /// Most recently used key
    pub fn front(&self) -> Option<K> {
        self.head.and_then(|slot| self.key_at(slot))
    }

    /// Least recently used key
    pub fn back(&self) -> Option<K> {
        self.tail.and_then(|slot| self.key_at(slot))
    }

    /// Remove and return the least recently used key
    pub fn pop_back(&mut self) -> Option<K> {
        let key = self.back()?;
        self.remove(&key);
        Some(key)
    }

    /// Iterate from most to least recently used
    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            list: self,
            cursor: self.head,
            forward: true,
        }
    }

    /// Iterate from least to most recently used
    pub fn iter_lru(&self) -> Iter<'_, K> {
        Iter {
            list: self,
            cursor: self.tail,
            forward: false,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    fn key_at(&self, slot: usize) -> Option<K> {
        self.nodes[slot].as_ref().map(|node| node.key)
    }

    fn alloc(&mut self, key: K) -> usize {
        let node = Node {
            key,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn link_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.nodes[slot].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(head) => {
                if let Some(node) = self.nodes[head].as_mut() {
                    node.prev = Some(slot);
                }
            }
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.nodes[slot].as_mut() {
            Some(node) => (node.prev.take(), node.next.take()),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.nodes[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }
}

impl<K: Copy + Eq + Hash> Default for RecencyList<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowing iterator over a [`RecencyList`]
pub struct Iter<'a, K> {
    list: &'a RecencyList<K>,
    cursor: Option<usize>,
    forward: bool,
}

impl<'a, K: Copy> Iterator for Iter<'a, K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        let slot = self.cursor?;
        let node = self.list.nodes[slot].as_ref()?;
        self.cursor = if self.forward { node.next } else { node.prev };
        Some(node.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_touch_orders_most_recent_first() {
        let mut list = RecencyList::new();
        list.touch(1);
        list.touch(2);
        list.touch(3);

        assert_eq!(list.iter().collect::<Vec<_>>(), vec![3, 2, 1]);
        assert_eq!(list.iter_lru().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(list.front(), Some(3));
        assert_eq!(list.back(), Some(1));
    }

    #[test]
    fn test_touch_existing_moves_to_front() {
        let mut list = RecencyList::new();
        assert!(list.touch(1));
        assert!(list.touch(2));
        assert!(list.touch(3));
        assert!(!list.touch(1));

        assert_eq!(list.iter().collect::<Vec<_>>(), vec![1, 3, 2]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_remove_middle_and_ends() {
        let mut list = RecencyList::new();
        for k in 1..=5 {
            list.touch(k);
        }

        assert!(list.remove(&3));
        assert!(list.remove(&5));
        assert!(list.remove(&1));
        assert!(!list.remove(&1));

        assert_eq!(list.iter().collect::<Vec<_>>(), vec![4, 2]);
        assert_eq!(list.back(), Some(2));
    }

    #[test]
    fn test_slots_are_reused() {
        let mut list = RecencyList::new();
        list.touch(1);
        list.touch(2);
        list.remove(&1);
        list.touch(3);

        assert_eq!(list.nodes.len(), 2);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![3, 2]);
    }

    #[test]
    fn test_pop_back_drains_in_lru_order() {
        let mut list = RecencyList::new();
        list.touch('a');
        list.touch('b');
        list.touch('a');

        assert_eq!(list.pop_back(), Some('b'));
        assert_eq!(list.pop_back(), Some('a'));
        assert_eq!(list.pop_back(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_matches_naive_model_under_random_ops() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut list = RecencyList::new();
        let mut model: Vec<u32> = Vec::new();

        for _ in 0..2_000 {
            let key = rng.gen_range(0..32u32);
            if rng.gen_bool(0.75) {
                list.touch(key);
                model.retain(|&k| k != key);
                model.insert(0, key);
            } else {
                let removed = list.remove(&key);
                let had = model.contains(&key);
                model.retain(|&k| k != key);
                assert_eq!(removed, had);
            }

            assert_eq!(list.len(), model.len());
        }

        assert_eq!(list.iter().collect::<Vec<_>>(), model);
        let mut reversed = model.clone();
        reversed.reverse();
        assert_eq!(list.iter_lru().collect::<Vec<_>>(), reversed);
    }
}
