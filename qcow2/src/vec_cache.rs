// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::HashMap;
use std::io;
use std::ops::{Index, IndexMut};
use std::slice::SliceIndex;

/// Trait that allows for checking if an implementor is dirty. Useful for types that are cached so
/// it can be checked if they need to be committed to disk.
pub trait Cacheable {
    /// Used to check if the item needs to be written out or if it can be discarded.
    fn dirty(&self) -> bool;
}

#[derive(Clone, Debug)]
/// Represents a vector that implements the `Cacheable` trait so it can be held in a cache.
pub struct VecCache<T: 'static + Copy + Default> {
    vec: Box<[T]>,
    dirty: bool,
}

impl<T: 'static + Copy + Default> VecCache<T> {
    /// Creates a `VecCache` that can hold `count` elements.
    pub fn new(count: usize) -> VecCache<T> {
        VecCache {
            vec: vec![Default::default(); count].into_boxed_slice(),
            dirty: true,
        }
    }

    /// Creates a `VecCache` from the passed in `vec`.
    pub fn from_vec(vec: Vec<T>) -> VecCache<T> {
        VecCache {
            vec: vec.into_boxed_slice(),
            dirty: false,
        }
    }

    pub fn get<I>(&self, index: I) -> Option<&<I as SliceIndex<[T]>>::Output>
    where
        I: SliceIndex<[T]>,
    {
        self.vec.get(index)
    }

    /// Gets a reference to the underlying vector.
    pub fn get_values(&self) -> &[T] {
        &self.vec
    }

    /// Mark this cache element as clean.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Returns the number of elements in the vector.
    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }
}

impl<T: 'static + Copy + Default> Cacheable for VecCache<T> {
    fn dirty(&self) -> bool {
        self.dirty
    }
}

impl<T: 'static + Copy + Default> Index<usize> for VecCache<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        self.vec.index(index)
    }
}

impl<T: 'static + Copy + Default> IndexMut<usize> for VecCache<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        self.dirty = true;
        self.vec.index_mut(index)
    }
}

const NIL: usize = usize::MAX;

#[derive(Clone, Debug)]
struct Node<T> {
    key: u64,
    value: T,
    prev: usize,
    next: usize,
}

/// A bounded map that evicts the least recently used entry once it reaches capacity.
///
/// Entries live in an arena indexed by the hash map, linked into a doubly-linked
/// recency list through arena indices. `get` promotes an entry to the front,
/// `insert` drops the entry at the back when full, handing dirty values to the
/// caller-provided write-back callback before they are discarded.
#[derive(Clone, Debug)]
pub struct CacheMap<T: Cacheable> {
    capacity: usize,
    map: HashMap<u64, usize>,
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<T: Cacheable> CacheMap<T> {
    pub fn new(capacity: usize) -> Self {
        CacheMap {
            capacity,
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.map.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn node(&self, index: usize) -> &Node<T> {
        // Arena slots referenced from the map or the list are always occupied.
        self.nodes[index].as_ref().unwrap()
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<T> {
        self.nodes[index].as_mut().unwrap()
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };
        if prev != NIL {
            self.node_mut(prev).next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.node_mut(next).prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, index: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(index);
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.node_mut(old_head).prev = index;
        } else {
            self.tail = index;
        }
        self.head = index;
    }

    fn promote(&mut self, index: usize) {
        if self.head != index {
            self.unlink(index);
            self.push_front(index);
        }
    }

    fn allocate_node(&mut self, node: Node<T>) -> usize {
        if let Some(slot) = self.free.pop() {
            self.nodes[slot] = Some(node);
            slot
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    /// Gets the value for `key`, promoting the entry to most recently used.
    pub fn get(&mut self, key: u64) -> Option<&T> {
        let index = *self.map.get(&key)?;
        self.promote(index);
        Some(&self.node(index).value)
    }

    /// Gets a mutable reference to the value for `key`, promoting the entry.
    pub fn get_mut(&mut self, key: u64) -> Option<&mut T> {
        let index = *self.map.get(&key)?;
        self.promote(index);
        Some(&mut self.node_mut(index).value)
    }

    /// Inserts `value` at the most recently used position. When the map is at
    /// capacity the least recently used entry is evicted first; if that entry
    /// is dirty, `write_callback` is invoked with it before it is dropped.
    pub fn insert<F>(&mut self, key: u64, value: T, write_callback: F) -> io::Result<()>
    where
        F: FnOnce(u64, T) -> io::Result<()>,
    {
        if let Some(&index) = self.map.get(&key) {
            self.promote(index);
            self.node_mut(index).value = value;
            return Ok(());
        }
        if self.map.len() == self.capacity {
            let lru = self.tail;
            self.unlink(lru);
            let node = self.nodes[lru].take().unwrap();
            self.free.push(lru);
            self.map.remove(&node.key);
            if node.value.dirty() {
                write_callback(node.key, node.value)?;
            }
        }
        let index = self.allocate_node(Node {
            key,
            value,
            prev: NIL,
            next: NIL,
        });
        self.push_front(index);
        self.map.insert(key, index);
        Ok(())
    }

    /// Replaces or inserts `value` without evicting any entry.
    pub fn set(&mut self, key: u64, value: T) {
        if let Some(&index) = self.map.get(&key) {
            self.promote(index);
            self.node_mut(index).value = value;
            return;
        }
        let index = self.allocate_node(Node {
            key,
            value,
            prev: NIL,
            next: NIL,
        });
        self.push_front(index);
        self.map.insert(key, index);
    }

    /// Removes the entry for `key`, returning its value.
    pub fn remove(&mut self, key: u64) -> Option<T> {
        let index = self.map.remove(&key)?;
        self.unlink(index);
        let node = self.nodes[index].take().unwrap();
        self.free.push(index);
        Some(node.value)
    }

    /// Iterates over all `(key, value)` pairs without touching recency order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut T)> {
        self.nodes
            .iter_mut()
            .filter_map(|slot| slot.as_mut().map(|node| (node.key, &mut node.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NumCache(bool);
    impl Cacheable for NumCache {
        fn dirty(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn evicts_lru_when_full() {
        let mut cache = CacheMap::<NumCache>::new(3);
        let mut evicted = None;
        for key in 0..3 {
            cache
                .insert(key, NumCache(true), |index, _| {
                    evicted = Some(index);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(evicted, None);

        // Touch key 0 so key 1 becomes the least recently used.
        assert!(cache.get(0).is_some());
        cache
            .insert(3, NumCache(true), |index, _| {
                evicted = Some(index);
                Ok(())
            })
            .unwrap();
        assert_eq!(evicted, Some(1));
        assert!(cache.contains_key(0));
        assert!(cache.contains_key(2));
        assert!(cache.contains_key(3));
    }

    #[test]
    fn clean_entries_evict_silently() {
        let mut cache = CacheMap::<NumCache>::new(1);
        let mut evicted = None;
        cache.insert(7, NumCache(false), |_, _| Ok(())).unwrap();
        cache
            .insert(8, NumCache(false), |index, _| {
                evicted = Some(index);
                Ok(())
            })
            .unwrap();
        assert_eq!(evicted, None);
        assert!(!cache.contains_key(7));
    }

    #[test]
    fn set_does_not_evict() {
        let mut cache = CacheMap::<NumCache>::new(1);
        cache.insert(1, NumCache(false), |_, _| Ok(())).unwrap();
        cache.set(2, NumCache(false));
        assert!(cache.contains_key(1));
        assert!(cache.contains_key(2));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn remove_then_reuse_slot() {
        let mut cache = CacheMap::<NumCache>::new(2);
        cache.insert(1, NumCache(false), |_, _| Ok(())).unwrap();
        cache.insert(2, NumCache(false), |_, _| Ok(())).unwrap();
        assert!(cache.remove(1).is_some());
        assert!(cache.remove(1).is_none());
        cache.insert(3, NumCache(false), |_, _| Ok(())).unwrap();
        assert!(cache.contains_key(2));
        assert!(cache.contains_key(3));
    }
}
