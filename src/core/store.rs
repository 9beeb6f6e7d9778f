//! Ordered LRU store: constant-time keyed access with constant-time
//! recency updates (spec §4.2).
//!
//! The intrusive doubly linked list is conceptually cyclic but owned by a
//! single structure, so it is implemented as an arena of nodes indexed by
//! small integer handles, with the hashmap storing handles rather than raw
//! pointers (spec §9 "Cyclic references"). Pin counts are `Arc<AtomicI64>`
//! shared with the outstanding `CacheBorrow`, so releasing a borrow does not
//! need the store lock unless the count drops to zero while a deferred
//! eviction is pending (spec §9 "Pins vs. borrowed references").

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::warn;

use crate::buffer::FrameBuffer;
use crate::key::FrameKey;

struct Node {
    key: FrameKey,
    buffer: FrameBuffer,
    byte_size: usize,
    last_access_tick: u64,
    access_count: u64,
    pinned: Arc<AtomicI64>,
    deferred_evict: bool,
    inserted_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A pinned reference to a resident entry, returned by `get`/`insert_and_pin`.
pub struct PinnedEntry {
    pub buffer: FrameBuffer,
    pub byte_size: usize,
    pub pin: Arc<AtomicI64>,
}

struct Inner {
    map: HashMap<FrameKey, usize>,
    arena: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>, // most-recently-used
    tail: Option<usize>, // least-recently-used
    tick: u64,
    max_entries: usize,
}

impl Inner {
    fn unlink(&mut self, handle: usize) {
        let (prev, next) = {
            let node = self.arena[handle].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.arena[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.arena[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
        let node = self.arena[handle].as_mut().unwrap();
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, handle: usize) {
        let old_head = self.head;
        {
            let node = self.arena[handle].as_mut().unwrap();
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.arena[h].as_mut().unwrap().prev = Some(handle);
        }
        self.head = Some(handle);
        if self.tail.is_none() {
            self.tail = Some(handle);
        }
    }

    fn touch(&mut self, handle: usize) {
        if self.head == Some(handle) {
            return;
        }
        self.unlink(handle);
        self.push_front(handle);
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(h) = self.free.pop() {
            self.arena[h] = Some(node);
            h
        } else {
            self.arena.push(Some(node));
            self.arena.len() - 1
        }
    }

    fn remove_node(&mut self, handle: usize) -> Node {
        self.unlink(handle);
        let node = self.arena[handle].take().expect("handle must be occupied");
        self.map.remove(&node.key);
        self.free.push(handle);
        node
    }
}

/// Keyed store coupling a hashmap with an intrusive LRU list, guarded by a
/// single mutex (spec §5: critical sections are strictly O(1) except the
/// pathological pinned-eviction walk).
pub struct LruStore {
    inner: Mutex<Inner>,
}

impl LruStore {
    pub fn new(max_entries: usize) -> Self {
        LruStore {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                arena: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
                tick: 0,
                max_entries,
            }),
        }
    }

    /// Look up `key`, splice it to the head (most-recently-used), bump its
    /// access counters, and pin it. Returns `None` on a miss.
    pub fn get(&self, key: FrameKey) -> Option<PinnedEntry> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let handle = *inner.map.get(&key)?;
        inner.tick += 1;
        let tick = inner.tick;
        inner.touch(handle);
        let node = inner.arena[handle].as_mut().unwrap();
        node.last_access_tick = tick;
        node.access_count += 1;
        node.pinned.fetch_add(1, Ordering::SeqCst);
        Some(PinnedEntry {
            buffer: node.buffer.clone(),
            byte_size: node.byte_size,
            pin: Arc::clone(&node.pinned),
        })
    }

    pub fn contains(&self, key: FrameKey) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).map.contains_key(&key)
    }

    /// True if `key` is resident and currently queued/in-flight per the
    /// scheduler's own bookkeeping is a question for the scheduler; this
    /// only reports store residency.
    pub fn is_resident(&self, key: FrameKey) -> bool {
        self.contains(key)
    }

    /// Insert `buffer` for `key` at the head, pinned once on behalf of the
    /// caller. If `key` already exists, refreshes recency and, per the edge
    /// policy in spec §4.2, replaces the buffer only if the new one is at
    /// least as large (otherwise keeps the existing buffer - defensive,
    /// should never trigger in normal use). Returns the byte size delta to
    /// apply to the governor's resident-bytes counter (may be negative if a
    /// strictly-smaller replacement was rejected and the old size differs -
    /// in practice zero unless callers violate the "size never shrinks on
    /// replace" contract).
    pub fn insert_and_pin(&self, key: FrameKey, buffer: FrameBuffer) -> (PinnedEntry, i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(&handle) = inner.map.get(&key) {
            inner.touch(handle);
            let node = inner.arena[handle].as_mut().unwrap();
            let delta = if buffer.byte_size >= node.byte_size {
                let delta = buffer.byte_size as i64 - node.byte_size as i64;
                node.buffer = buffer;
                node.byte_size = node.buffer.byte_size;
                delta
            } else {
                0
            };
            node.last_access_tick = tick;
            node.access_count += 1;
            node.pinned.fetch_add(1, Ordering::SeqCst);
            return (
                PinnedEntry { buffer: node.buffer.clone(), byte_size: node.byte_size, pin: Arc::clone(&node.pinned) },
                delta,
            );
        }

        let byte_size = buffer.byte_size;
        let pin = Arc::new(AtomicI64::new(1));
        let node = Node {
            key,
            buffer: buffer.clone(),
            byte_size,
            last_access_tick: tick,
            access_count: 1,
            pinned: Arc::clone(&pin),
            deferred_evict: false,
            inserted_at: Instant::now(),
            prev: None,
            next: None,
        };
        let handle = inner.alloc(node);
        inner.map.insert(key, handle);
        inner.push_front(handle);

        (PinnedEntry { buffer, byte_size, pin }, byte_size as i64)
    }

    /// Evict the least-recently-used unpinned entry. Walks from the tail
    /// toward the head; O(1) in the common case, worst-case O(n) only when
    /// nearly all entries are pinned (pathological, logged).
    pub fn evict_lru_skipping_pinned(&self) -> Option<(FrameKey, FrameBuffer, usize)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut cursor = inner.tail;
        let mut hops = 0usize;
        while let Some(handle) = cursor {
            let (pinned, next_cursor) = {
                let node = inner.arena[handle].as_ref().unwrap();
                (node.pinned.load(Ordering::SeqCst) > 0, node.prev)
            };
            if !pinned {
                let node = inner.remove_node(handle);
                return Some((node.key, node.buffer, node.byte_size));
            }
            cursor = next_cursor;
            hops += 1;
        }
        if hops > 0 {
            warn!("evict_lru_skipping_pinned: walked {} pinned entries without finding a victim", hops);
        }
        None
    }

    /// Remove an entry if unpinned; if pinned, mark it for deferred eviction
    /// once its last borrow is released.
    pub fn invalidate(&self, key: FrameKey) -> Option<(FrameBuffer, usize)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let handle = *inner.map.get(&key)?;
        let pinned = inner.arena[handle].as_ref().unwrap().pinned.load(Ordering::SeqCst) > 0;
        if pinned {
            inner.arena[handle].as_mut().unwrap().deferred_evict = true;
            None
        } else {
            let node = inner.remove_node(handle);
            Some((node.buffer, node.byte_size))
        }
    }

    /// Remove every unpinned entry; mark pinned entries for deferred
    /// eviction. Returns the freed buffers so the caller can account for
    /// their bytes.
    pub fn clear(&self) -> Vec<(FrameBuffer, usize)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let handles: Vec<usize> = inner.map.values().copied().collect();
        let mut freed = Vec::new();
        for handle in handles {
            let pinned = inner.arena[handle].as_ref().unwrap().pinned.load(Ordering::SeqCst) > 0;
            if pinned {
                inner.arena[handle].as_mut().unwrap().deferred_evict = true;
            } else {
                let node = inner.remove_node(handle);
                freed.push((node.buffer, node.byte_size));
            }
        }
        freed
    }

    /// Called when a borrow's pin count transitions to zero. If the entry
    /// was marked for deferred eviction, removes it now and returns the
    /// freed bytes.
    pub fn finalize_release(&self, key: FrameKey) -> Option<(FrameBuffer, usize)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let handle = *inner.map.get(&key)?;
        let (pinned, deferred) = {
            let node = inner.arena[handle].as_ref().unwrap();
            (node.pinned.load(Ordering::SeqCst), node.deferred_evict)
        };
        if pinned <= 0 && deferred {
            let node = inner.remove_node(handle);
            Some((node.buffer, node.byte_size))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn over_entry_cap(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.len() > inner.max_entries
    }

    /// Diagnostic-only: keys from most-recently-used to least-recently-used.
    pub fn iter_from_lru(&self) -> Vec<FrameKey> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::with_capacity(inner.map.len());
        let mut cursor = inner.head;
        while let Some(handle) = cursor {
            let node = inner.arena[handle].as_ref().unwrap();
            out.push(node.key);
            cursor = node.next;
        }
        out
    }
}

/// Decrement a borrow's pin count, finalizing a deferred eviction if this
/// was the last pin. Returns the freed buffer, if any, so the caller can
/// update byte accounting (spec I6: buffers released exactly once).
pub fn release_pin(store: &LruStore, key: FrameKey, pin: &Arc<AtomicI64>) -> Option<(FrameBuffer, usize)> {
    let remaining = pin.fetch_sub(1, Ordering::SeqCst) - 1;
    debug_assert!(remaining >= 0, "pin count underflow: double release of {key}");
    if remaining == 0 {
        store.finalize_release(key)
    } else {
        None
    }
}
