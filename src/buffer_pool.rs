//! Reusable inflation buffers, pooled per pack.
//!
//! Delta reconstruction needs scratch sized to the largest intermediate
//! payload along a chain. Pools are keyed by pack digest so concurrent
//! readers of the same pack share a bounded set of buffers instead of
//! allocating per read.
//!
//! # Design
//! - Each pool holds up to `per_pool_buffers` retained buffers in a
//!   lock-free queue; handles return them on drop.
//! - Demand beyond the retained cap is served by transient buffers that
//!   are offered back to the queue on drop and freed if it is full.
//! - The "unrecorded" path (a pack not yet registered, e.g. mid-ingest)
//!   uses a single shared grow-on-demand buffer behind a mutex.
//!
//! # Invariants
//! - A buffer's capacity never shrinks while pooled.
//! - At most `per_pool_buffers` buffers are retained per pack.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use crossbeam_queue::ArrayQueue;

use crate::object_id::ObjectId;

/// Default retained buffers per pack.
pub const DEFAULT_POOL_BUFFERS: usize = 4;

/// Pools of reusable buffers keyed by pack digest.
#[derive(Debug)]
pub struct BufferPools {
    pools: Mutex<AHashMap<ObjectId, Arc<PackPool>>>,
    unrecorded: Arc<Mutex<Option<Vec<u8>>>>,
    per_pool_buffers: usize,
}

impl BufferPools {
    /// Creates the pool set with a per-pack retained-buffer cap.
    #[must_use]
    pub fn new(per_pool_buffers: usize) -> Self {
        Self {
            pools: Mutex::new(AHashMap::new()),
            unrecorded: Arc::new(Mutex::new(None)),
            per_pool_buffers: per_pool_buffers.max(1),
        }
    }

    /// Acquires a buffer for a known pack with capacity at least `len`.
    pub fn acquire(&self, pack: &ObjectId, len: usize) -> PoolBuffer {
        let pool = {
            let mut pools = self.pools.lock().expect("buffer pool poisoned");
            Arc::clone(
                pools
                    .entry(*pack)
                    .or_insert_with(|| Arc::new(PackPool::new(self.per_pool_buffers))),
            )
        };
        pool.acquire(len)
    }

    /// Acquires the shared buffer for work on a not-yet-registered pack.
    ///
    /// Exclusivity comes from taking the buffer out of its slot; a second
    /// caller while it is out gets a transient buffer that is not
    /// retained.
    pub fn acquire_unrecorded(&self, len: usize) -> PoolBuffer {
        let taken = self
            .unrecorded
            .lock()
            .expect("unrecorded buffer poisoned")
            .take();
        let mut buf = taken.unwrap_or_default();
        if buf.capacity() < len {
            buf.reserve(len - buf.len());
        }
        PoolBuffer {
            buf,
            home: Home::Unrecorded(Arc::clone(&self.unrecorded)),
        }
    }

    /// Drops every retained buffer.
    pub fn clear(&self) {
        self.pools.lock().expect("buffer pool poisoned").clear();
        *self.unrecorded.lock().expect("unrecorded buffer poisoned") = None;
    }

    /// Number of buffers a pack's pool has ever allocated.
    ///
    /// Test instrumentation for the provisioning bound.
    #[must_use]
    pub fn provisioned(&self, pack: &ObjectId) -> usize {
        self.pools
            .lock()
            .expect("buffer pool poisoned")
            .get(pack)
            .map_or(0, |pool| pool.created.load(Ordering::Relaxed))
    }
}

/// A bounded pool for one pack.
#[derive(Debug)]
struct PackPool {
    queue: ArrayQueue<Vec<u8>>,
    created: AtomicUsize,
    cap: usize,
}

impl PackPool {
    fn new(cap: usize) -> Self {
        Self {
            queue: ArrayQueue::new(cap),
            created: AtomicUsize::new(0),
            cap,
        }
    }

    fn acquire(self: Arc<Self>, len: usize) -> PoolBuffer {
        let mut buf = match self.queue.pop() {
            Some(buf) => buf,
            None => {
                // Count allocations while retained slots remain; beyond
                // the cap the buffer is transient and uncounted.
                let created = self.created.load(Ordering::Relaxed);
                if created < self.cap {
                    self.created.store(created + 1, Ordering::Relaxed);
                }
                Vec::new()
            }
        };
        if buf.capacity() < len {
            buf.reserve(len - buf.len());
        }
        PoolBuffer {
            buf,
            home: Home::Pool(self),
        }
    }
}

#[derive(Debug)]
enum Home {
    Pool(Arc<PackPool>),
    Unrecorded(Arc<Mutex<Option<Vec<u8>>>>),
}

/// RAII handle over a pooled buffer.
///
/// Dereferences to the underlying `Vec<u8>`; dropping returns the buffer
/// to its pool (or frees it when the pool is full).
#[derive(Debug)]
pub struct PoolBuffer {
    buf: Vec<u8>,
    home: Home,
}

impl Deref for PoolBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        match &self.home {
            Home::Pool(pool) => {
                // Push may fail when the queue is full; the buffer was
                // transient and is freed here.
                let _ = pool.queue.push(buf);
            }
            Home::Unrecorded(slot) => {
                let mut slot = slot.lock().expect("unrecorded buffer poisoned");
                if slot.is_none() {
                    *slot = Some(buf);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_id(byte: u8) -> ObjectId {
        ObjectId::sha1([byte; 20])
    }

    #[test]
    fn buffers_are_reused() {
        let pools = BufferPools::new(2);
        let pack = pack_id(0x01);

        {
            let mut buf = pools.acquire(&pack, 1024);
            buf.extend_from_slice(&[1, 2, 3]);
        }
        let buf = pools.acquire(&pack, 16);
        assert!(buf.capacity() >= 1024, "capacity must not shrink");
        assert_eq!(pools.provisioned(&pack), 1);
    }

    #[test]
    fn provisioning_is_bounded_by_cap() {
        let pools = BufferPools::new(2);
        let pack = pack_id(0x02);

        let a = pools.acquire(&pack, 64);
        let b = pools.acquire(&pack, 64);
        let c = pools.acquire(&pack, 64); // transient, beyond the cap
        assert_eq!(pools.provisioned(&pack), 2);
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pools.provisioned(&pack), 2);
    }

    #[test]
    fn pools_are_per_pack() {
        let pools = BufferPools::new(1);
        let _a = pools.acquire(&pack_id(0x0a), 32);
        let _b = pools.acquire(&pack_id(0x0b), 32);
        assert_eq!(pools.provisioned(&pack_id(0x0a)), 1);
        assert_eq!(pools.provisioned(&pack_id(0x0b)), 1);
    }

    #[test]
    fn unrecorded_buffer_grows_and_returns() {
        let pools = BufferPools::new(4);
        {
            let buf = pools.acquire_unrecorded(2048);
            assert!(buf.capacity() >= 2048);
        }
        let buf = pools.acquire_unrecorded(8);
        assert!(buf.capacity() >= 2048, "shared buffer never shrinks");
    }

    #[test]
    fn unrecorded_concurrent_takers_get_distinct_buffers() {
        let pools = BufferPools::new(4);
        let first = pools.acquire_unrecorded(64);
        let second = pools.acquire_unrecorded(64);
        drop(first);
        drop(second);
        let third = pools.acquire_unrecorded(8);
        assert!(third.capacity() >= 64);
    }

    #[test]
    fn clear_drops_retained_buffers() {
        let pools = BufferPools::new(2);
        let pack = pack_id(0x03);
        drop(pools.acquire(&pack, 4096));
        pools.clear();
        assert_eq!(pools.provisioned(&pack), 0);
    }

    #[test]
    fn concurrent_acquire_release() {
        let pools = Arc::new(BufferPools::new(2));
        let pack = pack_id(0x04);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pools = Arc::clone(&pools);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pools.acquire(&pack, 512);
                        buf.clear();
                        buf.extend_from_slice(&[0u8; 128]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // Retained allocations never exceed the cap.
        assert!(pools.provisioned(&pack) <= 2);
    }
}
