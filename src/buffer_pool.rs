//! GPU buffer pool: acquire/release with bucketed sizes, and the
//! three-owner lifecycle described in the Design Notes — a buffer is either
//! held free by the pool, owned by a live tensor, or tracked by an active
//! [`crate::recorder::CommandRecorder`] pending release after submission.
//!
//! Grounded on the teacher's `Hub`/`BufferEntry` (`blade-graphics`'
//! `webgpu/mod.rs`, `webgpu/resource.rs::create_buffer`): a `SlotMap`-keyed
//! central store behind an `RwLock`, generational keys standing in for the
//! raw `wgpu::Buffer` so handles stay `Copy` and use-after-free is caught by
//! the slot map's generation check rather than relying on a `WeakMap`.

use std::sync::RwLock;

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Generational key for a pooled buffer. Cannot be confused with keys
    /// from unrelated slot maps.
    pub struct BufferKey;
}

/// Owner state of a pooled buffer at a given instant. Exactly one of these
/// applies; transitions are the only way a buffer changes hands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Owner {
    /// On the pool's free list, available for `acquire`.
    Free,
    /// Held by exactly one live tensor.
    Live,
    /// Tracked by the command recorder identified by this generation id,
    /// pending release once that recorder's submission completes.
    TrackedByRecorder(u64),
}

struct Entry {
    raw: wgpu::Buffer,
    bucket_size: u64,
    owner: Owner,
}

/// Handle to a pooled buffer. `Copy`, cheap to pass around; the actual
/// `wgpu::Buffer` lives in the pool and is reached via `raw`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct PoolBuffer {
    raw: BufferKey,
    pub size: u64,
}

impl PoolBuffer {
    /// A handle that does not resolve to any real buffer. Only meaningful
    /// as a placeholder in tests that never touch the pool.
    pub fn dangling() -> Self {
        Self {
            raw: BufferKey::default(),
            size: 0,
        }
    }
}

/// Rounds a requested byte size up to a pool bucket, so that decode-hot-path
/// allocations of slightly different sizes can still reuse a free buffer.
fn bucket_size(requested: u64) -> u64 {
    const MIN_BUCKET: u64 = 256;
    if requested <= MIN_BUCKET {
        return MIN_BUCKET;
    }
    requested.next_power_of_two()
}

/// Process-wide (per model-instance, see Design Notes) GPU buffer pool.
pub struct BufferPool {
    device: wgpu::Device,
    entries: RwLock<SlotMap<BufferKey, Entry>>,
    /// Free buffers grouped by bucket size for O(1)-ish acquire.
    free_by_bucket: RwLock<std::collections::HashMap<u64, Vec<BufferKey>>>,
}

impl BufferPool {
    pub fn new(device: wgpu::Device) -> Self {
        Self {
            device,
            entries: RwLock::new(SlotMap::with_key()),
            free_by_bucket: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Acquire a buffer of at least `size_bytes`, reusing a free buffer from
    /// the matching bucket when available.
    pub fn acquire(&self, size_bytes: u64, usage: wgpu::BufferUsages, label: &str) -> PoolBuffer {
        let bucket = bucket_size(size_bytes);

        if let Some(key) = {
            let mut free = self.free_by_bucket.write().unwrap();
            free.get_mut(&bucket).and_then(Vec::pop)
        } {
            let mut entries = self.entries.write().unwrap();
            let entry = entries.get_mut(key).expect("pool: free list referenced a missing entry");
            debug_assert_eq!(entry.owner, Owner::Free);
            entry.owner = Owner::Live;
            return PoolBuffer {
                raw: key,
                size: size_bytes,
            };
        }

        let raw = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bucket,
            usage,
            mapped_at_creation: false,
        });
        let mut entries = self.entries.write().unwrap();
        let key = entries.insert(Entry {
            raw,
            bucket_size: bucket,
            owner: Owner::Live,
        });
        log::debug!(
            "buffer pool: allocated new buffer '{label}' (requested {size_bytes}B, bucket {bucket}B)"
        );
        PoolBuffer {
            raw: key,
            size: size_bytes,
        }
    }

    /// Release a buffer directly back to the pool's free list. Fatal if the
    /// buffer is currently tracked by an unsubmitted recorder — per the
    /// invariant in spec §3, releasing such a buffer is a programming error,
    /// not a recoverable condition.
    pub fn release(&self, buffer: PoolBuffer) {
        let bucket = {
            let mut entries = self.entries.write().unwrap();
            let entry = entries
                .get_mut(buffer.raw)
                .expect("pool: release of unknown buffer handle");
            match entry.owner {
                Owner::TrackedByRecorder(_) => panic!(
                    "fatal: released buffer tracked by an unsubmitted command recorder"
                ),
                Owner::Free => panic!("fatal: double release of pool buffer"),
                Owner::Live => {}
            }
            entry.owner = Owner::Free;
            entry.bucket_size
        };
        self.free_by_bucket
            .write()
            .unwrap()
            .entry(bucket)
            .or_default()
            .push(buffer.raw);
    }

    /// Mark a live buffer as tracked by command recorder `recorder_id`,
    /// deferring its release until [`BufferPool::release_tracked`] is
    /// called after that recorder's submission completes.
    pub(crate) fn track(&self, buffer: PoolBuffer, recorder_id: u64) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .get_mut(buffer.raw)
            .expect("pool: track of unknown buffer handle");
        debug_assert_eq!(
            entry.owner,
            Owner::Live,
            "only a live buffer may be handed to a recorder"
        );
        entry.owner = Owner::TrackedByRecorder(recorder_id);
    }

    /// Release every buffer tracked by `recorder_id`, returning them to the
    /// free list. Called exactly once, after that recorder's submission has
    /// completed (or, on a mid-plan exception, from the cleanup pass).
    pub(crate) fn release_tracked(&self, tracked: &[PoolBuffer]) {
        for &buffer in tracked {
            let bucket = {
                let mut entries = self.entries.write().unwrap();
                let entry = entries
                    .get_mut(buffer.raw)
                    .expect("pool: release_tracked of unknown buffer handle");
                debug_assert!(matches!(entry.owner, Owner::TrackedByRecorder(_)));
                entry.owner = Owner::Free;
                entry.bucket_size
            };
            self.free_by_bucket
                .write()
                .unwrap()
                .entry(bucket)
                .or_default()
                .push(buffer.raw);
        }
    }

    pub fn raw(&self, buffer: PoolBuffer) -> wgpu::Buffer {
        let entries = self.entries.read().unwrap();
        entries
            .get(buffer.raw)
            .expect("pool: raw() of unknown buffer handle")
            .raw
            .clone()
    }

    /// Read back the first `byte_count` bytes of `buffer`. Only valid when
    /// no command recorder currently tracks `buffer` (callers must hold a
    /// readback guard — see [`crate::device::Device::allow_readback`]).
    pub fn read(&self, buffer: PoolBuffer, byte_count: u64) -> Vec<u8> {
        let raw = self.raw(buffer);
        let slice = raw.slice(0..byte_count);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::PollType::Wait).ok();
        rx.recv()
            .expect("pool: buffer map channel closed")
            .expect("pool: buffer map failed");
        let data = slice.get_mapped_range().to_vec();
        raw.unmap();
        data
    }

    /// Number of buffers currently held live or tracked (diagnostic only).
    pub fn live_count(&self) -> usize {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| e.owner != Owner::Free)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_size_rounds_up_and_floors() {
        assert_eq!(bucket_size(1), 256);
        assert_eq!(bucket_size(256), 256);
        assert_eq!(bucket_size(257), 512);
        assert_eq!(bucket_size(4096), 4096);
        assert_eq!(bucket_size(4097), 8192);
    }
}
