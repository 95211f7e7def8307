//! Per-layer KV cache: GPU-resident key/value stores that outlive a single
//! generation call and can be cloned into a [`Snapshot`] to seed a
//! continuation (spec §3, §4.3 "KV-prefix reuse").
//!
//! Grounded on `m96-chan-0xBitNet`'s `KvCache`/`create_kv_cache`
//! (`nn/attention.rs`: raw `wgpu::Buffer` key/value pair plus `seq_len`/
//! `max_seq_len`) for the GPU-buffer-backed shape, generalized to one pair
//! per layer and a sliding-window variant; the per-layer `update`/`get_k`/
//! `get_v`/`reset` interface follows `mrcloudchase-inference-runtime`'s
//! `KvCache` (`llama/mod.rs`).

use crate::buffer_pool::{BufferPool, PoolBuffer};
use crate::recorder::CommandRecorder;
use crate::tensor::DType;

/// One layer's key and value stores, each shaped
/// `[max_seq_len, num_kv_heads, head_dim]`.
struct LayerCache {
    key: PoolBuffer,
    value: PoolBuffer,
}

/// Parameters fixing a `KvCache`'s shape for its lifetime.
#[derive(Clone, Copy, Debug)]
pub struct KvCacheConfig {
    pub num_layers: u32,
    pub num_kv_heads: u32,
    pub head_dim: u32,
    pub max_seq_len: u32,
    pub dtype: DType,
    /// `Some(window)` bounds retained positions to the most recent `window`
    /// entries per layer (spec §3's sliding-window variant). Layers whose
    /// `AttentionKind` is `Full` ignore this even when set, since the
    /// window is a property applied by the layer executor, not the cache.
    pub sliding_window: Option<u32>,
}

impl KvCacheConfig {
    fn row_bytes(&self) -> u64 {
        (self.num_kv_heads * self.head_dim) as u64 * self.dtype.byte_size() as u64
    }
}

/// Per-layer ordered stores of keys and values. Exclusive to the active
/// generation (spec §5's concurrency invariant); cloning produces an
/// independent [`Snapshot`].
pub struct KvCache {
    config: KvCacheConfig,
    layers: Vec<LayerCache>,
    /// Positions advance together across all layers — a single counter, not
    /// per-layer, per the spec's "all layers advance together" invariant.
    current_seq_len: u32,
}

impl KvCache {
    pub fn new(pool: &BufferPool, config: KvCacheConfig) -> Self {
        let bytes_per_layer = config.row_bytes() * config.max_seq_len as u64;
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;
        let layers = (0..config.num_layers)
            .map(|i| LayerCache {
                key: pool.acquire(bytes_per_layer, usage, "kv_cache.key"),
                value: pool.acquire(bytes_per_layer, usage, "kv_cache.value"),
            })
            .collect();
        log::info!(
            "kv cache allocated: {} layers, max_seq_len={}, {}B/layer",
            config.num_layers,
            config.max_seq_len,
            bytes_per_layer * 2,
        );
        Self {
            config,
            layers,
            current_seq_len: 0,
        }
    }

    pub fn current_seq_len(&self) -> u32 {
        self.current_seq_len
    }

    pub fn max_seq_len(&self) -> u32 {
        self.config.max_seq_len
    }

    pub fn key_buffer(&self, layer: usize) -> PoolBuffer {
        self.layers[layer].key
    }

    pub fn value_buffer(&self, layer: usize) -> PoolBuffer {
        self.layers[layer].value
    }

    /// Effective number of positions visible to attention for `layer`,
    /// honoring that layer's sliding-window bound when configured.
    pub fn visible_len(&self, layer_is_sliding: bool) -> u32 {
        match (layer_is_sliding, self.config.sliding_window) {
            (true, Some(window)) => self.current_seq_len.min(window),
            _ => self.current_seq_len,
        }
    }

    /// Appends `n_tokens` worth of new keys/values (already written by the
    /// `rope`/`split_qkv` ops into scratch buffers) starting at
    /// `start_pos`, and advances `current_seq_len`. Immediate path: the
    /// caller has no open recorder, so the write is a direct buffer copy
    /// executed and waited on before returning.
    ///
    /// Enforces `current_seq_len <= max_seq_len` (spec §3 invariant);
    /// exceeding it is a logic error in the caller (layer executor / decode
    /// loop), not a recoverable condition, so this asserts rather than
    /// returning a `Result`.
    pub fn update_from_gpu(
        &mut self,
        device: &dyn crate::device::Device,
        layer: usize,
        k: &crate::tensor::Tensor,
        v: &crate::tensor::Tensor,
        start_pos: u32,
        n_tokens: u32,
    ) {
        assert!(
            start_pos + n_tokens <= self.config.max_seq_len,
            "kv cache overflow: start_pos {start_pos} + n_tokens {n_tokens} > max_seq_len {}",
            self.config.max_seq_len
        );
        let row_bytes = self.config.row_bytes();
        let dst_offset = start_pos as u64 * row_bytes;
        let copy_bytes = n_tokens as u64 * row_bytes;

        let mut encoder = device
            .wgpu_device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kv_cache.update_from_gpu"),
            });
        let layer_cache = &self.layers[layer];
        let pool = device.buffer_pool();
        encoder.copy_buffer_to_buffer(
            &pool.raw(k.buffer),
            0,
            &pool.raw(layer_cache.key),
            dst_offset,
            copy_bytes,
        );
        encoder.copy_buffer_to_buffer(
            &pool.raw(v.buffer),
            0,
            &pool.raw(layer_cache.value),
            dst_offset,
            copy_bytes,
        );
        device.wgpu_queue().submit(std::iter::once(encoder.finish()));

        if layer == self.layers.len() - 1 {
            self.current_seq_len = start_pos + n_tokens;
        }
    }

    /// Batched variant of [`KvCache::update_from_gpu`]: appends the copy to
    /// `recorder`'s open encoder instead of submitting immediately. Used by
    /// prefill and batched decode, which drive every layer against one
    /// recorder before a single submit (spec §4.3).
    pub fn record_update_from_gpu(
        &mut self,
        recorder: &mut CommandRecorder,
        pool: &BufferPool,
        layer: usize,
        k: &crate::tensor::Tensor,
        v: &crate::tensor::Tensor,
        start_pos: u32,
        n_tokens: u32,
    ) {
        assert!(
            start_pos + n_tokens <= self.config.max_seq_len,
            "kv cache overflow: start_pos {start_pos} + n_tokens {n_tokens} > max_seq_len {}",
            self.config.max_seq_len
        );
        let row_bytes = self.config.row_bytes();
        let dst_offset = start_pos as u64 * row_bytes;
        let copy_bytes = n_tokens as u64 * row_bytes;
        let layer_cache = &self.layers[layer];

        let encoder = recorder.encoder_mut();
        encoder.copy_buffer_to_buffer(
            &pool.raw(k.buffer),
            0,
            &pool.raw(layer_cache.key),
            dst_offset,
            copy_bytes,
        );
        encoder.copy_buffer_to_buffer(
            &pool.raw(v.buffer),
            0,
            &pool.raw(layer_cache.value),
            dst_offset,
            copy_bytes,
        );

        if layer == self.layers.len() - 1 {
            self.current_seq_len = start_pos + n_tokens;
        }
    }

    /// Resets the cache to empty, for reuse across independent generations
    /// on the same pipeline instance.
    pub fn reset(&mut self) {
        self.current_seq_len = 0;
    }

    /// Clones this cache's current contents into an immutable [`Snapshot`],
    /// for `prefill_kv_only`. Fails only if the underlying buffer copy
    /// cannot be issued (surfaced as `SnapshotUnavailable` by the caller).
    pub fn snapshot(&self, device: &dyn crate::device::Device) -> Snapshot {
        let pool = device.buffer_pool();
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;
        let bytes_per_layer = self.config.row_bytes() * self.config.max_seq_len as u64;

        let mut encoder = device
            .wgpu_device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kv_cache.snapshot"),
            });
        let layers = self
            .layers
            .iter()
            .map(|layer| {
                let key = pool.acquire(bytes_per_layer, usage, "kv_cache.snapshot.key");
                let value = pool.acquire(bytes_per_layer, usage, "kv_cache.snapshot.value");
                encoder.copy_buffer_to_buffer(
                    &pool.raw(layer.key),
                    0,
                    &pool.raw(key),
                    0,
                    bytes_per_layer,
                );
                encoder.copy_buffer_to_buffer(
                    &pool.raw(layer.value),
                    0,
                    &pool.raw(value),
                    0,
                    bytes_per_layer,
                );
                LayerCache { key, value }
            })
            .collect();
        device.wgpu_queue().submit(std::iter::once(encoder.finish()));

        Snapshot {
            config: self.config,
            layers,
            seq_len: self.current_seq_len,
        }
    }

    /// Overwrites this cache's contents with `snapshot`'s, setting
    /// `current_seq_len` to the snapshot's, per `generate_with_prefix_kv`
    /// (spec §4.3).
    pub fn restore_from_snapshot(&mut self, device: &dyn crate::device::Device, snapshot: &Snapshot) {
        assert_eq!(
            self.layers.len(),
            snapshot.layers.len(),
            "snapshot layer count does not match cache"
        );
        let pool = device.buffer_pool();
        let bytes_per_layer = self.config.row_bytes() * self.config.max_seq_len as u64;
        let mut encoder = device
            .wgpu_device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kv_cache.restore_from_snapshot"),
            });
        for (dst, src) in self.layers.iter().zip(snapshot.layers.iter()) {
            encoder.copy_buffer_to_buffer(&pool.raw(src.key), 0, &pool.raw(dst.key), 0, bytes_per_layer);
            encoder.copy_buffer_to_buffer(
                &pool.raw(src.value),
                0,
                &pool.raw(dst.value),
                0,
                bytes_per_layer,
            );
        }
        device.wgpu_queue().submit(std::iter::once(encoder.finish()));
        self.current_seq_len = snapshot.seq_len;
    }
}

/// An immutable clone of a [`KvCache`]'s contents at a point in time.
/// Cloneable; must not outlive the model (spec §6).
pub struct Snapshot {
    config: KvCacheConfig,
    layers: Vec<LayerCache>,
    seq_len: u32,
}

impl Snapshot {
    pub fn seq_len(&self) -> u32 {
        self.seq_len
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        // Shares backing buffers across clones; handles are Copy, storage is not duplicated.
        Snapshot {
            config: self.config,
            layers: self
                .layers
                .iter()
                .map(|l| LayerCache {
                    key: l.key,
                    value: l.value,
                })
                .collect(),
            seq_len: self.seq_len,
        }
    }
}
