//! `DecodeBuffers`: the two pre-allocated ping/pong hidden-state buffers
//! named in spec §3 "Decode Buffer Manager", reused across every decode
//! step's per-layer hot path instead of pool-acquiring a fresh buffer per
//! layer the way prefill does.
//!
//! Grounded on `kv_cache.rs`'s raw `wgpu::CommandEncoder::copy_buffer_to_buffer`
//! style for moving data between fixed GPU addresses without going through a
//! `KernelSet` op; no teacher/pack analog allocates a stable hot-path buffer
//! pair like this (graphics backends don't have a decode loop).

use crate::buffer_pool::{BufferPool, PoolBuffer};
use crate::device::Device;
use crate::recorder::Dispatcher;
use crate::tensor::{DType, Shape, Tensor};

/// Two pre-allocated `[1, hidden_size]` buffers, alternated as "current" and
/// "next" across decode-loop layers. Acquired once per [`crate::generator::Generator`]
/// and held for its lifetime — `owns_buffer` lets callers recognize them so
/// they're never handed to [`BufferPool::release`] (spec §3: "owned buffers
/// are never released").
pub struct DecodeBuffers {
    ping: PoolBuffer,
    pong: PoolBuffer,
    ping_is_current: bool,
    dtype: DType,
    hidden_size: u32,
}

impl DecodeBuffers {
    pub fn new(pool: &BufferPool, hidden_size: u32, dtype: DType) -> Self {
        let bytes = hidden_size as u64 * dtype.byte_size() as u64;
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
        Self {
            ping: pool.acquire(bytes, usage, "decode.ping"),
            pong: pool.acquire(bytes, usage, "decode.pong"),
            ping_is_current: true,
            dtype,
            hidden_size,
        }
    }

    fn shape(&self) -> Shape {
        Shape::new(&[1, self.hidden_size])
    }

    /// The buffer presently holding this step's live hidden state.
    pub fn current(&self) -> Tensor {
        let buffer = if self.ping_is_current { self.ping } else { self.pong };
        Tensor::new(buffer, self.dtype, self.shape(), "decode.current")
    }

    /// The other buffer, free to be overwritten as the next layer's output.
    pub fn other(&self) -> Tensor {
        let buffer = if self.ping_is_current { self.pong } else { self.ping };
        Tensor::new(buffer, self.dtype, self.shape(), "decode.other")
    }

    pub fn swap(&mut self) {
        self.ping_is_current = !self.ping_is_current;
    }

    /// True for either owned buffer — these must never reach
    /// [`BufferPool::release`]; they live for the generator's lifetime.
    pub fn owns_buffer(&self, buffer: PoolBuffer) -> bool {
        buffer == self.ping || buffer == self.pong
    }

    /// Copies `src` into the other slot, swaps, and returns the new
    /// `current()` — the per-layer ping-pong step spec §4.3's decode step
    /// names ("call into layer executor with ping-pong buffer swap").
    /// `src`'s own buffer is left untouched; callers still own releasing it.
    pub fn advance(&mut self, device: &dyn Device, dispatcher: &mut Dispatcher<'_>, src: &Tensor) -> Tensor {
        self.copy_into_other(device, dispatcher, src);
        self.swap();
        self.current()
    }

    /// Copies `src`'s contents into [`DecodeBuffers::other`]'s backing
    /// buffer, appending to `dispatcher`'s recorder when recording or
    /// issuing a standalone encoder otherwise. Does not swap — callers call
    /// [`DecodeBuffers::swap`] once the copy is known to have landed.
    pub fn copy_into_other(&self, device: &dyn Device, dispatcher: &mut Dispatcher<'_>, src: &Tensor) {
        let dst = self.other();
        let pool = device.buffer_pool();
        let copy_bytes = src.byte_size();
        match dispatcher {
            Dispatcher::Immediate => {
                let mut encoder = device
                    .wgpu_device()
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("decode_buffers.copy_into_other"),
                    });
                encoder.copy_buffer_to_buffer(&pool.raw(src.buffer), 0, &pool.raw(dst.buffer), 0, copy_bytes);
                device.wgpu_queue().submit(std::iter::once(encoder.finish()));
            }
            Dispatcher::Recording(recorder) => {
                recorder
                    .encoder_mut()
                    .copy_buffer_to_buffer(&pool.raw(src.buffer), 0, &pool.raw(dst.buffer), 0, copy_bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_and_other_start_distinct() {
        let buffers = DecodeBuffers {
            ping: PoolBuffer::dangling(),
            pong: PoolBuffer { size: 1, ..PoolBuffer::dangling() },
            ping_is_current: true,
            dtype: DType::F32,
            hidden_size: 4,
        };
        assert_ne!(buffers.current().buffer, buffers.other().buffer);
    }

    #[test]
    fn swap_flips_current() {
        let mut buffers = DecodeBuffers {
            ping: PoolBuffer::dangling(),
            pong: PoolBuffer { size: 1, ..PoolBuffer::dangling() },
            ping_is_current: true,
            dtype: DType::F32,
            hidden_size: 4,
        };
        let before = buffers.current().buffer;
        buffers.swap();
        assert_ne!(buffers.current().buffer, before);
    }
}
