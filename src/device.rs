//! The `Device` collaborator: owns the `wgpu` instance/adapter/device/queue
//! and answers capability queries. Grounded on the teacher's
//! `webgpu/platform.rs::create_context` (native pollster vs wasm async
//! request_adapter/request_device) and `webgpu/mod.rs`'s `Context` struct,
//! narrowed to what a compute-only inference core needs (no surface, no
//! render pipelines).

use std::sync::atomic::{AtomicBool, Ordering};

/// Capabilities that influence which kernel variants `LayerExecutor` selects
/// (see spec §4.2 "Design Notes" on fused vs. separate kernel paths).
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceCapabilities {
    pub has_f16: bool,
    pub has_subgroups: bool,
    pub max_bind_groups: u32,
}

/// Collaborator exposing the `wgpu` device/queue and the buffer pool built
/// on top of them. A real runtime has exactly one; tests construct fakes
/// that never touch a physical GPU.
pub trait Device: Send + Sync {
    fn wgpu_device(&self) -> &wgpu::Device;
    fn wgpu_queue(&self) -> &wgpu::Queue;
    fn capabilities(&self) -> DeviceCapabilities;
    fn buffer_pool(&self) -> &crate::buffer_pool::BufferPool;

    /// Guards a synchronous buffer readback, per the Design Notes: the two
    /// fast-path probes (recorded-logits peek, fused-sample peek) are only
    /// legal to attempt when no recorder is mid-flight. Returns `true` if
    /// the calling code may proceed with a blocking map/read, `false` if a
    /// recorder is currently live and the caller must fall back instead of
    /// reading back.
    fn allow_readback(&self, reason: &'static str) -> bool;

    /// Called by [`crate::recorder::CommandRecorder`] on open/close so
    /// `allow_readback` can see whether a recording is in flight.
    fn set_recorder_live(&self, live: bool);
}

/// Concrete `wgpu`-backed [`Device`].
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: DeviceCapabilities,
    pool: crate::buffer_pool::BufferPool,
    /// Set by [`crate::recorder::CommandRecorder`] while a batched recording
    /// is open, cleared on submit. `allow_readback` consults this so a
    /// caller can't read back a buffer the recorder is still writing to.
    recorder_live: AtomicBool,
}

#[derive(Debug)]
pub struct DeviceInitError(pub String);

impl std::fmt::Display for DeviceInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DeviceInitError {}

impl WgpuDevice {
    /// Native-only synchronous construction, blocking on adapter/device
    /// request via `pollster` — mirrors the teacher's
    /// `#[cfg(not(target_arch = "wasm32"))] create_context`.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn new_native() -> Result<Self, DeviceInitError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| DeviceInitError(format!("adapter request failed: {e}")))?;

        let adapter_features = adapter.features();
        let mut required_features = wgpu::Features::empty();
        if adapter_features.contains(wgpu::Features::SHADER_F16) {
            required_features |= wgpu::Features::SHADER_F16;
        }
        if adapter_features.contains(wgpu::Features::SUBGROUP) {
            required_features |= wgpu::Features::SUBGROUP;
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("wgpu-infer-core device"),
            required_features,
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| DeviceInitError(format!("device request failed: {e}")))?;

        device.set_device_lost_callback(|reason, message| {
            log::error!("wgpu device lost: {reason:?} - {message}");
        });

        let limits = device.limits();
        let capabilities = DeviceCapabilities {
            has_f16: required_features.contains(wgpu::Features::SHADER_F16),
            has_subgroups: required_features.contains(wgpu::Features::SUBGROUP),
            max_bind_groups: limits.max_bind_groups,
        };

        log::info!(
            "device initialized: adapter='{}', f16={}, subgroups={}",
            adapter.get_info().name,
            capabilities.has_f16,
            capabilities.has_subgroups,
        );

        let pool = crate::buffer_pool::BufferPool::new(device.clone());
        Ok(Self {
            device,
            queue,
            capabilities,
            pool,
            recorder_live: AtomicBool::new(false),
        })
    }

    /// Async construction for wasm targets — mirrors the teacher's
    /// `#[cfg(target_arch = "wasm32")] create_context`.
    #[cfg(target_arch = "wasm32")]
    pub async fn new_wasm() -> Result<Self, DeviceInitError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::BROWSER_WEBGPU,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| DeviceInitError(format!("adapter request failed: {e}")))?;

        let adapter_features = adapter.features();
        let mut required_features = wgpu::Features::empty();
        if adapter_features.contains(wgpu::Features::SHADER_F16) {
            required_features |= wgpu::Features::SHADER_F16;
        }
        if adapter_features.contains(wgpu::Features::SUBGROUP) {
            required_features |= wgpu::Features::SUBGROUP;
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("wgpu-infer-core device"),
                required_features,
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
                experimental_features: wgpu::ExperimentalFeatures::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| DeviceInitError(format!("device request failed: {e}")))?;

        device.set_device_lost_callback(|reason, message| {
            log::error!("wgpu device lost: {reason:?} - {message}");
        });

        let limits = device.limits();
        let capabilities = DeviceCapabilities {
            has_f16: required_features.contains(wgpu::Features::SHADER_F16),
            has_subgroups: required_features.contains(wgpu::Features::SUBGROUP),
            max_bind_groups: limits.max_bind_groups,
        };

        let pool = crate::buffer_pool::BufferPool::new(device.clone());
        Ok(Self {
            device,
            queue,
            capabilities,
            pool,
            recorder_live: AtomicBool::new(false),
        })
    }

}

impl Device for WgpuDevice {
    fn wgpu_device(&self) -> &wgpu::Device {
        &self.device
    }

    fn wgpu_queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn buffer_pool(&self) -> &crate::buffer_pool::BufferPool {
        &self.pool
    }

    fn allow_readback(&self, reason: &'static str) -> bool {
        let live = self.recorder_live.load(Ordering::SeqCst);
        if live {
            log::debug!("readback denied ({reason}): a command recorder is still open");
        }
        !live
    }

    fn set_recorder_live(&self, live: bool) {
        self.recorder_live.store(live, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_default_to_unsupported() {
        let caps = DeviceCapabilities::default();
        assert!(!caps.has_f16);
        assert!(!caps.has_subgroups);
    }
}
