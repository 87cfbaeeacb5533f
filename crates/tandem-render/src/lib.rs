//! Tandem Render -- a device context owned by its own consumer thread.
//!
//! Graphics contexts are usually bound to the thread that created them. This
//! crate keeps the [`RenderDevice`] on a dedicated render consumer thread and
//! gives every other thread a [`RenderContext`] that records resource
//! creation, state changes and draws as commands. The consumer replays them
//! in order once per tick.
//!
//! A [`HeadlessDevice`] is provided; it stores resources in host memory and
//! records presented frames, which is enough to run the whole pipeline
//! without a window.
//!
//! # Example
//!
//! ```
//! use tandem_render::prelude::*;
//! use tandem_sync::prelude::*;
//!
//! let mut jobs = JobSystem::new(JobSystemConfig::default());
//! let mut render = RenderSubsystem::start(&mut jobs, &RenderConfig::default()).unwrap();
//! let ctx = render.context().clone();
//!
//! let triangle = [
//!     Vertex::new([0.0, 0.5], [1.0, 0.0, 0.0, 1.0]),
//!     Vertex::new([-0.5, -0.5], [0.0, 1.0, 0.0, 1.0]),
//!     Vertex::new([0.5, -0.5], [0.0, 0.0, 1.0, 1.0]),
//! ];
//! let vb = ctx.create_buffer_from_slice(BufferUsage::Vertex, &triangle).unwrap();
//! let shader = ctx
//!     .create_shader(ShaderDesc {
//!         label: "flat".into(),
//!         source: "fn vs_main() {} fn fs_main() {}".into(),
//!         vertex_entry: "vs_main".into(),
//!         fragment_entry: "fs_main".into(),
//!         vertex_stride: Vertex::STRIDE,
//!     })
//!     .unwrap();
//! ctx.bind_shader(shader).unwrap();
//! ctx.bind_vertex_buffer(vb).unwrap();
//! ctx.draw(0, 3).unwrap();
//! ctx.present().unwrap();
//!
//! render.consumer_mut().tick();
//! assert_eq!(ctx.last_frame_stats().draw_calls, 1);
//!
//! assert!(render.consumer_mut().shutdown());
//! assert!(jobs.terminate_all());
//! ```

#![deny(unsafe_code)]

pub mod backend;
pub mod command;
pub mod context;
pub mod device;

use serde::{Deserialize, Serialize};
use tandem_queue::ring::{OverflowPolicy, QueueConfig};

pub use backend::{FrameReadback, RenderBackend};
pub use command::{RenderCommand, Vertex};
pub use context::{RenderContext, RenderSubsystem};
pub use device::{FrameStats, HeadlessDevice, RenderDevice};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the render subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Command queue size and overflow behaviour.
    pub queue: QueueConfig,
    /// Maximum number of live buffers, textures and shaders.
    pub max_resources: u32,
    /// Memory budget of the headless device, in bytes.
    pub memory_budget: u64,
    /// Presented frames the headless device keeps for inspection.
    pub frame_history: usize,
    /// Consumer thread stack size in bytes; zero for the platform default.
    pub stack_size: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig {
                capacity: 4096,
                policy: OverflowPolicy::Block,
            },
            max_resources: 16_384,
            memory_budget: device::DEFAULT_MEMORY_BUDGET,
            frame_history: device::DEFAULT_FRAME_HISTORY,
            stack_size: 0,
        }
    }
}

impl RenderConfig {
    /// Check that the configuration can be used to start the subsystem.
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.max_resources == 0 {
            return Err(RenderError::InvalidConfig {
                reason: "max_resources must be non-zero".into(),
            });
        }
        if self.queue.capacity == 0 {
            return Err(RenderError::InvalidConfig {
                reason: "queue capacity must be non-zero".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the render subsystem.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The configuration cannot be used.
    #[error("invalid render configuration: {reason}")]
    InvalidConfig {
        /// What is wrong.
        reason: String,
    },

    /// The consumer thread or its device could not be started.
    #[error(transparent)]
    Consumer(#[from] tandem_queue::ConsumerError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::backend::{FrameReadback, RenderBackend};
    pub use crate::command::{
        BufferDesc, BufferUsage, Color, IndexFormat, RenderCommand, ShaderDesc, TextureDesc,
        TextureFormat, Vertex, Viewport, TEXTURE_SLOTS,
    };
    pub use crate::context::{RenderContext, RenderSubsystem};
    pub use crate::device::{
        DeviceError, DrawBindings, DrawCall, FrameStats, HeadlessDevice, PresentedFrame,
        RenderDevice,
    };
    pub use crate::{RenderConfig, RenderError};
    pub use tandem_queue::handle::Handle;
}
