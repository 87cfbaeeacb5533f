//! Tandem Engine -- the host that schedules every consumer thread.
//!
//! This crate ties the workspace together: it loads an [`EngineConfig`],
//! starts the physics and render consumers on a shared
//! [`JobSystem`](tandem_sync::job::JobSystem), runs host systems each frame,
//! ticks every consumer, and gathers the failures they absorbed.
//!
//! # Quick Start
//!
//! ```
//! use tandem_engine::prelude::*;
//!
//! let mut engine = Engine::start(&EngineConfig::default()).unwrap();
//! engine.add_system("spawn", |ctx| {
//!     if ctx.frame() == 1 {
//!         let physics = ctx.physics().unwrap();
//!         physics.add_rigid_body(BodyDesc::default()).unwrap();
//!     }
//! });
//!
//! engine.run_frames(10).unwrap();
//! assert_eq!(engine.physics().unwrap().snapshot().body_count(), 1);
//! engine.shutdown().unwrap();
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod host;
pub mod logging;

pub use config::{ConfigError, EngineConfig};
pub use host::{Engine, FrameContext, FrameDiagnostics};

/// Re-export the synchronization crate.
pub use tandem_sync;

/// Re-export the command queue crate.
pub use tandem_queue;

/// Re-export the physics crate.
pub use tandem_physics;

/// Re-export the render crate.
pub use tandem_render;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the engine host.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The physics subsystem failed to start.
    #[error("physics: {0}")]
    Physics(#[from] tandem_physics::PhysicsError),

    /// The render subsystem failed to start.
    #[error("render: {0}")]
    Render(#[from] tandem_render::RenderError),

    /// A consumer thread ended while the engine was running.
    #[error("consumer '{name}' is no longer running")]
    ConsumerLost {
        /// Name of the consumer.
        name: String,
    },

    /// Some jobs did not terminate within the configured attempts.
    #[error("{pending} job(s) still running after shutdown")]
    ShutdownIncomplete {
        /// Jobs still registered.
        pending: usize,
    },

    /// The engine has already been shut down.
    #[error("engine is shut down")]
    ShutDown,
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use crate::config::{ConfigError, EngineConfig};
    pub use crate::host::{Engine, FrameContext, FrameDiagnostics, SystemFn};
    pub use crate::logging::init_tracing;
    pub use crate::EngineError;

    pub use tandem_physics::prelude::{
        BodyDesc, BodyKind, BodyState, CircleCast, CollisionGroup, CollisionPair, Contact,
        JointDesc, JointKind, PhysicsConfig, PhysicsContext, RayHit, RayQuery, Shape, ShapeHit,
        Snapshot, Transform, Vec2,
    };
    pub use tandem_queue::prelude::{
        CommandError, Diagnostic, Handle, OverflowPolicy, QueueConfig, SubmitError,
    };
    pub use tandem_render::prelude::{
        BufferDesc, BufferUsage, Color, FrameStats, IndexFormat, RenderConfig, RenderContext,
        ShaderDesc, TextureDesc, TextureFormat, Vertex, Viewport,
    };
    pub use tandem_sync::job::JobSystemConfig;
}
