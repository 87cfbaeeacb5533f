//! Tandem Physics -- a rapier2d world owned by its own consumer thread.
//!
//! Producers on any thread hold a [`PhysicsContext`] and queue commands
//! (create a body, set a velocity, cast a ray). The [`PhysicsWorld`] lives on
//! the physics consumer thread, applies those commands in FIFO order once per
//! tick, steps the simulation and publishes a [`Snapshot`] that producers can
//! read without touching the live world.
//!
//! # Example
//!
//! ```
//! use tandem_physics::prelude::*;
//! use tandem_sync::prelude::*;
//!
//! let mut jobs = JobSystem::new(JobSystemConfig::default());
//! let mut physics = PhysicsSubsystem::start(&mut jobs, &PhysicsConfig::default()).unwrap();
//! let ctx = physics.context().clone();
//!
//! let ball = ctx.add_rigid_body(BodyDesc::default()).unwrap();
//! ctx.set_linear_velocity(ball, Vec2::new(1.0, 0.0)).unwrap();
//! assert!(!ctx.has_body(ball)); // nothing applied yet
//!
//! physics.consumer_mut().tick();
//! assert!(ctx.has_body(ball));
//!
//! assert!(physics.consumer_mut().shutdown());
//! assert!(jobs.terminate_all());
//! ```

#![deny(unsafe_code)]

pub mod command;
pub mod context;
pub(crate) mod query;
pub mod snapshot;
pub mod world;

use serde::{Deserialize, Serialize};
use tandem_queue::ring::{OverflowPolicy, QueueConfig};

pub use command::{PhysicsCommand, Vec2};
pub use context::{PhysicsContext, PhysicsSubsystem};
pub use snapshot::{Readback, Snapshot};
pub use world::PhysicsWorld;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the physics subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    /// Command queue size and overflow behaviour.
    pub queue: QueueConfig,
    /// Initial world gravity.
    pub gravity: Vec2,
    /// Simulated time per step, in seconds.
    pub fixed_dt: f64,
    /// Maximum number of live handles (bodies plus joints).
    pub max_bodies: u32,
    /// Consumer thread stack size in bytes; zero for the platform default.
    pub stack_size: usize,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig {
                capacity: 4096,
                policy: OverflowPolicy::Reject,
            },
            gravity: Vec2::new(0.0, -9.81),
            fixed_dt: 1.0 / 60.0,
            max_bodies: 65_536,
            stack_size: 0,
        }
    }
}

impl PhysicsConfig {
    /// Check that the configuration can be used to start the subsystem.
    pub fn validate(&self) -> Result<(), PhysicsError> {
        let invalid = |reason: &str| {
            Err(PhysicsError::InvalidConfig {
                reason: reason.to_owned(),
            })
        };
        if !self.fixed_dt.is_finite() || self.fixed_dt <= 0.0 {
            return invalid("fixed_dt must be positive and finite");
        }
        if !self.gravity.is_finite() {
            return invalid("gravity must be finite");
        }
        if self.max_bodies == 0 {
            return invalid("max_bodies must be non-zero");
        }
        if self.queue.capacity == 0 {
            return invalid("queue capacity must be non-zero");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the physics subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PhysicsError {
    /// The configuration cannot be used.
    #[error("invalid physics configuration: {reason}")]
    InvalidConfig {
        /// What is wrong.
        reason: String,
    },

    /// An immediate query had unusable parameters.
    #[error("invalid physics query: {reason}")]
    InvalidQuery {
        /// What is wrong.
        reason: String,
    },

    /// The consumer thread could not be started.
    #[error(transparent)]
    Consumer(#[from] tandem_queue::ConsumerError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::command::{
        BodyDesc, BodyKind, CircleCast, CollisionGroup, Contact, JointDesc, JointKind,
        PhysicsCommand, RayHit, RayQuery, Shape, ShapeHit, Transform, Vec2,
    };
    pub use crate::context::{PhysicsContext, PhysicsSubsystem};
    pub use crate::snapshot::{BodyState, CollisionPair, Readback, Snapshot};
    pub use crate::world::PhysicsWorld;
    pub use crate::{PhysicsConfig, PhysicsError};
    pub use tandem_queue::handle::Handle;
}
