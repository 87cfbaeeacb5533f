//! Producer-side physics API.
//!
//! [`PhysicsContext`] is cheap to clone and can be used from any thread. Every
//! mutating method enqueues one command and returns; the change is applied on
//! the physics consumer thread during its next tick. Queries either take a
//! callback (evaluated on the consumer thread against the live world) or run
//! immediately on the calling thread against the last published snapshot.

use std::sync::Arc;

use tandem_queue::callback::ConsumerCallback;
use tandem_queue::handle::{Handle, HandleAllocator};
use tandem_queue::submit::Submitter;
use tandem_queue::threaded::ConsumerThread;
use tandem_queue::SubmitError;
use tandem_sync::job::JobSystem;
use tracing::debug;

use crate::command::{
    BodyDesc, CircleCast, CollisionGroup, Contact, JointDesc, PhysicsCommand, RayHit, RayQuery,
    ShapeHit, Transform, Vec2,
};
use crate::snapshot::{BodyState, CollisionPair, Readback, Snapshot};
use crate::world::{PhysicsWorld, PHYSICS_BACKEND_NAME};
use crate::{PhysicsConfig, PhysicsError};

// ---------------------------------------------------------------------------
// PhysicsContext
// ---------------------------------------------------------------------------

/// Deferred access to the physics world.
#[derive(Debug, Clone)]
pub struct PhysicsContext {
    submitter: Submitter<PhysicsCommand>,
    readback: Readback,
}

impl PhysicsContext {
    /// Wrap a submitter and the readback its consumer publishes to.
    pub fn new(submitter: Submitter<PhysicsCommand>, readback: Readback) -> Self {
        Self {
            submitter,
            readback,
        }
    }

    // -- creation and release -----------------------------------------------

    /// Queue the creation of a body. The handle is usable immediately.
    ///
    /// If the body turns out to be invalid on the consumer (bad shape, NaN
    /// values) the failure is reported as a diagnostic and the handle stays
    /// reserved until [`release`](Self::release)d.
    pub fn add_rigid_body(&self, desc: BodyDesc) -> Result<Handle, SubmitError> {
        let desc = Box::new(desc);
        self.submitter
            .submit_create(|handle| PhysicsCommand::AddRigidBody { handle, desc })
    }

    /// Queue the creation of a joint between two bodies.
    pub fn add_joint(&self, desc: JointDesc) -> Result<Handle, SubmitError> {
        self.submitter
            .submit_create(|handle| PhysicsCommand::AddJoint { handle, desc })
    }

    /// Queue the destruction of a body or joint. The handle must not be used
    /// afterwards; later commands carrying it fail as stale.
    pub fn release(&self, handle: Handle) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::Release { handle })
    }

    // -- mutation -------------------------------------------------------------

    /// Set a body's linear velocity.
    pub fn set_linear_velocity(&self, body: Handle, velocity: Vec2) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::SetLinearVelocity { body, velocity })
    }

    /// Set a body's angular velocity.
    pub fn set_angular_velocity(&self, body: Handle, velocity: f64) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::SetAngularVelocity { body, velocity })
    }

    /// Teleport a body.
    pub fn set_transform(&self, body: Handle, transform: Transform) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::SetTransform { body, transform })
    }

    /// Change world gravity.
    pub fn set_gravity(&self, gravity: Vec2) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::SetGravity { gravity })
    }

    /// Change a body's friction.
    pub fn set_friction(&self, body: Handle, friction: f64) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::SetFriction { body, friction })
    }

    /// Change a body's linear and angular damping.
    pub fn set_damping(&self, body: Handle, linear: f64, angular: f64) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::SetDamping {
            body,
            linear,
            angular,
        })
    }

    /// Change a body's collision filtering.
    pub fn set_collision_group(
        &self,
        body: Handle,
        group: CollisionGroup,
    ) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::SetCollisionGroup { body, group })
    }

    /// Apply a force at the centre of mass for the next step.
    pub fn add_central_force(&self, body: Handle, force: Vec2) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::AddCentralForce { body, force })
    }

    /// Apply an impulse at the centre of mass.
    pub fn add_central_impulse(&self, body: Handle, impulse: Vec2) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::AddCentralImpulse { body, impulse })
    }

    /// Put a body back into the simulation.
    pub fn add_to_world(&self, body: Handle) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::AddToWorld { body })
    }

    /// Take a body out of the simulation without destroying it.
    pub fn remove_from_world(&self, body: Handle) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::RemoveFromWorld { body })
    }

    /// Suspend or resume stepping.
    pub fn set_paused(&self, paused: bool) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::SetPaused { paused })
    }

    /// Advance exactly one step on the next tick, even while paused.
    pub fn single_step(&self) -> Result<(), SubmitError> {
        self.send(PhysicsCommand::SingleStep)
    }

    // -- deferred queries -----------------------------------------------------

    /// Cast a ray on the consumer thread.
    ///
    /// `callback` runs on the physics thread during the next tick, exactly
    /// once. It must not block.
    pub fn cast_ray<F>(&self, query: RayQuery, callback: F) -> Result<(), SubmitError>
    where
        F: FnOnce(&Option<RayHit>) + Send + 'static,
    {
        self.send(PhysicsCommand::CastRay {
            query,
            callback: ConsumerCallback::new(callback),
        })
    }

    /// Sweep a circle on the consumer thread. See [`cast_ray`](Self::cast_ray).
    pub fn cast_circle<F>(&self, query: CircleCast, callback: F) -> Result<(), SubmitError>
    where
        F: FnOnce(&Option<ShapeHit>) + Send + 'static,
    {
        self.send(PhysicsCommand::CastCircle {
            query,
            callback: ConsumerCallback::new(callback),
        })
    }

    /// Collect every body touching `body`. See [`cast_ray`](Self::cast_ray).
    pub fn contact_test<F>(&self, body: Handle, callback: F) -> Result<(), SubmitError>
    where
        F: FnOnce(&Vec<Contact>) + Send + 'static,
    {
        self.send(PhysicsCommand::ContactTest {
            body,
            callback: ConsumerCallback::new(callback),
        })
    }

    // -- immediate reads ------------------------------------------------------

    /// Cast a ray now, on this thread, against the last published snapshot.
    pub fn cast_ray_immediate(&self, query: &RayQuery) -> Result<Option<RayHit>, PhysicsError> {
        self.readback.load().cast_ray(query)
    }

    /// Sweep a circle now against the last published snapshot.
    pub fn cast_circle_immediate(
        &self,
        query: &CircleCast,
    ) -> Result<Option<ShapeHit>, PhysicsError> {
        self.readback.load().cast_circle(query)
    }

    /// State of `body` as of the last tick.
    pub fn body_state(&self, body: Handle) -> Option<BodyState> {
        self.readback.load().body(body).copied()
    }

    /// Whether `body` existed at the end of the last tick.
    pub fn has_body(&self, body: Handle) -> bool {
        self.readback.load().contains(body)
    }

    /// Collisions that started during the last tick.
    pub fn collisions(&self) -> Vec<CollisionPair> {
        self.readback.load().collisions().to_vec()
    }

    /// The last published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.readback.load()
    }

    /// Commands queued and not yet consumed.
    pub fn pending(&self) -> usize {
        self.submitter.pending()
    }

    fn send(&self, command: PhysicsCommand) -> Result<(), SubmitError> {
        self.submitter.submit(command).map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// PhysicsSubsystem
// ---------------------------------------------------------------------------

/// A running physics consumer thread and its producer-side context.
#[derive(Debug)]
pub struct PhysicsSubsystem {
    consumer: ConsumerThread<PhysicsCommand>,
    context: PhysicsContext,
}

impl PhysicsSubsystem {
    /// Spawn the physics consumer as a job of `jobs`.
    ///
    /// The rapier world is built on the new thread. Fails if the
    /// configuration is invalid or the thread cannot be started.
    pub fn start(jobs: &mut JobSystem, config: &PhysicsConfig) -> Result<Self, PhysicsError> {
        config.validate()?;
        let allocator = Arc::new(HandleAllocator::new(config.max_bodies));
        let readback = Readback::new();

        let world_config = config.clone();
        let world_allocator = Arc::clone(&allocator);
        let world_readback = readback.clone();
        let consumer = ConsumerThread::spawn(
            jobs,
            PHYSICS_BACKEND_NAME,
            config.stack_size,
            &config.queue,
            allocator,
            move || Ok(PhysicsWorld::new(&world_config, world_allocator, world_readback)),
        )?;
        debug!(
            capacity = config.queue.capacity,
            policy = ?config.queue.policy,
            max_bodies = config.max_bodies,
            "physics subsystem started"
        );

        let context = PhysicsContext::new(consumer.submitter().clone(), readback);
        Ok(Self { consumer, context })
    }

    /// The producer-side API.
    pub fn context(&self) -> &PhysicsContext {
        &self.context
    }

    /// The consumer thread, for the host's tick scheduling.
    pub fn consumer(&self) -> &ConsumerThread<PhysicsCommand> {
        &self.consumer
    }

    /// Mutable access to the consumer thread.
    pub fn consumer_mut(&mut self) -> &mut ConsumerThread<PhysicsCommand> {
        &mut self.consumer
    }
}
