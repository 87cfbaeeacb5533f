//! Physics commands and their parameter types.
//!
//! Every producer-side call on [`PhysicsContext`](crate::PhysicsContext)
//! becomes exactly one [`PhysicsCommand`]. Variable-length data (convex hull
//! points) is owned by the command, so nothing the producer holds has to
//! outlive the call.

use serde::{Deserialize, Serialize};
use tandem_queue::callback::ConsumerCallback;
use tandem_queue::consumer::Opcode;
use tandem_queue::handle::Handle;

// ---------------------------------------------------------------------------
// Math and descriptors
// ---------------------------------------------------------------------------

/// A 2D vector in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    /// Horizontal component.
    pub x: f64,
    /// Vertical component.
    pub y: f64,
}

impl Vec2 {
    /// The zero vector.
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    /// Construct from components.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean length.
    pub fn length(self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Whether both components are finite.
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Position and rotation (radians) of a body.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    /// Translation of the body's origin.
    pub position: Vec2,
    /// Counter-clockwise rotation in radians.
    pub rotation: f64,
}

/// How the solver treats a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    /// Fully simulated.
    #[default]
    Dynamic,
    /// Moved by its velocity only; unaffected by forces and contacts.
    Kinematic,
    /// Never moves.
    Static,
}

/// Collision shape of a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    /// Axis-aligned box given by its half extents.
    Box {
        /// Half-width along the x-axis.
        half_width: f64,
        /// Half-height along the y-axis.
        half_height: f64,
    },
    /// Circle.
    Circle {
        /// Radius.
        radius: f64,
    },
    /// Capsule aligned with the y-axis.
    Capsule {
        /// Half the distance between the two cap centres.
        half_height: f64,
        /// Cap radius.
        radius: f64,
    },
    /// Convex hull of a point cloud (at least three non-collinear points).
    ConvexHull {
        /// Points in body space.
        points: Vec<Vec2>,
    },
}

/// Collision filtering bits.
///
/// Two colliders interact when each one's `membership` intersects the other's
/// `filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollisionGroup {
    /// Groups this collider belongs to.
    pub membership: u32,
    /// Groups this collider interacts with.
    pub filter: u32,
}

impl CollisionGroup {
    /// Member of every group, interacts with every group.
    pub const ALL: CollisionGroup = CollisionGroup {
        membership: u32::MAX,
        filter: u32::MAX,
    };
}

impl Default for CollisionGroup {
    fn default() -> Self {
        Self::ALL
    }
}

/// Everything needed to create a rigid body and its collider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyDesc {
    /// Simulation kind.
    pub kind: BodyKind,
    /// Collision shape.
    pub shape: Shape,
    /// Initial transform.
    pub transform: Transform,
    /// Initial linear velocity.
    pub linear_velocity: Vec2,
    /// Initial angular velocity (radians per second).
    pub angular_velocity: f64,
    /// Collider density; mass follows from the shape's area.
    pub density: f64,
    /// Friction coefficient.
    pub friction: f64,
    /// Restitution (bounciness). 0.0 = no bounce, 1.0 = perfect bounce.
    pub restitution: f64,
    /// Linear velocity damping.
    pub linear_damping: f64,
    /// Angular velocity damping.
    pub angular_damping: f64,
    /// Report overlaps without a physical response.
    pub is_sensor: bool,
    /// Collision filtering.
    pub group: CollisionGroup,
    /// Whether the body takes part in the simulation once created. Bodies
    /// created outside the world can be added later with
    /// [`PhysicsCommand::AddToWorld`].
    pub in_world: bool,
}

impl Default for BodyDesc {
    fn default() -> Self {
        Self {
            kind: BodyKind::Dynamic,
            shape: Shape::Circle { radius: 0.5 },
            transform: Transform::default(),
            linear_velocity: Vec2::ZERO,
            angular_velocity: 0.0,
            density: 1.0,
            friction: 0.5,
            restitution: 0.0,
            linear_damping: 0.0,
            angular_damping: 0.0,
            is_sensor: false,
            group: CollisionGroup::ALL,
            in_world: true,
        }
    }
}

/// Kind of constraint between two bodies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointKind {
    /// Bodies rotate freely about a shared pivot.
    Revolute,
    /// Bodies keep their relative transform.
    Fixed,
}

/// A joint between two existing bodies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointDesc {
    /// Constraint kind.
    pub kind: JointKind,
    /// First body.
    pub body_a: Handle,
    /// Second body.
    pub body_b: Handle,
    /// Pivot in `body_a`'s space.
    pub anchor_a: Vec2,
    /// Pivot in `body_b`'s space.
    pub anchor_b: Vec2,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// A ray query. `direction` need not be normalised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayQuery {
    /// Ray origin.
    pub origin: Vec2,
    /// Ray direction.
    pub direction: Vec2,
    /// Longest distance along the ray that counts as a hit.
    pub max_distance: f64,
    /// Only colliders whose membership intersects this mask are considered.
    pub mask: u32,
    /// Body to ignore (usually the caster). [`Handle::INVALID`] for none.
    pub exclude: Handle,
}

impl RayQuery {
    /// A ray that considers every collider.
    pub fn new(origin: Vec2, direction: Vec2, max_distance: f64) -> Self {
        Self {
            origin,
            direction,
            max_distance,
            mask: u32::MAX,
            exclude: Handle::INVALID,
        }
    }

    /// Restrict the query to colliders in `mask`.
    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }

    /// Ignore `body`.
    pub fn excluding(mut self, body: Handle) -> Self {
        self.exclude = body;
        self
    }
}

/// A swept-circle query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircleCast {
    /// Start position of the circle's centre.
    pub origin: Vec2,
    /// Sweep direction.
    pub direction: Vec2,
    /// Circle radius.
    pub radius: f64,
    /// Longest sweep distance that counts as a hit.
    pub max_distance: f64,
    /// Only colliders whose membership intersects this mask are considered.
    pub mask: u32,
    /// Body to ignore. [`Handle::INVALID`] for none.
    pub exclude: Handle,
}

impl CircleCast {
    /// A sweep that considers every collider.
    pub fn new(origin: Vec2, direction: Vec2, radius: f64, max_distance: f64) -> Self {
        Self {
            origin,
            direction,
            radius,
            max_distance,
            mask: u32::MAX,
            exclude: Handle::INVALID,
        }
    }

    /// Restrict the query to colliders in `mask`.
    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }

    /// Ignore `body`.
    pub fn excluding(mut self, body: Handle) -> Self {
        self.exclude = body;
        self
    }
}

/// Closest ray hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// Body that was hit.
    pub body: Handle,
    /// World-space hit point.
    pub point: Vec2,
    /// Surface normal at the hit point.
    pub normal: Vec2,
    /// Distance from the origin along the normalised direction.
    pub distance: f64,
}

/// First contact of a swept circle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeHit {
    /// Body that was hit.
    pub body: Handle,
    /// World-space contact point on the hit body.
    pub point: Vec2,
    /// Contact normal, pointing out of the hit body.
    pub normal: Vec2,
    /// Sweep distance travelled before contact.
    pub distance: f64,
}

/// One body touching the body passed to a contact test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contact {
    /// The other body.
    pub other: Handle,
    /// World-space contact point on the tested body.
    pub point: Vec2,
    /// Contact normal, pointing from the tested body towards `other`.
    pub normal: Vec2,
    /// Penetration depth (zero or positive for touching bodies).
    pub depth: f64,
}

// ---------------------------------------------------------------------------
// PhysicsCommand
// ---------------------------------------------------------------------------

/// Upper bound on the in-queue size of a [`PhysicsCommand`].
pub const MAX_COMMAND_BYTES: usize = 128;

const _: () = assert!(std::mem::size_of::<PhysicsCommand>() <= MAX_COMMAND_BYTES);

/// One deferred operation on the physics world.
#[derive(Debug)]
pub enum PhysicsCommand {
    /// Create a body and its collider under a pre-reserved handle.
    AddRigidBody {
        /// Reserved handle.
        handle: Handle,
        /// Body description.
        desc: Box<BodyDesc>,
    },
    /// Create a joint under a pre-reserved handle.
    AddJoint {
        /// Reserved handle.
        handle: Handle,
        /// Joint description.
        desc: JointDesc,
    },
    /// Set a body's linear velocity.
    SetLinearVelocity {
        /// Target body.
        body: Handle,
        /// New velocity.
        velocity: Vec2,
    },
    /// Set a body's angular velocity.
    SetAngularVelocity {
        /// Target body.
        body: Handle,
        /// New angular velocity (radians per second).
        velocity: f64,
    },
    /// Teleport a body.
    SetTransform {
        /// Target body.
        body: Handle,
        /// New transform.
        transform: Transform,
    },
    /// Change world gravity.
    SetGravity {
        /// New gravity.
        gravity: Vec2,
    },
    /// Change a body's friction coefficient.
    SetFriction {
        /// Target body.
        body: Handle,
        /// New friction.
        friction: f64,
    },
    /// Change a body's damping.
    SetDamping {
        /// Target body.
        body: Handle,
        /// Linear damping.
        linear: f64,
        /// Angular damping.
        angular: f64,
    },
    /// Change a body's collision filtering.
    SetCollisionGroup {
        /// Target body.
        body: Handle,
        /// New filtering bits.
        group: CollisionGroup,
    },
    /// Apply a force at the centre of mass during the next step.
    AddCentralForce {
        /// Target body.
        body: Handle,
        /// Force.
        force: Vec2,
    },
    /// Apply an instantaneous impulse at the centre of mass.
    AddCentralImpulse {
        /// Target body.
        body: Handle,
        /// Impulse.
        impulse: Vec2,
    },
    /// Re-enable a body previously removed from the world.
    AddToWorld {
        /// Target body.
        body: Handle,
    },
    /// Disable a body without destroying it.
    RemoveFromWorld {
        /// Target body.
        body: Handle,
    },
    /// Closest hit along a ray, delivered to `callback`.
    CastRay {
        /// Query parameters.
        query: RayQuery,
        /// Receives the hit, or `None`.
        callback: ConsumerCallback<Option<RayHit>>,
    },
    /// First hit of a swept circle, delivered to `callback`.
    CastCircle {
        /// Query parameters.
        query: CircleCast,
        /// Receives the hit, or `None`.
        callback: ConsumerCallback<Option<ShapeHit>>,
    },
    /// Every body touching `body`, delivered to `callback`.
    ContactTest {
        /// Body to test.
        body: Handle,
        /// Receives the contacts (empty if none, or if `body` is stale).
        callback: ConsumerCallback<Vec<Contact>>,
    },
    /// Pause or resume simulation stepping.
    SetPaused {
        /// Whether stepping is suspended.
        paused: bool,
    },
    /// Run exactly one step on the next tick even while paused.
    SingleStep,
    /// Destroy the body or joint behind `handle` and free the handle.
    Release {
        /// Handle to release.
        handle: Handle,
    },
}

impl Opcode for PhysicsCommand {
    fn opcode(&self) -> &'static str {
        match self {
            PhysicsCommand::AddRigidBody { .. } => "add_rigid_body",
            PhysicsCommand::AddJoint { .. } => "add_joint",
            PhysicsCommand::SetLinearVelocity { .. } => "set_linear_velocity",
            PhysicsCommand::SetAngularVelocity { .. } => "set_angular_velocity",
            PhysicsCommand::SetTransform { .. } => "set_transform",
            PhysicsCommand::SetGravity { .. } => "set_gravity",
            PhysicsCommand::SetFriction { .. } => "set_friction",
            PhysicsCommand::SetDamping { .. } => "set_damping",
            PhysicsCommand::SetCollisionGroup { .. } => "set_collision_group",
            PhysicsCommand::AddCentralForce { .. } => "add_central_force",
            PhysicsCommand::AddCentralImpulse { .. } => "add_central_impulse",
            PhysicsCommand::AddToWorld { .. } => "add_to_world",
            PhysicsCommand::RemoveFromWorld { .. } => "remove_from_world",
            PhysicsCommand::CastRay { .. } => "cast_ray",
            PhysicsCommand::CastCircle { .. } => "cast_circle",
            PhysicsCommand::ContactTest { .. } => "contact_test",
            PhysicsCommand::SetPaused { .. } => "set_paused",
            PhysicsCommand::SingleStep => "single_step",
            PhysicsCommand::Release { .. } => "release",
        }
    }
}
