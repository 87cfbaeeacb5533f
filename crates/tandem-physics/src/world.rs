//! The consumer-owned rapier2d world.
//!
//! [`PhysicsWorld`] is the physics [`Backend`]: it is created on the consumer
//! thread, receives every [`PhysicsCommand`] in FIFO order and steps rapier
//! once per tick. Each tick:
//!
//! 1. Queued commands are applied (creation, mutation, queries, release).
//! 2. Unless paused, rapier steps the simulation with the configured fixed dt.
//! 3. Collision-start events are collected and sorted.
//! 4. A [`Snapshot`] of every body is published to the [`Readback`].
//!
//! # Determinism
//!
//! rapier2d is compiled with `enhanced-determinism`. Combined with the fixed
//! timestep and FIFO command order, the simulation is deterministic on the
//! same platform.

use std::sync::Arc;

use rapier2d::prelude::*;
use tandem_queue::consumer::Backend;
use tandem_queue::handle::{Handle, HandleAllocator, HandleTable};
use tandem_queue::CommandError;
use tracing::debug;

use crate::command::{
    BodyDesc, BodyKind, CollisionGroup, JointDesc, JointKind, PhysicsCommand, Shape as ShapeDesc,
    Transform, Vec2,
};
use crate::query::{self, Candidate};
use crate::snapshot::{BodyState, ColliderRecord, CollisionPair, Readback, Snapshot};
use crate::PhysicsConfig;

/// Name reported in logs and diagnostics.
pub const PHYSICS_BACKEND_NAME: &str = "physics";

#[derive(Debug, Clone, Copy)]
struct BodyEntry {
    body: RigidBodyHandle,
    collider: ColliderHandle,
}

/// Simulation state owned by the physics consumer.
pub struct PhysicsWorld {
    pipeline: PhysicsPipeline,
    gravity: Vector<Real>,
    integration_params: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    rigid_body_set: RigidBodySet,
    collider_set: ColliderSet,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    ccd_solver: CCDSolver,
    bodies: HandleTable<BodyEntry>,
    joints: HandleTable<ImpulseJointHandle>,
    /// Bodies with a force applied this tick; cleared after the step.
    forced: Vec<RigidBodyHandle>,
    paused: bool,
    single_step: bool,
    ticks: u64,
    steps: u64,
    last_collisions: Vec<CollisionPair>,
    readback: Readback,
}

impl PhysicsWorld {
    /// Create an empty world.
    ///
    /// `allocator` must be the one producers reserve handles from; `readback`
    /// receives a snapshot after every tick.
    pub fn new(config: &PhysicsConfig, allocator: Arc<HandleAllocator>, readback: Readback) -> Self {
        let mut integration_params = IntegrationParameters::default();
        integration_params.dt = config.fixed_dt as Real;
        Self {
            pipeline: PhysicsPipeline::new(),
            gravity: vector![config.gravity.x as Real, config.gravity.y as Real],
            integration_params,
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            bodies: HandleTable::new(Arc::clone(&allocator)),
            joints: HandleTable::new(allocator),
            forced: Vec::new(),
            paused: false,
            single_step: false,
            ticks: 0,
            steps: 0,
            last_collisions: Vec::new(),
            readback,
        }
    }

    /// Number of live bodies.
    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    /// Number of live joints.
    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    /// Whether `body` resolves to a live body.
    pub fn has_body(&self, body: Handle) -> bool {
        self.bodies.contains(body)
    }

    /// Current state of `body`, read from the live world.
    pub fn body_state(&self, body: Handle) -> Option<BodyState> {
        let entry = self.bodies.get(body)?;
        self.rigid_body_set.get(entry.body).map(body_state)
    }

    /// Whether stepping is suspended.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Simulation steps taken.
    pub fn step_count(&self) -> u64 {
        self.steps
    }

    /// Collisions that started during the most recent step.
    pub fn last_collisions(&self) -> &[CollisionPair] {
        &self.last_collisions
    }

    // -- command handlers ---------------------------------------------------

    fn add_rigid_body(&mut self, handle: Handle, desc: &BodyDesc) -> Result<(), CommandError> {
        if self.bodies.contains(handle) || self.joints.contains(handle) {
            return Err(CommandError::HandleOccupied { handle });
        }
        if !self.bodies.allocator().is_live(handle) {
            return Err(CommandError::StaleHandle { handle });
        }
        let shape = build_shape(&desc.shape)?;
        check_finite(
            "add_rigid_body",
            &[
                desc.transform.position.x,
                desc.transform.position.y,
                desc.transform.rotation,
                desc.linear_velocity.x,
                desc.linear_velocity.y,
                desc.angular_velocity,
                desc.density,
                desc.friction,
                desc.restitution,
                desc.linear_damping,
                desc.angular_damping,
            ],
        )?;

        let builder = match desc.kind {
            BodyKind::Dynamic => RigidBodyBuilder::dynamic(),
            BodyKind::Kinematic => RigidBodyBuilder::kinematic_velocity_based(),
            BodyKind::Static => RigidBodyBuilder::fixed(),
        };
        let rb = builder
            .translation(vector![
                desc.transform.position.x as Real,
                desc.transform.position.y as Real
            ])
            .rotation(desc.transform.rotation as Real)
            .linvel(vector![
                desc.linear_velocity.x as Real,
                desc.linear_velocity.y as Real
            ])
            .angvel(desc.angular_velocity as Real)
            .linear_damping(desc.linear_damping as Real)
            .angular_damping(desc.angular_damping as Real)
            .user_data(u128::from(handle.to_raw()))
            .build();
        let body = self.rigid_body_set.insert(rb);

        let collider = ColliderBuilder::new(shape)
            .density(desc.density as Real)
            .friction(desc.friction as Real)
            .restitution(desc.restitution as Real)
            .sensor(desc.is_sensor)
            .collision_groups(interaction_groups(desc.group))
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .user_data(u128::from(handle.to_raw()))
            .build();
        let collider =
            self.collider_set
                .insert_with_parent(collider, body, &mut self.rigid_body_set);

        if !desc.in_world {
            if let Some(rb) = self.rigid_body_set.get_mut(body) {
                rb.set_enabled(false);
            }
        }

        self.bodies.insert(handle, BodyEntry { body, collider })?;
        Ok(())
    }

    fn add_joint(&mut self, handle: Handle, desc: &JointDesc) -> Result<(), CommandError> {
        if self.bodies.contains(handle) || self.joints.contains(handle) {
            return Err(CommandError::HandleOccupied { handle });
        }
        if !self.joints.allocator().is_live(handle) {
            return Err(CommandError::StaleHandle { handle });
        }
        if desc.body_a == desc.body_b {
            return Err(CommandError::InvalidParams {
                opcode: "add_joint",
                reason: format!("joint connects body {} to itself", desc.body_a),
            });
        }
        let a = self.body_entry(desc.body_a)?.body;
        let b = self.body_entry(desc.body_b)?.body;
        let anchor_a = point![desc.anchor_a.x as Real, desc.anchor_a.y as Real];
        let anchor_b = point![desc.anchor_b.x as Real, desc.anchor_b.y as Real];

        let joint: GenericJoint = match desc.kind {
            JointKind::Revolute => RevoluteJointBuilder::new()
                .local_anchor1(anchor_a)
                .local_anchor2(anchor_b)
                .into(),
            JointKind::Fixed => FixedJointBuilder::new()
                .local_anchor1(anchor_a)
                .local_anchor2(anchor_b)
                .into(),
        };
        let joint = self.impulse_joint_set.insert(a, b, joint, true);
        self.joints.insert(handle, joint)?;
        Ok(())
    }

    fn release(&mut self, handle: Handle) -> Result<(), CommandError> {
        if let Some(entry) = self.bodies.remove(handle) {
            // Rapier drops every joint attached to the body along with it.
            let attached: Vec<Handle> = self
                .joints
                .iter()
                .filter(|(_, joint)| {
                    self.impulse_joint_set
                        .get(**joint)
                        .is_some_and(|j| j.body1 == entry.body || j.body2 == entry.body)
                })
                .map(|(joint, _)| joint)
                .collect();
            for joint in &attached {
                self.joints.remove(*joint);
            }
            if !attached.is_empty() {
                debug!(body = %handle, joints = attached.len(), "released attached joints");
            }
            self.rigid_body_set.remove(
                entry.body,
                &mut self.island_manager,
                &mut self.collider_set,
                &mut self.impulse_joint_set,
                &mut self.multibody_joint_set,
                true,
            );
            return Ok(());
        }
        if let Some(joint) = self.joints.remove(handle) {
            self.impulse_joint_set.remove(joint, true);
            return Ok(());
        }
        // A creation that failed still holds its reservation.
        match self.bodies.release(handle) {
            (_, true) => Ok(()),
            (_, false) => Err(CommandError::StaleHandle { handle }),
        }
    }

    fn body_entry(&self, body: Handle) -> Result<BodyEntry, CommandError> {
        self.bodies
            .get(body)
            .copied()
            .ok_or(CommandError::StaleHandle { handle: body })
    }

    fn rigid_body_mut(&mut self, body: Handle) -> Result<&mut RigidBody, CommandError> {
        let entry = self.body_entry(body)?;
        self.rigid_body_set
            .get_mut(entry.body)
            .ok_or(CommandError::StaleHandle { handle: body })
    }

    fn collider_mut(&mut self, body: Handle) -> Result<&mut Collider, CommandError> {
        let entry = self.body_entry(body)?;
        self.collider_set
            .get_mut(entry.collider)
            .ok_or(CommandError::StaleHandle { handle: body })
    }

    fn live_candidates(&self) -> impl Iterator<Item = Candidate<'_>> {
        let bodies = &self.rigid_body_set;
        self.collider_set.iter().filter_map(move |(_, collider)| {
            let parent = collider.parent()?;
            let enabled = bodies.get(parent).is_some_and(|rb| rb.is_enabled());
            if !enabled || !collider.is_enabled() {
                return None;
            }
            Some(Candidate {
                body: Handle::from_raw(collider.user_data as u64),
                shape: collider.shape(),
                position: collider.position(),
                membership: collider.collision_groups().memberships.bits(),
            })
        })
    }

    // -- stepping -------------------------------------------------------------

    fn simulate(&mut self) {
        let (collision_send, collision_recv) =
            rapier2d::crossbeam::channel::unbounded::<CollisionEvent>();
        let (force_send, _force_recv) =
            rapier2d::crossbeam::channel::unbounded::<ContactForceEvent>();
        let event_handler = ChannelEventCollector::new(collision_send, force_send);

        self.pipeline.step(
            &self.gravity,
            &self.integration_params,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            None,
            &(),
            &event_handler,
        );
        self.steps += 1;

        for body in self.forced.drain(..) {
            if let Some(rb) = self.rigid_body_set.get_mut(body) {
                rb.reset_forces(false);
            }
        }

        let mut collisions = Vec::new();
        while let Ok(event) = collision_recv.try_recv() {
            if let CollisionEvent::Started(h1, h2, _flags) = event {
                let a = self.collider_set.get(h1).map(|c| c.user_data as u64);
                let b = self.collider_set.get(h2).map(|c| c.user_data as u64);
                if let (Some(a), Some(b)) = (a, b) {
                    collisions.push(CollisionPair::new(Handle::from_raw(a), Handle::from_raw(b)));
                }
            }
        }
        // Channel delivery order is not part of the determinism guarantee.
        collisions.sort();
        self.last_collisions = collisions;
    }

    fn publish(&self) {
        let bodies = self
            .bodies
            .iter()
            .filter_map(|(handle, entry)| {
                self.rigid_body_set
                    .get(entry.body)
                    .map(|rb| (handle, body_state(rb)))
            })
            .collect();
        let colliders = self
            .live_candidates()
            .filter_map(|c| {
                let entry = self.bodies.get(c.body)?;
                let collider = self.collider_set.get(entry.collider)?;
                Some(ColliderRecord {
                    body: c.body,
                    shape: collider.shared_shape().clone(),
                    position: *c.position,
                    membership: c.membership,
                })
            })
            .collect();
        self.readback.publish(Snapshot {
            tick: self.ticks,
            steps: self.steps,
            bodies,
            colliders,
            collisions: self.last_collisions.clone(),
        });
    }
}

impl Backend for PhysicsWorld {
    type Command = PhysicsCommand;

    fn name(&self) -> &str {
        PHYSICS_BACKEND_NAME
    }

    fn apply(&mut self, command: PhysicsCommand) -> Result<(), CommandError> {
        match command {
            PhysicsCommand::AddRigidBody { handle, desc } => self.add_rigid_body(handle, &desc),
            PhysicsCommand::AddJoint { handle, desc } => self.add_joint(handle, &desc),
            PhysicsCommand::SetLinearVelocity { body, velocity } => {
                check_finite("set_linear_velocity", &[velocity.x, velocity.y])?;
                self.rigid_body_mut(body)?
                    .set_linvel(vector![velocity.x as Real, velocity.y as Real], true);
                Ok(())
            }
            PhysicsCommand::SetAngularVelocity { body, velocity } => {
                check_finite("set_angular_velocity", &[velocity])?;
                self.rigid_body_mut(body)?.set_angvel(velocity as Real, true);
                Ok(())
            }
            PhysicsCommand::SetTransform { body, transform } => {
                check_finite(
                    "set_transform",
                    &[transform.position.x, transform.position.y, transform.rotation],
                )?;
                self.rigid_body_mut(body)?.set_position(isometry(transform), true);
                Ok(())
            }
            PhysicsCommand::SetGravity { gravity } => {
                check_finite("set_gravity", &[gravity.x, gravity.y])?;
                self.gravity = vector![gravity.x as Real, gravity.y as Real];
                Ok(())
            }
            PhysicsCommand::SetFriction { body, friction } => {
                check_non_negative("set_friction", friction)?;
                self.collider_mut(body)?.set_friction(friction as Real);
                Ok(())
            }
            PhysicsCommand::SetDamping {
                body,
                linear,
                angular,
            } => {
                check_non_negative("set_damping", linear)?;
                check_non_negative("set_damping", angular)?;
                let rb = self.rigid_body_mut(body)?;
                rb.set_linear_damping(linear as Real);
                rb.set_angular_damping(angular as Real);
                Ok(())
            }
            PhysicsCommand::SetCollisionGroup { body, group } => {
                self.collider_mut(body)?
                    .set_collision_groups(interaction_groups(group));
                Ok(())
            }
            PhysicsCommand::AddCentralForce { body, force } => {
                check_finite("add_central_force", &[force.x, force.y])?;
                let rb_handle = self.body_entry(body)?.body;
                self.rigid_body_mut(body)?
                    .add_force(vector![force.x as Real, force.y as Real], true);
                self.forced.push(rb_handle);
                Ok(())
            }
            PhysicsCommand::AddCentralImpulse { body, impulse } => {
                check_finite("add_central_impulse", &[impulse.x, impulse.y])?;
                self.rigid_body_mut(body)?
                    .apply_impulse(vector![impulse.x as Real, impulse.y as Real], true);
                Ok(())
            }
            PhysicsCommand::AddToWorld { body } => {
                self.rigid_body_mut(body)?.set_enabled(true);
                Ok(())
            }
            PhysicsCommand::RemoveFromWorld { body } => {
                self.rigid_body_mut(body)?.set_enabled(false);
                Ok(())
            }
            PhysicsCommand::CastRay { query: q, callback } => {
                match query::cast_ray(self.live_candidates(), &q) {
                    Ok(hit) => {
                        callback.invoke(&hit);
                        Ok(())
                    }
                    Err(reason) => {
                        callback.invoke(&None);
                        Err(CommandError::InvalidParams {
                            opcode: "cast_ray",
                            reason,
                        })
                    }
                }
            }
            PhysicsCommand::CastCircle { query: q, callback } => {
                match query::cast_circle(self.live_candidates(), &q) {
                    Ok(hit) => {
                        callback.invoke(&hit);
                        Ok(())
                    }
                    Err(reason) => {
                        callback.invoke(&None);
                        Err(CommandError::InvalidParams {
                            opcode: "cast_circle",
                            reason,
                        })
                    }
                }
            }
            PhysicsCommand::ContactTest { body, callback } => {
                let Some(entry) = self.bodies.get(body).copied() else {
                    callback.invoke(&Vec::new());
                    return Err(CommandError::StaleHandle { handle: body });
                };
                let tested: Vec<Candidate<'_>> = self
                    .collider_set
                    .get(entry.collider)
                    .map(|c| Candidate {
                        body,
                        shape: c.shape(),
                        position: c.position(),
                        membership: c.collision_groups().memberships.bits(),
                    })
                    .into_iter()
                    .collect();
                let found = query::contacts(&tested, self.live_candidates());
                callback.invoke(&found);
                Ok(())
            }
            PhysicsCommand::SetPaused { paused } => {
                if self.paused != paused {
                    debug!(paused, "physics pause toggled");
                }
                self.paused = paused;
                Ok(())
            }
            PhysicsCommand::SingleStep => {
                self.single_step = true;
                Ok(())
            }
            PhysicsCommand::Release { handle } => self.release(handle),
        }
    }

    fn step(&mut self) {
        self.ticks += 1;
        if !self.paused || std::mem::take(&mut self.single_step) {
            self.simulate();
        } else {
            self.last_collisions.clear();
        }
        self.publish();
    }

    fn shutdown(&mut self) {
        debug!(
            bodies = self.bodies.len(),
            joints = self.joints.len(),
            steps = self.steps,
            "physics world shut down"
        );
        self.readback.publish(Snapshot {
            tick: self.ticks,
            steps: self.steps,
            ..Default::default()
        });
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn body_state(rb: &RigidBody) -> BodyState {
    let t = rb.translation();
    let v = rb.linvel();
    BodyState {
        transform: Transform {
            position: Vec2::new(t.x as f64, t.y as f64),
            rotation: rb.rotation().angle() as f64,
        },
        linear_velocity: Vec2::new(v.x as f64, v.y as f64),
        angular_velocity: rb.angvel() as f64,
        sleeping: rb.is_sleeping(),
        in_world: rb.is_enabled(),
    }
}

fn isometry(transform: Transform) -> Isometry<Real> {
    Isometry::new(
        vector![
            transform.position.x as Real,
            transform.position.y as Real
        ],
        transform.rotation as Real,
    )
}

fn interaction_groups(group: CollisionGroup) -> InteractionGroups {
    InteractionGroups::new(
        Group::from_bits_truncate(group.membership),
        Group::from_bits_truncate(group.filter),
    )
}

fn build_shape(shape: &ShapeDesc) -> Result<SharedShape, CommandError> {
    let invalid = |reason: String| CommandError::InvalidParams {
        opcode: "add_rigid_body",
        reason,
    };
    let positive = |what: &str, v: f64| {
        if v.is_finite() && v > 0.0 {
            Ok(v as Real)
        } else {
            Err(invalid(format!("{what} must be positive and finite, got {v}")))
        }
    };
    match shape {
        ShapeDesc::Box {
            half_width,
            half_height,
        } => Ok(SharedShape::cuboid(
            positive("half width", *half_width)?,
            positive("half height", *half_height)?,
        )),
        ShapeDesc::Circle { radius } => Ok(SharedShape::ball(positive("radius", *radius)?)),
        ShapeDesc::Capsule {
            half_height,
            radius,
        } => Ok(SharedShape::capsule_y(
            positive("half height", *half_height)?,
            positive("radius", *radius)?,
        )),
        ShapeDesc::ConvexHull { points } => {
            if points.len() < 3 || points.iter().any(|p| !p.is_finite()) {
                return Err(invalid(format!(
                    "convex hull needs at least 3 finite points, got {}",
                    points.len()
                )));
            }
            let points: Vec<Point<Real>> = points
                .iter()
                .map(|p| point![p.x as Real, p.y as Real])
                .collect();
            SharedShape::convex_hull(&points)
                .ok_or_else(|| invalid("convex hull points are degenerate".into()))
        }
    }
}

fn check_finite(opcode: &'static str, values: &[f64]) -> Result<(), CommandError> {
    match values.iter().find(|v| !v.is_finite()) {
        Some(v) => Err(CommandError::InvalidParams {
            opcode,
            reason: format!("non-finite value {v}"),
        }),
        None => Ok(()),
    }
}

fn check_non_negative(opcode: &'static str, value: f64) -> Result<(), CommandError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(CommandError::InvalidParams {
            opcode,
            reason: format!("expected a non-negative value, got {value}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{RayQuery, Shape};
    use tandem_queue::callback::ConsumerCallback;

    struct Fixture {
        world: PhysicsWorld,
        allocator: Arc<HandleAllocator>,
        readback: Readback,
    }

    fn fixture(gravity: Vec2) -> Fixture {
        let allocator = Arc::new(HandleAllocator::new(64));
        let readback = Readback::new();
        let config = PhysicsConfig {
            gravity,
            ..Default::default()
        };
        Fixture {
            world: PhysicsWorld::new(&config, Arc::clone(&allocator), readback.clone()),
            allocator,
            readback,
        }
    }

    impl Fixture {
        fn add(&mut self, desc: BodyDesc) -> Handle {
            let handle = self.allocator.reserve().unwrap();
            self.world
                .apply(PhysicsCommand::AddRigidBody {
                    handle,
                    desc: Box::new(desc),
                })
                .unwrap();
            handle
        }
    }

    fn ball_at(x: f64, y: f64) -> BodyDesc {
        BodyDesc {
            transform: Transform {
                position: Vec2::new(x, y),
                rotation: 0.0,
            },
            ..Default::default()
        }
    }

    #[test]
    fn add_and_release_body() {
        let mut f = fixture(Vec2::ZERO);
        let h = f.add(ball_at(0.0, 0.0));
        assert!(f.world.has_body(h));
        assert_eq!(f.world.body_count(), 1);

        f.world.apply(PhysicsCommand::Release { handle: h }).unwrap();
        assert!(!f.world.has_body(h));
        assert_eq!(f.world.rigid_body_set.len(), 0);
        assert_eq!(f.world.collider_set.len(), 0);
        assert!(!f.allocator.is_live(h));
    }

    #[test]
    fn mutations_on_released_handle_are_stale() {
        let mut f = fixture(Vec2::ZERO);
        let h = f.add(ball_at(0.0, 0.0));
        f.world.apply(PhysicsCommand::Release { handle: h }).unwrap();
        let err = f
            .world
            .apply(PhysicsCommand::SetLinearVelocity {
                body: h,
                velocity: Vec2::new(1.0, 0.0),
            })
            .unwrap_err();
        assert_eq!(err, CommandError::StaleHandle { handle: h });
        assert_eq!(
            f.world.apply(PhysicsCommand::Release { handle: h }),
            Err(CommandError::StaleHandle { handle: h })
        );
    }

    #[test]
    fn duplicate_creation_is_rejected() {
        let mut f = fixture(Vec2::ZERO);
        let h = f.add(ball_at(0.0, 0.0));
        let err = f
            .world
            .apply(PhysicsCommand::AddRigidBody {
                handle: h,
                desc: Box::new(ball_at(1.0, 0.0)),
            })
            .unwrap_err();
        assert_eq!(err, CommandError::HandleOccupied { handle: h });
        assert_eq!(f.world.body_count(), 1);
    }

    #[test]
    fn invalid_shape_keeps_reservation_until_released() {
        let mut f = fixture(Vec2::ZERO);
        let h = f.allocator.reserve().unwrap();
        let err = f
            .world
            .apply(PhysicsCommand::AddRigidBody {
                handle: h,
                desc: Box::new(BodyDesc {
                    shape: Shape::Circle { radius: -1.0 },
                    ..Default::default()
                }),
            })
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidParams { .. }));
        assert!(f.allocator.is_live(h));
        f.world.apply(PhysicsCommand::Release { handle: h }).unwrap();
        assert!(!f.allocator.is_live(h));
    }

    #[test]
    fn velocity_moves_body_after_step() {
        let mut f = fixture(Vec2::ZERO);
        let h = f.add(ball_at(0.0, 0.0));
        f.world
            .apply(PhysicsCommand::SetLinearVelocity {
                body: h,
                velocity: Vec2::new(60.0, 0.0),
            })
            .unwrap();
        f.world.step();
        let state = f.world.body_state(h).unwrap();
        assert!(state.transform.position.x > 0.5, "moved to {:?}", state.transform);
        assert_eq!(f.readback.load().body(h).copied(), Some(state));
    }

    #[test]
    fn gravity_affects_dynamic_not_static() {
        let mut f = fixture(Vec2::new(0.0, -9.81));
        let dynamic = f.add(ball_at(0.0, 10.0));
        let fixed = f.add(BodyDesc {
            kind: BodyKind::Static,
            ..ball_at(5.0, 10.0)
        });
        for _ in 0..30 {
            f.world.step();
        }
        assert!(f.world.body_state(dynamic).unwrap().transform.position.y < 10.0);
        assert_eq!(f.world.body_state(fixed).unwrap().transform.position.y, 10.0);
    }

    #[test]
    fn pause_and_single_step() {
        let mut f = fixture(Vec2::ZERO);
        let h = f.add(BodyDesc {
            linear_velocity: Vec2::new(1.0, 0.0),
            ..ball_at(0.0, 0.0)
        });
        f.world.apply(PhysicsCommand::SetPaused { paused: true }).unwrap();
        f.world.step();
        f.world.step();
        assert_eq!(f.world.step_count(), 0);
        assert_eq!(f.world.body_state(h).unwrap().transform.position.x, 0.0);

        f.world.apply(PhysicsCommand::SingleStep).unwrap();
        f.world.step();
        f.world.step();
        assert_eq!(f.world.step_count(), 1);
        assert_eq!(f.readback.load().tick(), 4);
        assert_eq!(f.readback.load().steps(), 1);
    }

    #[test]
    fn removed_body_is_skipped_by_queries() {
        let mut f = fixture(Vec2::ZERO);
        let target = f.add(BodyDesc {
            kind: BodyKind::Static,
            shape: Shape::Box {
                half_width: 1.0,
                half_height: 1.0,
            },
            ..ball_at(5.0, 0.0)
        });
        f.world.step();

        let ray = RayQuery::new(Vec2::ZERO, Vec2::new(1.0, 0.0), 50.0);
        let (cb, rx) = ConsumerCallback::channel();
        f.world.apply(PhysicsCommand::CastRay { query: ray, callback: cb }).unwrap();
        assert_eq!(rx.recv().unwrap().map(|hit| hit.body), Some(target));

        f.world
            .apply(PhysicsCommand::RemoveFromWorld { body: target })
            .unwrap();
        let (cb, rx) = ConsumerCallback::channel();
        f.world.apply(PhysicsCommand::CastRay { query: ray, callback: cb }).unwrap();
        assert_eq!(rx.recv().unwrap(), None);
        assert!(!f.world.body_state(target).unwrap().in_world);
    }

    #[test]
    fn invalid_query_still_invokes_callback() {
        let mut f = fixture(Vec2::ZERO);
        let (cb, rx) = ConsumerCallback::channel();
        let err = f
            .world
            .apply(PhysicsCommand::CastRay {
                query: RayQuery::new(Vec2::ZERO, Vec2::ZERO, 1.0),
                callback: cb,
            })
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidParams { opcode: "cast_ray", .. }));
        assert_eq!(rx.recv().unwrap(), None);
    }

    #[test]
    fn contact_test_reports_overlap() {
        let mut f = fixture(Vec2::ZERO);
        let a = f.add(ball_at(0.0, 0.0));
        let b = f.add(ball_at(0.5, 0.0));
        let _far = f.add(ball_at(10.0, 0.0));

        let (cb, rx) = ConsumerCallback::channel();
        f.world
            .apply(PhysicsCommand::ContactTest { body: a, callback: cb })
            .unwrap();
        let contacts = rx.recv().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].other, b);
    }

    #[test]
    fn joint_lifecycle() {
        let mut f = fixture(Vec2::ZERO);
        let a = f.add(ball_at(0.0, 0.0));
        let b = f.add(ball_at(2.0, 0.0));
        let j = f.allocator.reserve().unwrap();
        f.world
            .apply(PhysicsCommand::AddJoint {
                handle: j,
                desc: JointDesc {
                    kind: JointKind::Revolute,
                    body_a: a,
                    body_b: b,
                    anchor_a: Vec2::new(1.0, 0.0),
                    anchor_b: Vec2::new(-1.0, 0.0),
                },
            })
            .unwrap();
        assert_eq!(f.world.joint_count(), 1);
        f.world.step();
        f.world.apply(PhysicsCommand::Release { handle: j }).unwrap();
        assert_eq!(f.world.joint_count(), 0);
        assert_eq!(f.world.impulse_joint_set.len(), 0);
    }

    #[test]
    fn releasing_a_body_releases_its_joints() {
        let mut f = fixture(Vec2::ZERO);
        let a = f.add(ball_at(0.0, 0.0));
        let b = f.add(ball_at(2.0, 0.0));
        let c = f.add(ball_at(4.0, 0.0));
        let join = |f: &mut Fixture, body_a, body_b| {
            let j = f.allocator.reserve().unwrap();
            f.world
                .apply(PhysicsCommand::AddJoint {
                    handle: j,
                    desc: JointDesc {
                        kind: JointKind::Fixed,
                        body_a,
                        body_b,
                        anchor_a: Vec2::ZERO,
                        anchor_b: Vec2::ZERO,
                    },
                })
                .unwrap();
            j
        };
        let ab = join(&mut f, a, b);
        let bc = join(&mut f, b, c);
        assert_eq!(f.world.joint_count(), 2);

        f.world.apply(PhysicsCommand::Release { handle: a }).unwrap();
        assert_eq!(f.world.joint_count(), f.world.impulse_joint_set.len());
        assert_eq!(f.world.joint_count(), 1);
        assert!(!f.allocator.is_live(ab));
        assert!(f.allocator.is_live(bc));
        assert_eq!(
            f.world.apply(PhysicsCommand::Release { handle: ab }),
            Err(CommandError::StaleHandle { handle: ab })
        );

        f.world.apply(PhysicsCommand::Release { handle: c }).unwrap();
        assert_eq!(f.world.joint_count(), 0);
        assert_eq!(f.world.impulse_joint_set.len(), 0);
        assert!(!f.allocator.is_live(bc));
    }

    #[test]
    fn collisions_are_published() {
        let mut f = fixture(Vec2::ZERO);
        let a = f.add(BodyDesc {
            linear_velocity: Vec2::new(5.0, 0.0),
            ..ball_at(0.0, 0.0)
        });
        let b = f.add(BodyDesc {
            linear_velocity: Vec2::new(-5.0, 0.0),
            ..ball_at(3.0, 0.0)
        });
        let mut seen = false;
        for _ in 0..60 {
            f.world.step();
            if f.readback.load().collisions().contains(&CollisionPair::new(a, b)) {
                seen = true;
                break;
            }
        }
        assert!(seen, "bodies approaching each other must collide");
    }

    #[test]
    fn determinism_two_identical_runs() {
        fn run() -> Vec<(f64, f64)> {
            let mut f = fixture(Vec2::new(0.0, -9.81));
            let h = f.add(BodyDesc {
                linear_velocity: Vec2::new(3.0, 4.0),
                ..ball_at(0.0, 0.0)
            });
            (0..60)
                .map(|_| {
                    f.world.step();
                    let p = f.world.body_state(h).unwrap().transform.position;
                    (p.x, p.y)
                })
                .collect()
        }
        assert_eq!(run(), run());
    }
}
