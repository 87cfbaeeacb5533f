//! Read-only world state published by the consumer after every tick.
//!
//! Producers never read the live physics world. After each tick the consumer
//! builds a [`Snapshot`] (body transforms and velocities plus the collider
//! geometry needed for queries) and swaps it into the shared [`Readback`].
//! Readers clone the `Arc` and work on a stable view while the consumer moves
//! on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rapier2d::prelude::{Isometry, Real, SharedShape};
use tandem_queue::handle::Handle;

use crate::command::{CircleCast, RayHit, RayQuery, ShapeHit, Transform, Vec2};
use crate::query::{self, Candidate};
use crate::PhysicsError;

/// State of one body after a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyState {
    /// World transform.
    pub transform: Transform,
    /// Linear velocity.
    pub linear_velocity: Vec2,
    /// Angular velocity (radians per second).
    pub angular_velocity: f64,
    /// Whether the solver put the body to sleep.
    pub sleeping: bool,
    /// Whether the body takes part in the simulation.
    pub in_world: bool,
}

/// Two bodies that started touching during a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CollisionPair {
    /// Lower handle of the pair.
    pub a: Handle,
    /// Higher handle of the pair.
    pub b: Handle,
}

impl CollisionPair {
    /// Build a pair with its handles in canonical order.
    pub fn new(x: Handle, y: Handle) -> Self {
        Self {
            a: x.min(y),
            b: x.max(y),
        }
    }

    /// Whether `body` is one side of the pair.
    pub fn involves(&self, body: Handle) -> bool {
        self.a == body || self.b == body
    }
}

/// Collider geometry captured for immediate queries.
pub(crate) struct ColliderRecord {
    pub body: Handle,
    pub shape: SharedShape,
    pub position: Isometry<Real>,
    pub membership: u32,
}

/// A consistent view of the world as of the end of one tick.
#[derive(Default)]
pub struct Snapshot {
    pub(crate) tick: u64,
    pub(crate) steps: u64,
    pub(crate) bodies: BTreeMap<Handle, BodyState>,
    pub(crate) colliders: Vec<ColliderRecord>,
    pub(crate) collisions: Vec<CollisionPair>,
}

impl Snapshot {
    /// Consumer tick that produced this snapshot (0 before the first tick).
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Simulation steps taken so far. Lags `tick` while paused.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// State of `body`, if it existed at the end of the tick.
    pub fn body(&self, body: Handle) -> Option<&BodyState> {
        self.bodies.get(&body)
    }

    /// Whether `body` existed at the end of the tick.
    pub fn contains(&self, body: Handle) -> bool {
        self.bodies.contains_key(&body)
    }

    /// Every body, in handle order.
    pub fn bodies(&self) -> impl Iterator<Item = (Handle, &BodyState)> {
        self.bodies.iter().map(|(h, s)| (*h, s))
    }

    /// Number of bodies.
    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    /// Collisions that started during the tick's step, sorted.
    pub fn collisions(&self) -> &[CollisionPair] {
        &self.collisions
    }

    /// Closest ray hit against this snapshot.
    pub fn cast_ray(&self, query: &RayQuery) -> Result<Option<RayHit>, PhysicsError> {
        query::cast_ray(self.candidates(), query)
            .map_err(|reason| PhysicsError::InvalidQuery { reason })
    }

    /// First hit of a swept circle against this snapshot.
    pub fn cast_circle(&self, query: &CircleCast) -> Result<Option<ShapeHit>, PhysicsError> {
        query::cast_circle(self.candidates(), query)
            .map_err(|reason| PhysicsError::InvalidQuery { reason })
    }

    fn candidates(&self) -> impl Iterator<Item = Candidate<'_>> {
        self.colliders.iter().map(|c| Candidate {
            body: c.body,
            shape: &*c.shape,
            position: &c.position,
            membership: c.membership,
        })
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("tick", &self.tick)
            .field("steps", &self.steps)
            .field("bodies", &self.bodies.len())
            .field("colliders", &self.colliders.len())
            .field("collisions", &self.collisions)
            .finish()
    }
}

/// Shared slot holding the most recent [`Snapshot`].
#[derive(Debug, Clone, Default)]
pub struct Readback {
    latest: Arc<RwLock<Arc<Snapshot>>>,
}

impl Readback {
    /// An empty readback (no bodies, tick 0).
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently published snapshot.
    pub fn load(&self) -> Arc<Snapshot> {
        Arc::clone(&self.latest.read())
    }

    pub(crate) fn publish(&self, snapshot: Snapshot) {
        *self.latest.write() = Arc::new(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_replaces_without_touching_readers() {
        let readback = Readback::new();
        let before = readback.load();
        assert_eq!(before.tick(), 0);

        let mut next = Snapshot {
            tick: 1,
            ..Default::default()
        };
        next.bodies.insert(
            Handle::new(0, 0),
            BodyState {
                transform: Transform::default(),
                linear_velocity: Vec2::new(1.0, 0.0),
                angular_velocity: 0.0,
                sleeping: false,
                in_world: true,
            },
        );
        readback.publish(next);

        assert_eq!(before.body_count(), 0, "old view is unchanged");
        let after = readback.load();
        assert_eq!(after.tick(), 1);
        assert!(after.contains(Handle::new(0, 0)));
    }

    #[test]
    fn collision_pairs_are_canonical() {
        let p = CollisionPair::new(Handle::new(5, 0), Handle::new(2, 0));
        assert_eq!(p.a, Handle::new(2, 0));
        assert!(p.involves(Handle::new(5, 0)));
        assert_eq!(p, CollisionPair::new(Handle::new(2, 0), Handle::new(5, 0)));
    }
}
