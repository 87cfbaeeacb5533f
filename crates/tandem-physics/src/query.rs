//! Geometric queries shared by the live world and published snapshots.
//!
//! Both sources expose their colliders as [`Candidate`]s, so a ray cast
//! evaluated on the consumer thread and one evaluated immediately against a
//! snapshot on a producer thread use the same code.

use rapier2d::parry::query::{self as parry_query, Ray, RayCast, ShapeCastOptions};
use rapier2d::parry::shape::{Ball, Shape};
use rapier2d::prelude::*;
use tandem_queue::handle::Handle;

use crate::command::{CircleCast, Contact, RayHit, RayQuery, ShapeHit, Vec2};

/// A collider as seen by a query.
pub(crate) struct Candidate<'a> {
    pub body: Handle,
    pub shape: &'a dyn Shape,
    pub position: &'a Isometry<Real>,
    pub membership: u32,
}

/// Checks a sweep direction and range; the error explains what is wrong.
pub(crate) fn validate_direction(direction: Vec2, max_distance: f64) -> Result<(), String> {
    if !direction.is_finite() || direction.length() <= f64::EPSILON {
        return Err(format!(
            "direction ({}, {}) must be finite and non-zero",
            direction.x, direction.y
        ));
    }
    if max_distance.is_nan() || max_distance < 0.0 {
        return Err(format!("max distance {max_distance} must be non-negative"));
    }
    Ok(())
}

fn unit(direction: Vec2) -> Vector<Real> {
    let len = direction.length();
    vector![(direction.x / len) as Real, (direction.y / len) as Real]
}

fn to_vec2(x: Real, y: Real) -> Vec2 {
    Vec2::new(x as f64, y as f64)
}

fn considered(candidate: &Candidate<'_>, mask: u32, exclude: Handle) -> bool {
    candidate.membership & mask != 0 && candidate.body != exclude
}

/// Closest hit of `query` among `candidates`.
pub(crate) fn cast_ray<'a>(
    candidates: impl Iterator<Item = Candidate<'a>>,
    query: &RayQuery,
) -> Result<Option<RayHit>, String> {
    validate_direction(query.direction, query.max_distance)?;
    let dir = unit(query.direction);
    let ray = Ray::new(
        point![query.origin.x as Real, query.origin.y as Real],
        dir,
    );

    let mut best: Option<RayHit> = None;
    for candidate in candidates {
        if !considered(&candidate, query.mask, query.exclude) {
            continue;
        }
        let Some(hit) = candidate.shape.cast_ray_and_get_normal(
            candidate.position,
            &ray,
            query.max_distance as Real,
            true,
        ) else {
            continue;
        };
        let distance = hit.time_of_impact as f64;
        if best.is_some_and(|b| b.distance <= distance) {
            continue;
        }
        let point = ray.point_at(hit.time_of_impact);
        best = Some(RayHit {
            body: candidate.body,
            point: to_vec2(point.x, point.y),
            normal: to_vec2(hit.normal.x, hit.normal.y),
            distance,
        });
    }
    Ok(best)
}

/// First hit of a circle swept along `query.direction`.
pub(crate) fn cast_circle<'a>(
    candidates: impl Iterator<Item = Candidate<'a>>,
    query: &CircleCast,
) -> Result<Option<ShapeHit>, String> {
    validate_direction(query.direction, query.max_distance)?;
    if !query.radius.is_finite() || query.radius <= 0.0 {
        return Err(format!("radius {} must be positive", query.radius));
    }
    let ball = Ball::new(query.radius as Real);
    let origin = Isometry::translation(query.origin.x as Real, query.origin.y as Real);
    let velocity = unit(query.direction);
    let still = vector![0.0, 0.0];
    let options = ShapeCastOptions::with_max_time_of_impact(query.max_distance as Real);

    let mut best: Option<ShapeHit> = None;
    for candidate in candidates {
        if !considered(&candidate, query.mask, query.exclude) {
            continue;
        }
        // Unsupported shape pairs are skipped.
        let Ok(Some(hit)) = parry_query::cast_shapes(
            &origin,
            &velocity,
            &ball,
            candidate.position,
            &still,
            candidate.shape,
            options,
        ) else {
            continue;
        };
        let distance = hit.time_of_impact as f64;
        if best.is_some_and(|b| b.distance <= distance) {
            continue;
        }
        let point = candidate.position * hit.witness2;
        let normal = candidate.position.rotation * hit.normal2.into_inner();
        best = Some(ShapeHit {
            body: candidate.body,
            point: to_vec2(point.x, point.y),
            normal: to_vec2(normal.x, normal.y),
            distance,
        });
    }
    Ok(best)
}

/// Every candidate touching any of `tested`, one entry per other body
/// (deepest contact wins).
pub(crate) fn contacts<'a>(
    tested: &[Candidate<'a>],
    others: impl Iterator<Item = Candidate<'a>>,
) -> Vec<Contact> {
    let mut found: Vec<Contact> = Vec::new();
    for other in others {
        for mine in tested {
            if other.body == mine.body {
                continue;
            }
            let Ok(Some(contact)) =
                parry_query::contact(mine.position, mine.shape, other.position, other.shape, 0.0)
            else {
                continue;
            };
            let entry = Contact {
                other: other.body,
                point: to_vec2(contact.point1.x, contact.point1.y),
                normal: to_vec2(contact.normal1.x, contact.normal1.y),
                depth: (-contact.dist as f64).max(0.0),
            };
            match found.iter_mut().find(|c| c.other == entry.other) {
                Some(existing) if existing.depth < entry.depth => *existing = entry,
                Some(_) => {}
                None => found.push(entry),
            }
        }
    }
    found.sort_by_key(|c| c.other);
    found
}
