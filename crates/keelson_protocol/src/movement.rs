//! The deterministic movement step shared by server and client.
//!
//! Prediction and reconciliation only work if both sides compute the
//! exact same floating-point results for the same inputs. Everything in
//! this module therefore sticks to basic `f32` arithmetic (`+ - * /` and
//! `sqrt`, all IEEE-754-exact) in a fixed evaluation order. No vendor
//! transcendental functions, no iterator reordering, no SIMD shortcuts.

use glam::{Vec2, Vec3};

use crate::{InputData, StateSnapshot};

/// Movement physics constants.
///
/// Client and server must be configured with identical values; any
/// mismatch shows up as a permanent misprediction stream.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct MovementSettings {
    /// Ground speed in units per second.
    pub walk_speed: f32,
    /// Ground speed while the sprint flag is held.
    pub sprint_speed: f32,
    /// Instantaneous upward velocity applied on jump.
    pub jump_impulse: f32,
    /// Downward acceleration in units per second squared.
    pub gravity: f32,
    /// Horizontal velocity decay per second while grounded with no input.
    pub friction: f32,
    /// Height at or below which a descending player lands.
    pub grounded_threshold: f32,
    /// Hard cap on horizontal displacement per step.
    pub max_step: f32,
}

impl Default for MovementSettings {
    fn default() -> Self {
        Self {
            walk_speed: 4.0,
            sprint_speed: 7.0,
            jump_impulse: 8.0,
            gravity: 20.0,
            friction: 10.0,
            grounded_threshold: 0.01,
            max_step: 0.5,
        }
    }
}

/// Advances `prev` by one tick of `input`.
///
/// This is a pure transition function: the same `(prev, input, settings,
/// dt)` always yields a bit-identical snapshot. The returned snapshot
/// carries the input's tick and sequence.
pub fn step(
    prev: &StateSnapshot,
    input: &InputData,
    settings: &MovementSettings,
    dt: f32,
) -> StateSnapshot {
    let mut position = prev.position;
    let mut velocity = prev.velocity;
    let mut grounded = prev.flags.grounded();

    // Clamp intent to the unit circle. Well-behaved clients already send
    // a direction within it; the tolerance in the validation bound is for
    // rounding, not for speed.
    let mut dir = input.move_dir;
    let len_sq = dir.length_squared();
    if len_sq > 1.0 {
        let len = len_sq.sqrt();
        dir = Vec2::new(dir.x / len, dir.y / len);
    }

    let moving = dir.x != 0.0 || dir.y != 0.0;
    let crouching = input.flags.crouch();
    let sprinting = input.flags.sprint() && !crouching && moving && grounded;

    let speed = if crouching {
        settings.walk_speed * 0.5
    } else if sprinting {
        settings.sprint_speed
    } else {
        settings.walk_speed
    };

    if moving {
        velocity.x = dir.x * speed;
        velocity.z = dir.y * speed;
    } else if grounded {
        let decay = 1.0 - settings.friction * dt;
        let decay = if decay < 0.0 { 0.0 } else { decay };
        velocity.x *= decay;
        velocity.z *= decay;
    }

    if grounded && input.flags.jump() {
        velocity.y = settings.jump_impulse;
        grounded = false;
    }

    if !grounded {
        velocity.y -= settings.gravity * dt;
    }

    let mut step_x = velocity.x * dt;
    let mut step_z = velocity.z * dt;
    let step_sq = step_x * step_x + step_z * step_z;
    let max_step_sq = settings.max_step * settings.max_step;
    if step_sq > max_step_sq {
        let scale = settings.max_step / step_sq.sqrt();
        step_x *= scale;
        step_z *= scale;
    }

    position.x += step_x;
    position.z += step_z;
    position.y += velocity.y * dt;

    if position.y <= settings.grounded_threshold && velocity.y <= 0.0 {
        position.y = 0.0;
        velocity.y = 0.0;
        grounded = true;
    }

    let airborne = !grounded;

    StateSnapshot {
        tick: input.tick,
        last_processed_input: input.sequence,
        position,
        velocity,
        rotation: input.rotation,
        flags: prev
            .flags
            .with_grounded(grounded)
            .with_sprinting(sprinting)
            .with_crouching(crouching)
            .with_jumping(airborne && velocity.y > 0.0)
            .with_falling(airborne && velocity.y <= 0.0),
    }
}

/// The upper bound on horizontal displacement per step the server
/// tolerates before flagging a speed violation.
pub fn max_step_displacement(settings: &MovementSettings, dt: f32) -> f32 {
    settings.sprint_speed * 1.2 * dt
}
