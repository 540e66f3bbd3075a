use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Net gaps below this distance are treated as a collision, in m.
pub const COLLISION_GAP: f64 = 0.02; // m

/// The floor applied to the net gap before dividing by it, in m.
const MIN_GAP: f64 = 0.01; // m

/// The minimum distance kept to a standing obstacle, in m.
const MIN_OBSTACLE_DIST: f64 = 1.0; // m

/// Raised when a vehicle is so close to its leader that the car following
/// model no longer produces a meaningful acceleration.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("net gap of {gap:.3} m is below the collision floor")]
pub struct Collision {
    /// The net gap to the leader in m.
    pub gap: f64,
}

/// The state of a leading vehicle, as seen by its follower.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Leader {
    /// The position of the leader's front bumper in m.
    pub pos: f64,
    /// The leader's velocity in m/s.
    pub vel: f64,
    /// The leader's length in m.
    pub length: f64,
}

/// The intelligent driver model.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IdmModel {
    /// The desired velocity in free traffic, in m/s.
    pub desired_speed: f64,
    /// The desired time gap to the vehicle ahead, in s.
    pub time_headway: f64,
    /// The maximum acceleration in m/s<sup>2</sup>.
    pub max_acc: f64,
    /// The comfortable deceleration, a positive number in m/s<sup>2</sup>.
    pub comf_dec: f64,
    /// The minimum net gap at standstill, in m.
    pub jam_distance: f64,
}

impl Leader {
    /// Gets the net gap between the rear of this leader and the front of a follower at `pos`.
    pub fn gap_from(&self, pos: f64) -> f64 {
        self.pos - pos - self.length
    }
}

impl IdmModel {
    /// The free road term, used when there is no leader.
    pub fn free_road(&self, vel: f64) -> f64 {
        self.max_acc * (1.0 - (vel / self.desired_speed).powi(4))
    }

    /// The desired net gap `s*` when following a leader travelling at `their_vel`.
    pub fn desired_gap(&self, my_vel: f64, their_vel: f64) -> f64 {
        let appr = my_vel - their_vel;
        let factor = 1.0 / (2.0 * (self.max_acc * self.comf_dec).sqrt());
        let dynamic = my_vel * self.time_headway + my_vel * appr * factor;
        self.jam_distance + f64::max(0.0, dynamic)
    }

    /// Computes an acceleration using the intelligent driver model.
    ///
    /// The result is not clamped to the vehicle's acceleration bounds.
    ///
    /// # Arguments
    /// * `vel` - The velocity of the simulated vehicle (m/s).
    /// * `pos` - The position of the simulated vehicle's front bumper (m).
    /// * `leader` - The vehicle ahead, if there is one.
    pub fn acceleration(&self, vel: f64, pos: f64, leader: Option<Leader>) -> Result<f64, Collision> {
        let Some(leader) = leader else {
            return Ok(self.free_road(vel));
        };

        let gap = leader.gap_from(pos);
        if gap < COLLISION_GAP {
            return Err(Collision { gap });
        }

        let term = self.desired_gap(vel, leader.vel) / f64::max(gap, MIN_GAP);
        Ok(self.free_road(vel) - self.max_acc * term * term)
    }

    /// Calculates the acceleration needed to stop before a standing obstacle,
    /// such as the end of an on-ramp. Returns infinity when the obstacle is
    /// still far enough away not to constrain the vehicle.
    ///
    /// # Arguments
    /// * `vel` - The velocity of the simulated vehicle (m/s).
    /// * `pos` - The position of the simulated vehicle's front bumper (m).
    /// * `obstacle` - The position of the obstacle (m).
    /// * `reaction_time` - The time headway kept to the obstacle (s).
    pub fn stop_before(&self, vel: f64, pos: f64, obstacle: f64, reaction_time: f64) -> f64 {
        let factor = 1.0 / (2.0 * (self.max_acc * self.comf_dec).sqrt());
        let ss = MIN_OBSTACLE_DIST + f64::max(0.0, vel * reaction_time + vel * vel * factor);
        let dist = obstacle - pos;
        if dist >= ss {
            return f64::INFINITY;
        }
        let term = ss / f64::max(dist, MIN_OBSTACLE_DIST);
        let acc = self.free_road(vel) - self.max_acc * term * term;
        f64::max(acc, -self.comf_dec)
    }

    /// Returns a copy of the model for anticipating the `k`-th vehicle ahead,
    /// which keeps `k` times the jam distance and time headway.
    pub fn anticipating(&self, k: usize) -> Self {
        let k = k as f64;
        Self {
            jam_distance: k * self.jam_distance,
            time_headway: k * self.time_headway,
            ..*self
        }
    }
}
