//! The MOBIL lane changing model.
//!
//! Everything here works on detached [Agent] values describing a vehicle
//! as it would be in some lane, so hypothetical lane changes can be
//! evaluated without touching the real vehicles or lanes.

use super::acceleration::{Collision, IdmModel, Leader};
use crate::lane::Direction;

/// A vehicle as it would behave in a particular lane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Agent {
    /// The car following model, with the desired speed for the lane.
    pub idm: IdmModel,
    /// The position of the vehicle's front bumper in m.
    pub pos: f64,
    /// The velocity in m/s.
    pub vel: f64,
    /// The vehicle's length in m.
    pub length: f64,
    /// The lane's dead end and the vehicle's reaction time, if the lane ends.
    pub dead_end: Option<(f64, f64)>,
}

/// The vehicles directly ahead and behind a position in one lane.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Surroundings {
    pub front: Option<Agent>,
    pub rear: Option<Agent>,
}

/// The outcome of evaluating a lane change in one direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    /// The MOBIL incentive in m/s<sup>2</sup>.
    pub incentive: f64,
    /// Whether neither the ego vehicle nor its new follower would brake harder
    /// than the braking threshold.
    pub safe: bool,
}

impl Agent {
    /// This agent as seen by a follower.
    pub fn as_leader(&self) -> Leader {
        Leader {
            pos: self.pos,
            vel: self.vel,
            length: self.length,
        }
    }

    /// The acceleration of this agent when following `leader`.
    pub fn following(&self, leader: Option<&Agent>) -> Result<f64, Collision> {
        let acc = self
            .idm
            .acceleration(self.vel, self.pos, leader.map(Agent::as_leader))?;
        Ok(match self.dead_end {
            Some((end, reaction_time)) => {
                let stop = self.idm.stop_before(self.vel, self.pos, end, reaction_time);
                f64::min(acc, stop)
            }
            None => acc,
        })
    }
}

/// Whether an acceleration is gentle enough to be imposed by a lane change.
pub fn is_safe(acc: f64, brake_threshold: f64) -> bool {
    acc >= brake_threshold
}

/// Evaluates the incentive and safety of a lane change.
///
/// # Parameters
/// * `ego_here` - The vehicle as it behaves in its current lane
/// * `ego_there` - The vehicle as it would behave in the target lane
/// * `current` - The neighbours in the current lane
/// * `target` - The neighbours the vehicle would have in the target lane
/// * `politeness` - The weight given to the followers' acceleration changes
/// * `brake_threshold` - The most negative acceleration considered safe
pub fn evaluate(
    ego_here: &Agent,
    ego_there: &Agent,
    current: &Surroundings,
    target: &Surroundings,
    politeness: f64,
    brake_threshold: f64,
) -> Evaluation {
    const UNSAFE: Evaluation = Evaluation {
        incentive: f64::NEG_INFINITY,
        safe: false,
    };

    let Ok(acc_moved) = ego_there.following(target.front.as_ref()) else {
        return UNSAFE;
    };
    let mut safe = is_safe(acc_moved, brake_threshold);

    // The new follower in the target lane gets the ego vehicle as its leader
    let mut delta_target = 0.0;
    if let Some(rear) = &target.rear {
        let Ok(after) = rear.following(Some(ego_there)) else {
            return UNSAFE;
        };
        safe &= is_safe(after, brake_threshold);
        if let Ok(before) = rear.following(target.front.as_ref()) {
            delta_target = after - before;
        }
    }

    // An existing collision ahead leaves nothing to gain by staying
    let acc_current = ego_here
        .following(current.front.as_ref())
        .unwrap_or(f64::NEG_INFINITY);

    // The old follower in the current lane inherits the ego vehicle's leader
    let delta_current = match &current.rear {
        Some(rear) => match (
            rear.following(current.front.as_ref()),
            rear.following(Some(ego_here)),
        ) {
            (Ok(after), Ok(before)) => after - before,
            _ => 0.0,
        },
        None => 0.0,
    };

    let incentive = (acc_moved - acc_current) + politeness * (delta_current + delta_target);
    Evaluation { incentive, safe }
}

/// Chooses the lane change direction from the evaluations of each side.
///
/// The side with the strictly higher incentive above `threshold` is desired;
/// it is only chosen if it is also safe. Equal incentives keep the vehicle in its lane.
pub fn choose(
    left: Option<Evaluation>,
    right: Option<Evaluation>,
    threshold: f64,
) -> Option<Direction> {
    let qualifies = |e: Option<Evaluation>| e.filter(|e| e.incentive > threshold);
    let (dir, eval) = match (qualifies(left), qualifies(right)) {
        (None, None) => return None,
        (Some(l), None) => (Direction::Left, l),
        (None, Some(r)) => (Direction::Right, r),
        (Some(l), Some(r)) if l.incentive > r.incentive => (Direction::Left, l),
        (Some(l), Some(r)) if r.incentive > l.incentive => (Direction::Right, r),
        (Some(_), Some(_)) => return None,
    };
    eval.safe.then_some(dir)
}

#[cfg(test)]
mod test {
    use super::*;

    fn agent(pos: f64, vel: f64) -> Agent {
        Agent {
            idm: IdmModel {
                desired_speed: 25.0,
                time_headway: 1.5,
                max_acc: 2.0,
                comf_dec: 3.0,
                jam_distance: 2.0,
            },
            pos,
            vel,
            length: 5.0,
            dead_end: None,
        }
    }

    #[test]
    fn blocked_vehicle_wants_free_lane() {
        let ego = agent(500.0, 20.0);
        let current = Surroundings {
            front: Some(agent(520.0, 15.0)),
            rear: None,
        };
        let target = Surroundings {
            front: Some(agent(600.0, 20.0)),
            rear: None,
        };
        let eval = evaluate(&ego, &ego, &current, &target, 0.3, -2.0);
        assert!(eval.incentive > 0.5);
        assert!(eval.safe);
    }

    #[test]
    fn cutting_in_close_to_follower_is_unsafe() {
        let ego = agent(500.0, 20.0);
        let target = Surroundings {
            front: None,
            rear: Some(agent(490.0, 25.0)),
        };
        let eval = evaluate(&ego, &ego, &Surroundings::default(), &target, 0.3, -2.0);
        assert!(!eval.safe);
    }

    #[test]
    fn overlapping_target_leader_is_unsafe() {
        let ego = agent(500.0, 20.0);
        let target = Surroundings {
            front: Some(agent(502.0, 20.0)),
            rear: None,
        };
        let eval = evaluate(&ego, &ego, &Surroundings::default(), &target, 0.3, -2.0);
        assert!(!eval.safe);
        assert_eq!(eval.incentive, f64::NEG_INFINITY);
    }

    #[test]
    fn politeness_accounts_for_followers() {
        let ego = agent(500.0, 20.0);
        let current = Surroundings {
            front: Some(agent(540.0, 18.0)),
            rear: None,
        };
        let target = Surroundings {
            front: Some(agent(600.0, 20.0)),
            rear: Some(agent(470.0, 22.0)),
        };
        let selfish = evaluate(&ego, &ego, &current, &target, 0.0, -2.0);
        let polite = evaluate(&ego, &ego, &current, &target, 1.0, -2.0);
        assert!(polite.incentive < selfish.incentive);
    }

    #[test]
    fn dead_end_creates_incentive_to_merge() {
        let mut on_ramp = agent(480.0, 15.0);
        on_ramp.dead_end = Some((500.0, 1.0));
        let main = agent(480.0, 15.0);
        let eval = evaluate(
            &on_ramp,
            &main,
            &Surroundings::default(),
            &Surroundings::default(),
            0.3,
            -2.0,
        );
        assert!(eval.incentive > 0.0);
        assert!(eval.safe);
    }

    #[test]
    fn choose_prefers_strictly_better_side() {
        let eval = |incentive, safe| Some(Evaluation { incentive, safe });
        assert_eq!(choose(eval(1.0, true), eval(2.0, true), 0.5), Some(Direction::Right));
        assert_eq!(choose(eval(2.0, true), eval(1.0, true), 0.5), Some(Direction::Left));
        assert_eq!(choose(eval(2.0, true), None, 0.5), Some(Direction::Left));
        assert_eq!(choose(eval(0.4, true), eval(0.2, true), 0.5), None);
        assert_eq!(choose(eval(1.0, true), eval(1.0, true), 0.5), None);
        // The desired side is unsafe, so the vehicle stays rather than trying the other
        assert_eq!(choose(eval(1.0, true), eval(2.0, false), 0.5), None);
    }
}
