//! The multi-anticipative car following law used by connected vehicles
//! which are not part of a platoon.

use super::acceleration::{Collision, IdmModel, Leader};
use smallvec::SmallVec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Parameters of the cooperative car following law.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CooperativeParams {
    /// The weight given to the IDM response to each vehicle ahead,
    /// nearest first. The number of weights is the number of leaders
    /// the vehicle receives information from.
    pub weights: SmallVec<[f64; 4]>,
}

impl Default for CooperativeParams {
    fn default() -> Self {
        Self {
            weights: SmallVec::from_slice(&[0.6, 0.3, 0.1]),
        }
    }
}

impl CooperativeParams {
    /// The number of vehicles ahead taken into account.
    pub fn horizon(&self) -> usize {
        self.weights.len()
    }

    /// Checks that the weights can be used for blending.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.weights.is_empty() {
            return Err("cooperative weights must not be empty".into());
        }
        if self.weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("cooperative weights must be finite and non-negative".into());
        }
        if self.weights[0] <= 0.0 {
            return Err("the nearest leader must have a positive weight".into());
        }
        Ok(())
    }
}

/// Blends IDM accelerations against each of the `leaders`, ordered nearest first.
///
/// Against the `k`-th leader the model keeps `k` times the jam distance and
/// time headway, and the gap excludes the lengths of the vehicles in between.
/// Weights are renormalised over the leaders that are actually present.
pub fn blended_acceleration(
    idm: &IdmModel,
    vel: f64,
    pos: f64,
    leaders: &[Leader],
    params: &CooperativeParams,
) -> Result<f64, Collision> {
    if leaders.is_empty() {
        return Ok(idm.free_road(vel));
    }

    let mut occupied = 0.0;
    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for (k, (leader, weight)) in leaders.iter().zip(&params.weights).enumerate() {
        let virtual_leader = Leader {
            pos: leader.pos - occupied,
            ..*leader
        };
        let acc = idm.anticipating(k + 1).acceleration(vel, pos, Some(virtual_leader))?;
        total += weight * acc;
        weight_sum += weight;
        occupied += leader.length;
    }
    Ok(total / weight_sum)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn model() -> IdmModel {
        IdmModel {
            desired_speed: 30.0,
            time_headway: 1.5,
            max_acc: 2.0,
            comf_dec: 3.0,
            jam_distance: 2.0,
        }
    }

    #[test]
    fn single_leader_matches_idm() {
        let idm = model();
        let leader = Leader {
            pos: 60.0,
            vel: 15.0,
            length: 5.0,
        };
        let params = CooperativeParams::default();
        let blended = blended_acceleration(&idm, 20.0, 10.0, &[leader], &params).unwrap();
        let plain = idm.acceleration(20.0, 10.0, Some(leader)).unwrap();
        assert_approx_eq!(blended, plain);
    }

    #[test]
    fn no_leader_is_free_road() {
        let idm = model();
        let params = CooperativeParams::default();
        let acc = blended_acceleration(&idm, 10.0, 0.0, &[], &params).unwrap();
        assert_approx_eq!(acc, idm.free_road(10.0));
    }

    #[test]
    fn braking_further_ahead_is_anticipated() {
        let idm = model();
        let params = CooperativeParams::default();
        let near = Leader {
            pos: 50.0,
            vel: 20.0,
            length: 5.0,
        };
        let cruising = Leader {
            pos: 100.0,
            vel: 20.0,
            length: 5.0,
        };
        let stopped = Leader { vel: 0.0, ..cruising };
        let calm = blended_acceleration(&idm, 20.0, 0.0, &[near, cruising], &params).unwrap();
        let alarmed = blended_acceleration(&idm, 20.0, 0.0, &[near, stopped], &params).unwrap();
        assert!(alarmed < calm);
    }

    #[test]
    fn collision_with_nearest_leader_is_reported() {
        let leader = Leader {
            pos: 5.01,
            vel: 0.0,
            length: 5.0,
        };
        let res = blended_acceleration(&model(), 0.0, 0.0, &[leader], &CooperativeParams::default());
        assert!(res.is_err());
    }

    #[test]
    fn empty_weights_are_rejected() {
        let params = CooperativeParams {
            weights: SmallVec::new(),
        };
        assert!(params.validate().is_err());
        assert!(CooperativeParams::default().validate().is_ok());
    }
}
