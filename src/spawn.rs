use crate::lane::LaneType;
use crate::vehicle::VehicleAttributes;
use crate::{Error, LaneId, Result, Simulation, VehicleId};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The settings of a [Spawner].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SpawnConfig {
    /// The rate of the exponential headway distribution.
    pub lambda: f64,
    /// Multiplies the sampled headway, in m.
    pub headway_scale: f64,
    /// The shortest headway to the rearmost vehicle, in m.
    pub min_headway: f64,
    /// The longest headway to the rearmost vehicle, in m.
    pub max_headway: f64,
    /// The share of new vehicles which are connected, between 0 and 1.
    pub permeability: f64,
    /// The initial velocity of new vehicles in m/s.
    pub speed: f64,
    /// The attributes of human driven vehicles.
    pub human: VehicleAttributes,
    /// The attributes of connected vehicles.
    pub connected: VehicleAttributes,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            lambda: 1.0,
            headway_scale: 50.0,
            min_headway: 20.0,
            max_headway: 100.0,
            permeability: 0.0,
            speed: 15.0,
            human: VehicleAttributes::human_driven(),
            connected: VehicleAttributes::connected(),
        }
    }
}

#[cfg(feature = "serde")]
impl SpawnConfig {
    /// Parses the configuration from JSON. Missing fields take their default value.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Feeds vehicles into the main lanes of a simulation.
///
/// Spawning is deterministic for a given seed and sequence of simulation states.
pub struct Spawner {
    config: SpawnConfig,
    headways: Exp<f64>,
    rng: StdRng,
}

impl Spawner {
    /// Creates a spawner seeded with `seed`.
    pub fn new(config: SpawnConfig, seed: u64) -> Result<Self> {
        let rate_error = || {
            Error::InvalidAttributes(format!("headway rate must be positive, got {}", config.lambda))
        };
        if !(config.lambda > 0.0) {
            return Err(rate_error());
        }
        let headways = Exp::new(config.lambda).map_err(|_| rate_error())?;
        if !(config.min_headway <= config.max_headway) {
            return Err(Error::InvalidAttributes(format!(
                "headway bounds [{}, {}] are empty",
                config.min_headway, config.max_headway
            )));
        }
        if !(0.0..=1.0).contains(&config.permeability) {
            return Err(Error::InvalidAttributes(format!(
                "permeability must lie between 0 and 1, got {}",
                config.permeability
            )));
        }
        config.human.validate()?;
        config.connected.validate()?;
        Ok(Self {
            config,
            headways,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Gets the spawner's settings.
    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    /// Tries to add one vehicle behind the rearmost vehicle of a random main lane.
    ///
    /// Lanes where the vehicle would start before the lane or force anyone to
    /// brake harder than comfortable are skipped. Returns `None` if no lane has room.
    pub fn try_spawn(&mut self, sim: &mut Simulation) -> Option<VehicleId> {
        let headway = (self.headways.sample(&mut self.rng) * self.config.headway_scale)
            .clamp(self.config.min_headway, self.config.max_headway);
        let attribs = match self.rng.gen_bool(self.config.permeability) {
            true => &self.config.connected,
            false => &self.config.human,
        };

        let candidates = sim
            .iter_lanes()
            .filter(|lane| lane.lane_type() == LaneType::Main)
            .filter_map(|lane| {
                let pos = match lane.tail().and_then(|id| sim.get_vehicle(id)) {
                    Some(tail) => tail.pos() - headway,
                    None => lane.extent().min,
                };
                sim.can_insert(lane.id(), attribs, pos, self.config.speed)
                    .then_some((lane.id(), pos))
            })
            .collect::<Vec<(LaneId, f64)>>();
        if candidates.is_empty() {
            return None;
        }

        let (lane, pos) = candidates[self.rng.gen_range(0..candidates.len())];
        match sim.add_vehicle(attribs, lane, pos, self.config.speed) {
            Ok(id) => {
                debug!("spawned vehicle {:?} on lane {:?} with headway {:.1} m", id, lane, headway);
                Some(id)
            }
            Err(err) => {
                debug!("could not spawn on lane {:?}: {}", lane, err);
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::LaneAttributes;

    fn road() -> Simulation {
        let mut sim = Simulation::default();
        let a = sim.add_lane(&LaneAttributes::main(0.0, 1000.0));
        let b = sim.add_lane(&LaneAttributes::main(0.0, 1000.0));
        sim.add_lane(&LaneAttributes::ramp(0.0, 300.0));
        sim.set_adjacent(a, b).unwrap();
        sim
    }

    fn spawn_run(seed: u64) -> Vec<(LaneId, f64, bool)> {
        let mut sim = road();
        let config = SpawnConfig {
            permeability: 0.5,
            ..Default::default()
        };
        let mut spawner = Spawner::new(config, seed).unwrap();
        for _ in 0..50 {
            spawner.try_spawn(&mut sim);
            sim.step(0.1).unwrap();
        }
        sim.records()
            .iter()
            .map(|r| (r.lane, r.pos, sim.get_vehicle(r.id).unwrap().is_connected()))
            .collect()
    }

    #[test]
    fn same_seed_spawns_same_traffic() {
        let first = spawn_run(7);
        assert!(!first.is_empty());
        assert_eq!(first, spawn_run(7));
    }

    #[test]
    fn only_main_lanes_are_used() {
        let mut sim = road();
        let mut spawner = Spawner::new(SpawnConfig::default(), 1).unwrap();
        for _ in 0..10 {
            spawner.try_spawn(&mut sim);
        }
        assert!(sim
            .iter_vehicles()
            .all(|v| sim.get_lane(v.lane_id().unwrap()).unwrap().lane_type() == LaneType::Main));
    }

    #[test]
    fn full_lanes_reject_vehicles() {
        let mut sim = Simulation::default();
        sim.add_lane(&LaneAttributes::main(0.0, 50.0));
        let mut spawner = Spawner::new(SpawnConfig::default(), 3).unwrap();
        assert!(spawner.try_spawn(&mut sim).is_some());
        // The lane is too short to hold a second vehicle at the minimum headway
        assert!(spawner.try_spawn(&mut sim).is_none());
        assert_eq!(sim.iter_vehicles().count(), 1);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let config = SpawnConfig {
            lambda: 0.0,
            ..Default::default()
        };
        assert!(Spawner::new(config, 0).is_err());
        let config = SpawnConfig {
            permeability: 1.5,
            ..Default::default()
        };
        assert!(Spawner::new(config, 0).is_err());
    }
}
