#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What the simulation does when a vehicle is found closer to its leader
/// than the collision floor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CollisionPolicy {
    /// Abort the step with [crate::Error::Collision].
    #[default]
    Halt,
    /// Remove the following vehicle from the simulation and carry on.
    RemoveVehicle,
}

/// Simulation wide settings. Vehicle and lane behaviour is configured
/// through their attributes.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SimulationConfig {
    /// How collisions are handled.
    pub collision_policy: CollisionPolicy,
    /// The hardest braking a lane change may impose on anyone, in m/s^2 (negative).
    pub brake_threshold: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            collision_policy: CollisionPolicy::Halt,
            brake_threshold: -2.0,
        }
    }
}

#[cfg(feature = "serde")]
impl SimulationConfig {
    /// Parses the configuration from JSON. Missing fields take their default value.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
