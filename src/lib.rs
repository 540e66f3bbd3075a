pub use config::{CollisionPolicy, SimulationConfig};
pub use error::{Error, Result};
pub use lane::{Direction, Lane, LaneAttributes, LaneType, Neighbours};
pub use platoon::{IdmFollowing, LinearController, Platoon, PlatoonController};
pub use simulation::{Simulation, StepReport, VehicleRecord};
use slotmap::{new_key_type, SlotMap};
pub use slotmap::{Key, KeyData};
pub use spawn::{SpawnConfig, Spawner};
pub use util::Interval;
pub use vehicle::{
    Agent, Collision, CooperativeParams, DesiredSpeed, Evaluation, IdmModel, Leader, Sample,
    Surroundings, Vehicle, VehicleAttributes, VehicleKind,
};

mod config;
mod error;
mod lane;
mod platoon;
mod simulation;
mod spawn;
mod util;
mod vehicle;

new_key_type! {
    /// Unique ID of a [Lane].
    pub struct LaneId;
    /// Unique ID of a [Vehicle].
    pub struct VehicleId;
    /// Unique ID of a [Platoon].
    pub struct PlatoonId;
}

type LaneSet = SlotMap<LaneId, Lane>;
type VehicleSet = SlotMap<VehicleId, Vehicle>;
type PlatoonSet = SlotMap<PlatoonId, Platoon>;
