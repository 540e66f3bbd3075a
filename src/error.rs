use crate::lane::Direction;
use crate::{LaneId, PlatoonId, VehicleId};
use thiserror::Error;

/// Errors raised by the simulation.
///
/// Apart from [Error::Collision], every variant is a contract violation by the
/// caller (scenario builder, population generator or driver loop).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("vehicle {vehicle:?} is {gap:.3} m behind its leader, below the collision floor")]
    Collision { vehicle: VehicleId, gap: f64 },
    #[error("time step must be finite and positive, got {0}")]
    InvalidTimeStep(f64),
    #[error("invalid attributes: {0}")]
    InvalidAttributes(String),
    #[error("no such vehicle {0:?}")]
    UnknownVehicle(VehicleId),
    #[error("no such lane {0:?}")]
    UnknownLane(LaneId),
    #[error("no such platoon {0:?}")]
    UnknownPlatoon(PlatoonId),
    #[error("vehicle {0:?} is not on any lane")]
    Detached(VehicleId),
    #[error("vehicle {vehicle:?} is not on lane {lane:?}")]
    VehicleNotInLane { vehicle: VehicleId, lane: LaneId },
    #[error("index {index} is out of range for a sequence of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("vehicle {vehicle:?} at {pos} m would break the position order of lane {lane:?}")]
    OutOfOrder {
        vehicle: VehicleId,
        lane: LaneId,
        pos: f64,
    },
    #[error("position {pos} m lies outside lane {lane:?}")]
    OutsideLane { lane: LaneId, pos: f64 },
    #[error("lane {lane:?} has no neighbour to the {direction:?}")]
    NoAdjacentLane { lane: LaneId, direction: Direction },
    #[error("lanes {left:?} and {right:?} already have other neighbours")]
    AdjacencyConflict { left: LaneId, right: LaneId },
    #[error("vehicle is already on lane {0:?}")]
    SameLane(LaneId),
    #[error("platoon {platoon:?} is full ({max_size} vehicles)")]
    PlatoonFull { platoon: PlatoonId, max_size: usize },
    #[error("platoon {0:?} is empty")]
    PlatoonEmpty(PlatoonId),
    #[error("the leader of platoon {0:?} can only leave by splitting or dissolving it")]
    CannotRemoveLeader(PlatoonId),
    #[error("vehicle {0:?} is not a connected vehicle")]
    NotConnected(VehicleId),
    #[error("vehicle {vehicle:?} already belongs to platoon {platoon:?}")]
    AlreadyInPlatoon {
        vehicle: VehicleId,
        platoon: PlatoonId,
    },
    #[error("vehicle {vehicle:?} is not a member of platoon {platoon:?}")]
    NotInPlatoon {
        vehicle: VehicleId,
        platoon: PlatoonId,
    },
    #[error("vehicle {vehicle:?} is not directly behind platoon {platoon:?}")]
    NotBehindPlatoon {
        vehicle: VehicleId,
        platoon: PlatoonId,
    },
    #[error("gap of {gap:.2} m to platoon {platoon:?} is below the {min:.2} m margin")]
    PlatoonGapTooSmall {
        platoon: PlatoonId,
        gap: f64,
        min: f64,
    },
    #[error("vehicle {0:?} is bound to a platoon and cannot change lanes")]
    PlatoonMember(VehicleId),
}

/// A specialised result type for simulation operations.
pub type Result<T> = std::result::Result<T, Error>;
