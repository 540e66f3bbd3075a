pub use self::acceleration::{Collision, IdmModel, Leader, COLLISION_GAP};
pub use self::cooperative::CooperativeParams;
pub use self::lane_change::{Agent, Evaluation, Surroundings};
use crate::lane::{Lane, LaneType};
use crate::{Error, LaneId, PlatoonId, VehicleId};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub(crate) mod acceleration;
pub(crate) mod cooperative;
mod dynamics;
pub(crate) mod lane_change;

/// A simulated vehicle.
#[derive(Clone, Debug)]
pub struct Vehicle {
    /// The vehicle's ID
    pub(crate) id: VehicleId,
    /// The vehicle's behavioural parameters.
    attribs: VehicleAttributes,
    /// The position of the front of the vehicle along its lane, in m.
    pos: f64,
    /// The velocity in m/s.
    vel: f64,
    /// The acceleration applied during the last step, in m/s<sup>2</sup>.
    acc: f64,
    /// The lane the vehicle is on.
    pub(crate) lane: Option<LaneId>,
    /// The vehicle directly ahead on the same lane.
    pub(crate) front: Option<VehicleId>,
    /// The vehicle directly behind on the same lane.
    pub(crate) rear: Option<VehicleId>,
    /// The platoon the vehicle belongs to.
    pub(crate) platoon: Option<PlatoonId>,
    /// The state after each step.
    history: Vec<Sample>,
}

/// Whether a vehicle is driven by a human or is connected and automated.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum VehicleKind {
    /// Follows the intelligent driver model.
    HumanDriven,
    /// Receives information from the vehicles ahead and may join platoons.
    Connected(CooperativeParams),
}

/// The desired velocity of a vehicle on each type of lane.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DesiredSpeed {
    /// Desired velocity on main lanes in m/s.
    pub main: f64,
    /// Desired velocity on ramps in m/s.
    pub ramp: f64,
}

/// The attributes of a simulated vehicle.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VehicleAttributes {
    /// Human driven or connected.
    pub kind: VehicleKind,
    /// The vehicle length in m.
    pub length: f64,
    /// The desired velocity on each type of lane.
    pub desired_speed: DesiredSpeed,
    /// The desired time gap to the vehicle ahead, in s.
    pub time_headway: f64,
    /// The maximum acceleration of the vehicle, in m/s^2.
    pub max_acc: f64,
    /// The comfortable deceleration of the vehicle, a positive number in m/s^2.
    pub comf_dec: f64,
    /// The minimum net gap kept at standstill, in m.
    pub jam_distance: f64,
    /// The reaction time in s, used when approaching a standing obstacle.
    pub reaction_time: f64,
    /// The MOBIL politeness factor.
    pub politeness: f64,
    /// The MOBIL incentive needed before changing lanes, in m/s^2.
    pub lc_threshold: f64,
    /// The position at which the vehicle leaves the simulation, if any.
    pub target_pos: Option<f64>,
}

/// A recorded vehicle state.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sample {
    pub pos: f64,
    pub vel: f64,
    pub acc: f64,
}

impl VehicleAttributes {
    /// Typical attributes of a human driven passenger car.
    pub fn human_driven() -> Self {
        Self {
            kind: VehicleKind::HumanDriven,
            length: 5.0,
            desired_speed: DesiredSpeed {
                main: 25.0,
                ramp: 15.0,
            },
            time_headway: 1.5,
            max_acc: 2.0,
            comf_dec: 3.0,
            jam_distance: 2.0,
            reaction_time: 1.0,
            politeness: 0.3,
            lc_threshold: 0.5,
            target_pos: None,
        }
    }

    /// Typical attributes of a connected automated passenger car.
    pub fn connected() -> Self {
        Self {
            kind: VehicleKind::Connected(CooperativeParams::default()),
            time_headway: 1.0,
            reaction_time: 0.5,
            ..Self::human_driven()
        }
    }

    /// Whether the vehicle is connected and may join platoons.
    pub fn is_connected(&self) -> bool {
        matches!(self.kind, VehicleKind::Connected(_))
    }

    /// The car following model of the vehicle on a lane of the given type.
    pub fn idm(&self, lane_type: LaneType) -> IdmModel {
        IdmModel {
            desired_speed: match lane_type {
                LaneType::Main => self.desired_speed.main,
                LaneType::Ramp => self.desired_speed.ramp,
            },
            time_headway: self.time_headway,
            max_acc: self.max_acc,
            comf_dec: self.comf_dec,
            jam_distance: self.jam_distance,
        }
    }

    /// Checks that the attributes describe a vehicle the models can simulate.
    pub fn validate(&self) -> Result<(), Error> {
        let positive = [
            ("length", self.length),
            ("desired speed on main lanes", self.desired_speed.main),
            ("desired speed on ramps", self.desired_speed.ramp),
            ("maximum acceleration", self.max_acc),
            ("comfortable deceleration", self.comf_dec),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::InvalidAttributes(format!("{name} must be positive, got {value}")));
            }
        }
        let non_negative = [
            ("time headway", self.time_headway),
            ("jam distance", self.jam_distance),
            ("reaction time", self.reaction_time),
            ("politeness", self.politeness),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::InvalidAttributes(format!("{name} must not be negative, got {value}")));
            }
        }
        if !self.lc_threshold.is_finite() {
            return Err(Error::InvalidAttributes("lane change threshold must be finite".into()));
        }
        if let VehicleKind::Connected(params) = &self.kind {
            params.validate().map_err(Error::InvalidAttributes)?;
        }
        Ok(())
    }
}

impl Vehicle {
    /// Creates a new vehicle which is not yet on a lane.
    pub(crate) fn new(id: VehicleId, attribs: &VehicleAttributes, pos: f64, vel: f64) -> Self {
        Self {
            id,
            attribs: attribs.clone(),
            pos,
            vel,
            acc: 0.0,
            lane: None,
            front: None,
            rear: None,
            platoon: None,
            history: vec![],
        }
    }

    /// Gets the vehicle's ID.
    pub fn id(&self) -> VehicleId {
        self.id
    }

    /// Gets the vehicle's attributes.
    pub fn attributes(&self) -> &VehicleAttributes {
        &self.attribs
    }

    /// Whether the vehicle is connected and may join platoons.
    pub fn is_connected(&self) -> bool {
        self.attribs.is_connected()
    }

    /// The vehicle's length in m.
    pub fn length(&self) -> f64 {
        self.attribs.length
    }

    /// The longitudinal position of the front of the vehicle in m.
    pub fn pos(&self) -> f64 {
        self.pos
    }

    /// The vehicle's velocity in m/s.
    pub fn vel(&self) -> f64 {
        self.vel
    }

    /// The acceleration applied in the last step in m/s<sup>2</sup>.
    pub fn acc(&self) -> f64 {
        self.acc
    }

    /// The ID of the lane the vehicle is currently travelling on.
    pub fn lane_id(&self) -> Option<LaneId> {
        self.lane
    }

    /// The vehicle directly ahead in the same lane.
    pub fn front_vehicle(&self) -> Option<VehicleId> {
        self.front
    }

    /// The vehicle directly behind in the same lane.
    pub fn rear_vehicle(&self) -> Option<VehicleId> {
        self.rear
    }

    /// The platoon the vehicle belongs to.
    pub fn platoon_id(&self) -> Option<PlatoonId> {
        self.platoon
    }

    /// The states recorded after each step, oldest first.
    pub fn history(&self) -> &[Sample] {
        &self.history
    }

    /// Whether the vehicle has reached its target position.
    pub fn has_arrived(&self) -> bool {
        self.attribs.target_pos.map_or(false, |target| self.pos >= target)
    }

    /// This vehicle as seen by a follower.
    pub(crate) fn as_leader(&self) -> Leader {
        Leader {
            pos: self.pos,
            vel: self.vel,
            length: self.attribs.length,
        }
    }

    /// Describes the vehicle as it would behave on the given lane.
    pub(crate) fn agent(&self, lane: &Lane) -> Agent {
        Agent {
            idm: self.attribs.idm(lane.lane_type()),
            pos: self.pos,
            vel: self.vel,
            length: self.attribs.length,
            dead_end: lane
                .dead_end()
                .map(|end| (end, self.attribs.reaction_time)),
        }
    }

    /// The plain car following acceleration against `leader` on `lane`,
    /// including any dead end of the lane.
    pub(crate) fn car_following(&self, lane: &Lane, leader: Option<&Vehicle>) -> Result<f64, Collision> {
        let acc = self
            .attribs
            .idm(lane.lane_type())
            .acceleration(self.vel, self.pos, leader.map(Vehicle::as_leader))?;
        Ok(f64::min(acc, self.dead_end_acceleration(lane)))
    }

    /// The acceleration imposed by the dead end of the lane, or infinity.
    pub(crate) fn dead_end_acceleration(&self, lane: &Lane) -> f64 {
        match lane.dead_end() {
            Some(end) => self.attribs.idm(lane.lane_type()).stop_before(
                self.vel,
                self.pos,
                end,
                self.attribs.reaction_time,
            ),
            None => f64::INFINITY,
        }
    }

    /// Evaluates the MOBIL incentive of moving from `here` to `there`,
    /// given the neighbours in each lane. The vehicle is not modified.
    pub fn lane_change_incentive(
        &self,
        here: &Lane,
        there: &Lane,
        current: &Surroundings,
        target: &Surroundings,
        brake_threshold: f64,
    ) -> Evaluation {
        lane_change::evaluate(
            &self.agent(here),
            &self.agent(there),
            current,
            target,
            self.attribs.politeness,
            brake_threshold,
        )
    }

    /// Clamps an acceleration to the vehicle's limits.
    pub fn bound_acc(&self, acc: f64) -> f64 {
        acc.clamp(-self.attribs.comf_dec, self.attribs.max_acc)
    }

    /// Integrates the vehicle's velocity and position, without modifying the vehicle.
    ///
    /// # Parameters
    /// * `acc` - The acceleration, which is clamped to the vehicle's limits
    /// * `dt` - The time step in seconds
    /// * `max_vel` - The speed limit of the lane in m/s
    pub(crate) fn advance(&self, acc: f64, dt: f64, max_vel: f64) -> Sample {
        let acc = self.bound_acc(acc);
        let (pos, vel) = dynamics::integrate(self.pos, self.vel, acc, dt, max_vel);
        Sample { pos, vel, acc }
    }

    /// Moves the vehicle to a state computed by [Self::advance] and records it.
    pub(crate) fn commit(&mut self, next: Sample) {
        self.pos = next.pos;
        self.vel = next.vel;
        self.acc = next.acc;
        self.history.push(next);
    }

    /// Detaches the vehicle from its lane.
    pub(crate) fn clear_links(&mut self) {
        self.lane = None;
        self.front = None;
        self.rear = None;
    }
}
