use crate::config::{CollisionPolicy, SimulationConfig};
use crate::lane::{Direction, Lane, LaneAttributes, Neighbours};
use crate::platoon::{IdmFollowing, Platoon, PlatoonController};
use crate::vehicle::lane_change::{self, is_safe};
use crate::vehicle::{
    cooperative, Agent, Collision, CooperativeParams, Evaluation, Leader, Sample, Surroundings,
    Vehicle, VehicleAttributes, VehicleKind, COLLISION_GAP,
};
use crate::{
    Error, LaneId, LaneSet, PlatoonId, PlatoonSet, Result, VehicleId, VehicleSet,
};
use itertools::Itertools;
use log::{debug, info, warn};
use slotmap::SecondaryMap;
use smallvec::SmallVec;
use std::iter::successors;

#[cfg(feature = "serde")]
use serde::Serialize;

/// A traffic simulation.
pub struct Simulation {
    /// The lanes of the road.
    lanes: LaneSet,
    /// The vehicles being simulated.
    vehicles: VehicleSet,
    /// The platoons of connected vehicles.
    platoons: PlatoonSet,
    /// Simulation wide settings.
    config: SimulationConfig,
    /// Computes the accelerations of platoon followers.
    controller: Box<dyn PlatoonController>,
    /// Lane changes requested by the driver which have not happened yet.
    requests: Vec<(VehicleId, Direction)>,
    /// The current frame of simulation.
    frame: usize,
}

/// What happened during a call to [Simulation::step].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepReport {
    /// The number of lane changes executed.
    pub lane_changes: usize,
    /// The vehicles which left the road past the end of their lane or at their target.
    pub exited: Vec<VehicleId>,
    /// The vehicles removed after colliding with their leader.
    pub collisions_removed: Vec<VehicleId>,
}

/// The state of a vehicle after a step.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct VehicleRecord {
    pub id: VehicleId,
    pub lane: LaneId,
    pub pos: f64,
    pub vel: f64,
    pub acc: f64,
    /// The net gap to the vehicle ahead, in m.
    pub gap: Option<f64>,
}

/// The law a vehicle's acceleration follows.
enum AccelerationLaw<'a> {
    /// Plain IDM car following.
    HumanDriven,
    /// Blended IDM against several leaders.
    AutonomousSolo(&'a CooperativeParams),
    /// Governed by the platoon controller, or car following for the leader.
    AutonomousPlatooned(&'a Platoon),
}

/// A lane change decided in the evaluation phase.
#[derive(Clone, Copy, Debug)]
struct LaneChangeIntent {
    vehicle: VehicleId,
    pos: f64,
    from: LaneId,
    to: LaneId,
    /// The vehicle's neighbours on the target lane at the start of the step.
    target: Neighbours,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

impl Simulation {
    /// Creates a new simulation.
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            lanes: LaneSet::with_key(),
            vehicles: VehicleSet::with_key(),
            platoons: PlatoonSet::with_key(),
            config,
            controller: Box::new(IdmFollowing),
            requests: vec![],
            frame: 0,
        }
    }

    /// Gets the simulation settings.
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Replaces the controller used by platoon followers.
    pub fn set_platoon_controller(&mut self, controller: impl PlatoonController + 'static) {
        self.controller = Box::new(controller);
    }

    /// Adds a lane to the road.
    pub fn add_lane(&mut self, attributes: &LaneAttributes) -> LaneId {
        self.lanes.insert_with_key(|id| Lane::new(id, attributes))
    }

    /// Specifies that `left` lies directly to the left of `right`.
    pub fn set_adjacent(&mut self, left: LaneId, right: LaneId) -> Result<()> {
        if left == right {
            return Err(Error::SameLane(left));
        }
        let l = self.lanes.get(left).ok_or(Error::UnknownLane(left))?;
        let r = self.lanes.get(right).ok_or(Error::UnknownLane(right))?;
        let taken = l.right.map_or(false, |id| id != right) || r.left.map_or(false, |id| id != left);
        if taken {
            return Err(Error::AdjacencyConflict { left, right });
        }
        self.lanes[left].right = Some(right);
        self.lanes[right].left = Some(left);
        Ok(())
    }

    /// Whether a vehicle with the given attributes could be placed on the lane
    /// at `pos` without anyone having to brake harder than comfortable.
    pub fn can_insert(&self, lane_id: LaneId, attributes: &VehicleAttributes, pos: f64, vel: f64) -> bool {
        let Some(lane) = self.lanes.get(lane_id) else {
            return false;
        };
        if !lane.extent().contains(pos) {
            return false;
        }
        let neighbours = lane.neighbours_at(&self.vehicles, pos);

        if let Some(front) = neighbours.front {
            let leader = self.vehicles[front].as_leader();
            if leader.gap_from(pos) < attributes.jam_distance {
                return false;
            }
            match attributes.idm(lane.lane_type()).acceleration(vel, pos, Some(leader)) {
                Ok(acc) if acc >= -attributes.comf_dec => {}
                _ => return false,
            }
        }

        if let Some(rear) = neighbours.rear {
            let rear = &self.vehicles[rear];
            let leader = Leader {
                pos,
                vel,
                length: attributes.length,
            };
            if leader.gap_from(rear.pos()) < rear.attributes().jam_distance {
                return false;
            }
            let idm = rear.attributes().idm(lane.lane_type());
            match idm.acceleration(rear.vel(), rear.pos(), Some(leader)) {
                Ok(acc) if acc >= -idm.comf_dec => {}
                _ => return false,
            }
        }
        true
    }

    /// Adds a vehicle to the lane at the given position.
    ///
    /// The velocity is capped at the lane's speed limit.
    pub fn add_vehicle(
        &mut self,
        attributes: &VehicleAttributes,
        lane: LaneId,
        pos: f64,
        vel: f64,
    ) -> Result<VehicleId> {
        attributes.validate()?;
        let lane_ref = self.lanes.get(lane).ok_or(Error::UnknownLane(lane))?;
        if !lane_ref.extent().contains(pos) {
            return Err(Error::OutsideLane { lane, pos });
        }
        if !(vel.is_finite() && vel >= 0.0) {
            return Err(Error::InvalidAttributes(format!(
                "initial velocity must not be negative, got {vel}"
            )));
        }
        let vel = vel.min(lane_ref.max_speed());

        let vehicle_id = self
            .vehicles
            .insert_with_key(|id| Vehicle::new(id, attributes, pos, vel));
        if let Err(err) = self.lanes[lane].insert_by_position(&mut self.vehicles, vehicle_id) {
            self.vehicles.remove(vehicle_id);
            return Err(err);
        }
        debug!("added vehicle {:?} on lane {:?} at {:.1} m", vehicle_id, lane, pos);
        Ok(vehicle_id)
    }

    /// Removes a vehicle from the simulation.
    ///
    /// A platoon leader hands its followers over to a new platoon.
    pub fn remove_vehicle(&mut self, id: VehicleId) -> Result<Vehicle> {
        let vehicle = self.vehicles.get(id).ok_or(Error::UnknownVehicle(id))?;
        let (lane, platoon) = (vehicle.lane, vehicle.platoon);
        if let Some(platoon_id) = platoon {
            self.leave_platoon(platoon_id, id)?;
        }
        if let Some(lane_id) = lane {
            self.lanes[lane_id].remove(&mut self.vehicles, id)?;
        }
        self.requests.retain(|(vehicle, _)| *vehicle != id);
        self.vehicles.remove(id).ok_or(Error::UnknownVehicle(id))
    }

    /// Moves a vehicle to another lane, directly behind `front` or at the head
    /// of the lane if `front` is `None`. Nothing changes if the move is invalid.
    pub fn move_to_lane(&mut self, id: VehicleId, lane: LaneId, front: Option<VehicleId>) -> Result<()> {
        let vehicle = self.vehicles.get(id).ok_or(Error::UnknownVehicle(id))?;
        let from = vehicle.lane.ok_or(Error::Detached(id))?;
        if from == lane {
            return Err(Error::SameLane(lane));
        }
        if vehicle.platoon.is_some() {
            return Err(Error::PlatoonMember(id));
        }
        let target = self.lanes.get(lane).ok_or(Error::UnknownLane(lane))?;
        if !target.extent().contains(vehicle.pos()) {
            return Err(Error::OutsideLane {
                lane,
                pos: vehicle.pos(),
            });
        }
        target.slot_behind(&self.vehicles, front, id)?;
        self.lanes[from].remove(&mut self.vehicles, id)?;
        self.lanes[lane].insert_behind(&mut self.vehicles, front, id)
    }

    /// Asks a vehicle to change lanes in the given direction as soon as it is safe,
    /// whatever the incentive.
    pub fn request_lane_change(&mut self, id: VehicleId, direction: Direction) -> Result<()> {
        let vehicle = self.vehicles.get(id).ok_or(Error::UnknownVehicle(id))?;
        if vehicle.platoon.is_some() {
            return Err(Error::PlatoonMember(id));
        }
        let lane = vehicle.lane.ok_or(Error::Detached(id))?;
        if self.lanes[lane].adjacent(direction).is_none() {
            return Err(Error::NoAdjacentLane { lane, direction });
        }
        self.requests.retain(|(vehicle, _)| *vehicle != id);
        self.requests.push((id, direction));
        Ok(())
    }

    /// The nearest vehicles ahead of and behind a vehicle on the adjacent lane.
    pub fn neighbours(&self, id: VehicleId, direction: Direction) -> Result<Neighbours> {
        let vehicle = self.vehicles.get(id).ok_or(Error::UnknownVehicle(id))?;
        let lane = vehicle.lane.ok_or(Error::Detached(id))?;
        let other = self.lanes[lane]
            .adjacent(direction)
            .ok_or(Error::NoAdjacentLane { lane, direction })?;
        Ok(self.lanes[other].neighbours_at(&self.vehicles, vehicle.pos()))
    }

    /// Creates a platoon led by the given vehicle.
    pub fn create_platoon(&mut self, leader: VehicleId, max_size: usize) -> Result<PlatoonId> {
        let vehicle = self.vehicles.get(leader).ok_or(Error::UnknownVehicle(leader))?;
        if !vehicle.is_connected() {
            return Err(Error::NotConnected(leader));
        }
        if let Some(platoon) = vehicle.platoon {
            return Err(Error::AlreadyInPlatoon {
                vehicle: leader,
                platoon,
            });
        }
        if max_size == 0 {
            return Err(Error::InvalidAttributes("platoon size must be positive".into()));
        }
        let platoon_id = self
            .platoons
            .insert_with_key(|id| Platoon::new(id, leader, max_size));
        self.vehicles[leader].platoon = Some(platoon_id);
        self.requests.retain(|(vehicle, _)| *vehicle != leader);
        info!("platoon {:?} formed behind {:?}", platoon_id, leader);
        Ok(platoon_id)
    }

    /// Adds the vehicle directly behind the platoon to its back.
    pub fn add_to_platoon(&mut self, platoon: PlatoonId, id: VehicleId) -> Result<()> {
        if !self.vehicles.contains_key(id) {
            return Err(Error::UnknownVehicle(id));
        }
        self.platoons
            .get_mut(platoon)
            .ok_or(Error::UnknownPlatoon(platoon))?
            .add_vehicle(&mut self.vehicles, id)?;
        self.requests.retain(|(vehicle, _)| *vehicle != id);
        debug!("vehicle {:?} joined platoon {:?}", id, platoon);
        Ok(())
    }

    /// Removes a follower from the platoon.
    ///
    /// Members are consecutive on the lane, so the followers behind a removed
    /// member in the middle form a new platoon.
    pub fn remove_from_platoon(&mut self, platoon: PlatoonId, id: VehicleId) -> Result<()> {
        let source = self.platoons.get(platoon).ok_or(Error::UnknownPlatoon(platoon))?;
        let index = source.position(id).ok_or(Error::NotInPlatoon {
            vehicle: id,
            platoon,
        })?;
        if index == 0 {
            return Err(Error::CannotRemoveLeader(platoon));
        }
        if index + 1 < source.len() {
            self.split_platoon(platoon, index + 1)?;
        }
        self.platoons[platoon].remove_vehicle(&mut self.vehicles, id)?;
        debug!("vehicle {:?} left platoon {:?}", id, platoon);
        Ok(())
    }

    /// Splits the platoon before the member at `index`, which leads the new platoon.
    pub fn split_platoon(&mut self, platoon: PlatoonId, index: usize) -> Result<PlatoonId> {
        let source = self
            .platoons
            .get_mut(platoon)
            .ok_or(Error::UnknownPlatoon(platoon))?;
        let max_size = source.max_size();
        let members = source.split_off(index)?;
        let new_id = self
            .platoons
            .insert_with_key(|id| Platoon::from_members(id, members, max_size));
        for id in self.platoons[new_id].members() {
            self.vehicles[*id].platoon = Some(new_id);
        }
        info!("platoon {:?} split into {:?}", platoon, new_id);
        Ok(new_id)
    }

    /// Appends the `rear` platoon, which must directly follow `front`, to `front`.
    pub fn merge_platoons(&mut self, front: PlatoonId, rear: PlatoonId) -> Result<()> {
        let front_platoon = self.platoons.get(front).ok_or(Error::UnknownPlatoon(front))?;
        let rear_platoon = self.platoons.get(rear).ok_or(Error::UnknownPlatoon(rear))?;
        front_platoon.check_extend(rear_platoon, &self.vehicles)?;
        let rear_platoon = self.platoons.remove(rear).ok_or(Error::UnknownPlatoon(rear))?;
        self.platoons[front].extend(&mut self.vehicles, rear_platoon)?;
        info!("platoon {:?} merged into {:?}", rear, front);
        Ok(())
    }

    /// Releases all members of the platoon and deletes it.
    pub fn dissolve_platoon(&mut self, platoon: PlatoonId) -> Result<Vec<VehicleId>> {
        let mut removed = self
            .platoons
            .remove(platoon)
            .ok_or(Error::UnknownPlatoon(platoon))?;
        info!("platoon {:?} dissolved", platoon);
        Ok(removed.dissolve(&mut self.vehicles))
    }

    /// Takes a vehicle out of its platoon. A leader's followers form a new platoon.
    fn leave_platoon(&mut self, platoon: PlatoonId, id: VehicleId) -> Result<()> {
        let source = self
            .platoons
            .get(platoon)
            .ok_or(Error::UnknownPlatoon(platoon))?;
        let (leader, len) = (source.leader(), source.len());
        if leader != Some(id) {
            return self.remove_from_platoon(platoon, id);
        }
        if len > 1 {
            self.split_platoon(platoon, 1)?;
        }
        self.dissolve_platoon(platoon)?;
        Ok(())
    }

    /// Advances the simulation by `dt` seconds.
    ///
    /// Lane changes are decided against the state at the start of the step and
    /// committed together, then every vehicle is moved using accelerations
    /// computed against the new lane assignment.
    pub fn step(&mut self, dt: f64) -> Result<StepReport> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(Error::InvalidTimeStep(dt));
        }
        let intents = self.plan_lane_changes();
        let requests = self.requests.clone();
        let changes = self.commit_lane_changes(intents)?;
        let collisions_removed = match self.integrate(dt) {
            Ok(removed) => removed,
            Err(err @ Error::Collision { .. }) => {
                // Nothing has moved yet, so the step can be undone
                self.revert_lane_changes(&changes)?;
                self.requests = requests;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let exited = self.remove_exited()?;
        self.frame += 1;

        debug_assert!(self.lanes.values().all(|lane| lane.is_consistent(&self.vehicles)));
        Ok(StepReport {
            lane_changes: changes.len(),
            exited,
            collisions_removed,
        })
    }

    /// Gets the current simulation frame index.
    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Returns an iterator over all the lanes in the simulation.
    pub fn iter_lanes(&self) -> impl Iterator<Item = &Lane> {
        self.lanes.values()
    }

    /// Returns an iterator over all the vehicles in the simulation.
    pub fn iter_vehicles(&self) -> impl Iterator<Item = &Vehicle> {
        self.vehicles.values()
    }

    /// Returns an iterator over all the platoons in the simulation.
    pub fn iter_platoons(&self) -> impl Iterator<Item = &Platoon> {
        self.platoons.values()
    }

    /// Gets a reference to the vehicle with the given ID.
    pub fn get_vehicle(&self, vehicle_id: VehicleId) -> Option<&Vehicle> {
        self.vehicles.get(vehicle_id)
    }

    /// Gets a reference to the lane with the given ID.
    pub fn get_lane(&self, lane_id: LaneId) -> Option<&Lane> {
        self.lanes.get(lane_id)
    }

    /// Gets a reference to the platoon with the given ID.
    pub fn get_platoon(&self, platoon_id: PlatoonId) -> Option<&Platoon> {
        self.platoons.get(platoon_id)
    }

    /// The current state of every vehicle, lane by lane from front to back.
    pub fn records(&self) -> Vec<VehicleRecord> {
        self.lanes
            .values()
            .flat_map(|lane| {
                lane.vehicles().iter().map(move |id| {
                    let vehicle = &self.vehicles[*id];
                    VehicleRecord {
                        id: *id,
                        lane: lane.id(),
                        pos: vehicle.pos(),
                        vel: vehicle.vel(),
                        acc: vehicle.acc(),
                        gap: vehicle
                            .front
                            .map(|front| self.vehicles[front].as_leader().gap_from(vehicle.pos())),
                    }
                })
            })
            .collect()
    }

    /// The acceleration the vehicle would apply if the simulation stepped now,
    /// before clamping to its limits.
    pub fn vehicle_acceleration(&self, id: VehicleId) -> Result<f64> {
        let vehicle = self.vehicles.get(id).ok_or(Error::UnknownVehicle(id))?;
        let lane = vehicle.lane.ok_or(Error::Detached(id))?;
        self.acceleration(vehicle, &self.lanes[lane])
            .map_err(|Collision { gap }| Error::Collision { vehicle: id, gap })
    }

    /// Selects the acceleration law of a vehicle.
    fn law<'a>(&'a self, vehicle: &'a Vehicle) -> AccelerationLaw<'a> {
        let platoon = vehicle.platoon.and_then(|id| self.platoons.get(id));
        match (&vehicle.attributes().kind, platoon) {
            (VehicleKind::HumanDriven, _) => AccelerationLaw::HumanDriven,
            (VehicleKind::Connected(_), Some(platoon)) => AccelerationLaw::AutonomousPlatooned(platoon),
            (VehicleKind::Connected(params), None) => AccelerationLaw::AutonomousSolo(params),
        }
    }

    fn acceleration(&self, vehicle: &Vehicle, lane: &Lane) -> std::result::Result<f64, Collision> {
        let leader = vehicle.front.map(|id| &self.vehicles[id]);
        match self.law(vehicle) {
            AccelerationLaw::HumanDriven => vehicle.car_following(lane, leader),
            AccelerationLaw::AutonomousSolo(params) => {
                let leaders = successors(vehicle.front, |id| self.vehicles[*id].front)
                    .take(params.horizon())
                    .map(|id| self.vehicles[id].as_leader())
                    .collect::<SmallVec<[Leader; 4]>>();
                let idm = vehicle.attributes().idm(lane.lane_type());
                let acc = cooperative::blended_acceleration(&idm, vehicle.vel(), vehicle.pos(), &leaders, params)?;
                Ok(f64::min(acc, vehicle.dead_end_acceleration(lane)))
            }
            AccelerationLaw::AutonomousPlatooned(platoon) => {
                // Anything between the vehicle and its predecessor is followed instead
                let predecessor = match platoon.predecessor(vehicle.id()) {
                    Some(predecessor) if vehicle.front == Some(predecessor) => predecessor,
                    _ => return vehicle.car_following(lane, leader),
                };
                let head = platoon.leader().unwrap_or(predecessor);
                let acc = self.controller.follower_acceleration(
                    &vehicle.agent(lane),
                    &self.vehicles[predecessor].agent(lane),
                    &self.vehicles[head].agent(lane),
                )?;
                Ok(f64::min(acc, vehicle.dead_end_acceleration(lane)))
            }
        }
    }

    /// Describes the given neighbours as they behave on `lane`.
    fn surroundings(&self, lane: &Lane, neighbours: Neighbours) -> Surroundings {
        Surroundings {
            front: neighbours.front.map(|id| self.vehicles[id].agent(lane)),
            rear: neighbours.rear.map(|id| self.vehicles[id].agent(lane)),
        }
    }

    /// Decides which vehicles change lanes, without modifying anything.
    fn plan_lane_changes(&self) -> Vec<LaneChangeIntent> {
        let mut intents = vec![];
        for lane in self.lanes.values() {
            let sides = lane
                .adjacent_lanes()
                .into_iter()
                .map(|(dir, id)| {
                    let other = &self.lanes[id];
                    (dir, other, lane.project(other, &self.vehicles))
                })
                .collect::<SmallVec<[_; 2]>>();
            if sides.is_empty() {
                continue;
            }

            for (idx, vehicle_id) in lane.vehicles().iter().enumerate() {
                let vehicle = &self.vehicles[*vehicle_id];
                if vehicle.platoon.is_some() {
                    continue;
                }
                let current = self.surroundings(
                    lane,
                    Neighbours {
                        front: vehicle.front,
                        rear: vehicle.rear,
                    },
                );
                let evaluate = |dir: Direction| -> Option<Evaluation> {
                    let (_, other, projection) = sides
                        .iter()
                        .find(|(d, other, _)| *d == dir && other.extent().contains(vehicle.pos()))?;
                    let target = self.surroundings(other, projection[idx]);
                    Some(vehicle.lane_change_incentive(
                        lane,
                        other,
                        &current,
                        &target,
                        self.config.brake_threshold,
                    ))
                };

                let requested = self
                    .requests
                    .iter()
                    .find(|(id, _)| id == vehicle_id)
                    .map(|(_, dir)| *dir);
                // A requested change waits until it is safe and the target lane exists here
                let choice = match requested {
                    Some(dir) => evaluate(dir).filter(|e| e.safe).map(|_| dir),
                    None => lane_change::choose(
                        evaluate(Direction::Left),
                        evaluate(Direction::Right),
                        vehicle.attributes().lc_threshold,
                    ),
                };

                if let Some(dir) = choice {
                    if let Some((_, other, projection)) = sides.iter().find(|(d, ..)| *d == dir) {
                        intents.push(LaneChangeIntent {
                            vehicle: *vehicle_id,
                            pos: vehicle.pos(),
                            from: lane.id(),
                            to: other.id(),
                            target: projection[idx],
                        });
                    }
                }
            }
        }
        intents
    }

    /// Resolves conflicting intents and moves the accepted vehicles.
    ///
    /// Vehicles heading for the same gap are admitted front to back, each one
    /// only if it can safely follow the one admitted before it and the vehicle
    /// behind the gap can safely follow it.
    fn commit_lane_changes(&mut self, mut intents: Vec<LaneChangeIntent>) -> Result<Vec<LaneChangeIntent>> {
        intents.sort_by(|a, b| {
            (a.to, a.target.front, a.target.rear)
                .cmp(&(b.to, b.target.front, b.target.rear))
                .then(b.pos.total_cmp(&a.pos))
                .then(a.vehicle.cmp(&b.vehicle))
        });

        let mut accepted = vec![];
        let groups = intents
            .into_iter()
            .group_by(|intent| (intent.to, intent.target.front, intent.target.rear));
        for (_, group) in &groups {
            accepted.extend(self.admit(group.collect()));
        }

        for intent in &accepted {
            let index = self.lanes[intent.to].slot_by_position(&self.vehicles, intent.vehicle)?;
            self.lanes[intent.from].remove(&mut self.vehicles, intent.vehicle)?;
            self.lanes[intent.to].insert(&mut self.vehicles, index, intent.vehicle)?;
            self.requests.retain(|(id, _)| *id != intent.vehicle);
            debug!(
                "vehicle {:?} changed from lane {:?} to {:?} at {:.1} m",
                intent.vehicle, intent.from, intent.to, intent.pos
            );
        }
        Ok(accepted)
    }

    /// Puts the vehicles moved by [Self::commit_lane_changes] back on their
    /// previous lanes. Positions must not have changed since.
    fn revert_lane_changes(&mut self, changes: &[LaneChangeIntent]) -> Result<()> {
        for change in changes {
            self.lanes[change.to].remove(&mut self.vehicles, change.vehicle)?;
        }
        for change in changes {
            self.lanes[change.from].insert_by_position(&mut self.vehicles, change.vehicle)?;
        }
        Ok(())
    }

    /// Admits the movers heading for one gap, which are sorted front to back.
    fn admit(&self, group: Vec<LaneChangeIntent>) -> Vec<LaneChangeIntent> {
        let Some(first) = group.first() else {
            return group;
        };
        let lane = &self.lanes[first.to];
        let brake = self.config.brake_threshold;

        let platoon_of = |id: Option<VehicleId>| id.and_then(|id| self.vehicles[id].platoon);
        let front_platoon = platoon_of(first.target.front);
        if front_platoon.is_some() && front_platoon == platoon_of(first.target.rear) {
            debug!("lane change into platoon {:?} rejected", front_platoon);
            return vec![];
        }

        let rear = first.target.rear.map(|id| self.vehicles[id].agent(lane));
        let mut ahead: Option<Agent> = None;
        let mut accepted = vec![];
        for intent in group {
            let mover = self.vehicles[intent.vehicle].agent(lane);
            let follows_safely = |follower: &Agent, leader: &Agent| {
                matches!(follower.following(Some(leader)), Ok(acc) if is_safe(acc, brake))
            };
            let behind_previous = ahead.as_ref().map_or(true, |prev| follows_safely(&mover, prev));
            let ahead_of_rear = rear.as_ref().map_or(true, |rear| follows_safely(rear, &mover));
            if behind_previous && ahead_of_rear {
                ahead = Some(mover);
                accepted.push(intent);
            } else {
                debug!("lane change of vehicle {:?} rejected", intent.vehicle);
            }
        }
        accepted
    }

    /// Computes every vehicle's acceleration and integrates its motion.
    /// Returns the vehicles removed after a collision.
    ///
    /// Under [CollisionPolicy::Halt] no vehicle is modified if any would collide.
    fn integrate(&mut self, dt: f64) -> Result<Vec<VehicleId>> {
        let mut removed = vec![];
        let motion = loop {
            let (motion, collided) = self.motion(dt);
            if collided.is_empty() {
                break motion;
            }
            match self.config.collision_policy {
                CollisionPolicy::Halt => {
                    let (vehicle, gap) = collided[0];
                    return Err(Error::Collision { vehicle, gap });
                }
                CollisionPolicy::RemoveVehicle => {
                    for (id, gap) in collided {
                        warn!("vehicle {:?} collided ({:.3} m gap) and was removed", id, gap);
                        self.remove_vehicle(id)?;
                        removed.push(id);
                    }
                }
            }
        };

        for (id, next) in motion {
            self.vehicles[id].commit(next);
        }
        Ok(removed)
    }

    /// The state every vehicle would reach after `dt` seconds, and the
    /// vehicles which would collide with their leader along the way.
    fn motion(&self, dt: f64) -> (SecondaryMap<VehicleId, Sample>, Vec<(VehicleId, f64)>) {
        let mut motion = SecondaryMap::new();
        let mut collided = vec![];
        for (id, vehicle) in &self.vehicles {
            let Some(lane) = vehicle.lane.map(|lane| &self.lanes[lane]) else {
                continue;
            };
            match self.acceleration(vehicle, lane) {
                Ok(acc) => {
                    motion.insert(id, vehicle.advance(acc, dt, lane.max_speed()));
                }
                Err(Collision { gap }) => collided.push((id, gap)),
            }
        }

        // A follower may still close the gap to its leader within the step
        for (id, vehicle) in &self.vehicles {
            let (Some(next), Some(front)) = (motion.get(id), vehicle.front) else {
                continue;
            };
            let leader = &self.vehicles[front];
            let leader_pos = motion.get(front).map_or(leader.pos(), |s| s.pos);
            let gap = leader_pos - leader.length() - next.pos;
            if gap < COLLISION_GAP {
                collided.push((id, gap));
            }
        }
        (motion, collided)
    }

    /// Removes the vehicles which have driven past the end of their lane
    /// or reached their target position.
    fn remove_exited(&mut self) -> Result<Vec<VehicleId>> {
        let exited = self
            .vehicles
            .iter()
            .filter(|(_, vehicle)| {
                let past_end = vehicle
                    .lane
                    .map_or(false, |lane| vehicle.pos() > self.lanes[lane].extent().max);
                past_end || vehicle.has_arrived()
            })
            .map(|(id, _)| id)
            .collect::<Vec<_>>();
        for id in &exited {
            self.remove_vehicle(*id)?;
        }
        Ok(exited)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::LinearController;
    use assert_approx_eq::assert_approx_eq;

    fn road(lanes: usize) -> (Simulation, Vec<LaneId>) {
        let mut sim = Simulation::default();
        let ids = (0..lanes)
            .map(|_| sim.add_lane(&LaneAttributes::main(0.0, 5000.0)))
            .collect::<Vec<_>>();
        for (left, right) in ids.iter().tuple_windows() {
            sim.set_adjacent(*left, *right).unwrap();
        }
        (sim, ids)
    }

    #[test]
    fn adjacency_is_symmetric_and_exclusive() {
        let (mut sim, lanes) = road(3);
        assert_eq!(sim.get_lane(lanes[0]).unwrap().right_lane(), Some(lanes[1]));
        assert_eq!(sim.get_lane(lanes[1]).unwrap().left_lane(), Some(lanes[0]));
        assert!(matches!(
            sim.set_adjacent(lanes[0], lanes[2]),
            Err(Error::AdjacencyConflict { .. })
        ));
        assert!(sim.set_adjacent(lanes[0], lanes[1]).is_ok());
        assert!(matches!(sim.set_adjacent(lanes[1], lanes[1]), Err(Error::SameLane(_))));
    }

    #[test]
    fn add_vehicle_validates_input() {
        let (mut sim, lanes) = road(1);
        let attribs = VehicleAttributes::human_driven();
        assert!(matches!(
            sim.add_vehicle(&attribs, lanes[0], 6000.0, 10.0),
            Err(Error::OutsideLane { .. })
        ));
        let broken = VehicleAttributes {
            comf_dec: 0.0,
            ..attribs.clone()
        };
        assert!(matches!(
            sim.add_vehicle(&broken, lanes[0], 100.0, 10.0),
            Err(Error::InvalidAttributes(_))
        ));
        sim.add_vehicle(&attribs, lanes[0], 100.0, 10.0).unwrap();
        assert!(matches!(
            sim.add_vehicle(&attribs, lanes[0], 100.0, 10.0),
            Err(Error::OutOfOrder { .. })
        ));
        assert_eq!(sim.iter_vehicles().count(), 1);
    }

    #[test]
    fn can_insert_checks_both_neighbours() {
        let (mut sim, lanes) = road(1);
        let attribs = VehicleAttributes::human_driven();
        sim.add_vehicle(&attribs, lanes[0], 500.0, 20.0).unwrap();
        sim.add_vehicle(&attribs, lanes[0], 200.0, 20.0).unwrap();
        assert!(sim.can_insert(lanes[0], &attribs, 350.0, 20.0));
        assert!(!sim.can_insert(lanes[0], &attribs, 497.0, 20.0));
        assert!(!sim.can_insert(lanes[0], &attribs, 207.0, 20.0));
        assert!(sim.can_insert(lanes[0], &attribs, 50.0, 20.0));
        assert!(!sim.can_insert(lanes[0], &attribs, -1.0, 20.0));
    }

    #[test]
    fn invalid_time_step_is_rejected() {
        let (mut sim, _) = road(1);
        assert!(matches!(sim.step(0.0), Err(Error::InvalidTimeStep(_))));
        assert!(matches!(sim.step(f64::NAN), Err(Error::InvalidTimeStep(_))));
        assert_eq!(sim.frame(), 0);
    }

    #[test]
    fn move_to_lane_is_atomic() {
        let (mut sim, lanes) = road(2);
        let attribs = VehicleAttributes::human_driven();
        let a = sim.add_vehicle(&attribs, lanes[0], 300.0, 20.0).unwrap();
        let b = sim.add_vehicle(&attribs, lanes[1], 400.0, 20.0).unwrap();
        let c = sim.add_vehicle(&attribs, lanes[1], 200.0, 20.0).unwrap();

        // Putting `a` at the head of the other lane would put it ahead of `b`
        assert!(matches!(
            sim.move_to_lane(a, lanes[1], None),
            Err(Error::OutOfOrder { .. })
        ));
        assert_eq!(sim.get_vehicle(a).unwrap().lane_id(), Some(lanes[0]));
        assert!(matches!(sim.move_to_lane(a, lanes[0], None), Err(Error::SameLane(_))));

        sim.move_to_lane(a, lanes[1], Some(b)).unwrap();
        assert_eq!(sim.get_lane(lanes[1]).unwrap().vehicles(), &[b, a, c]);
        assert!(sim.get_lane(lanes[0]).unwrap().is_empty());
        assert!(sim.iter_lanes().all(|lane| lane.is_consistent(&sim.vehicles)));
    }

    #[test]
    fn solo_connected_vehicle_anticipates_braking_ahead() {
        let (mut sim, lanes) = road(1);
        let human = VehicleAttributes::human_driven();
        let connected = VehicleAttributes::connected();
        sim.add_vehicle(&human, lanes[0], 400.0, 0.0).unwrap();
        sim.add_vehicle(&human, lanes[0], 340.0, 20.0).unwrap();
        let follower = sim.add_vehicle(&connected, lanes[0], 300.0, 20.0).unwrap();

        let plain = {
            let vehicle = sim.get_vehicle(follower).unwrap();
            let lane = sim.get_lane(lanes[0]).unwrap();
            let leader = sim.get_vehicle(vehicle.front_vehicle().unwrap());
            vehicle.car_following(lane, leader).unwrap()
        };
        let blended = sim.vehicle_acceleration(follower).unwrap();
        assert_ne!(plain, blended);
    }

    #[test]
    fn platoon_follower_uses_controller() {
        let (mut sim, lanes) = road(1);
        let connected = VehicleAttributes::connected();
        let a = sim.add_vehicle(&connected, lanes[0], 300.0, 20.0).unwrap();
        let b = sim.add_vehicle(&connected, lanes[0], 250.0, 20.0).unwrap();
        let platoon = sim.create_platoon(a, 4).unwrap();
        sim.add_to_platoon(platoon, b).unwrap();

        let ctrl = LinearController::default();
        sim.set_platoon_controller(ctrl);
        let gap = 300.0 - 250.0 - 5.0;
        let expected = ctrl.k_gap * (gap - ctrl.standstill - ctrl.time_gap * 20.0);
        assert_approx_eq!(sim.vehicle_acceleration(b).unwrap(), expected);
    }

    #[test]
    fn platoon_follower_follows_vehicle_cutting_in() {
        let (mut sim, lanes) = road(1);
        let connected = VehicleAttributes::connected();
        let a = sim.add_vehicle(&connected, lanes[0], 400.0, 20.0).unwrap();
        let b = sim.add_vehicle(&connected, lanes[0], 350.0, 20.0).unwrap();
        let platoon = sim.create_platoon(a, 4).unwrap();
        sim.add_to_platoon(platoon, b).unwrap();
        sim.set_platoon_controller(LinearController::default());

        let human = sim
            .add_vehicle(&VehicleAttributes::human_driven(), lanes[0], 375.0, 10.0)
            .unwrap();
        let expected = {
            let vehicle = sim.get_vehicle(b).unwrap();
            let lane = sim.get_lane(lanes[0]).unwrap();
            vehicle.car_following(lane, sim.get_vehicle(human)).unwrap()
        };
        assert_approx_eq!(sim.vehicle_acceleration(b).unwrap(), expected);
    }

    #[test]
    fn removing_leader_keeps_followers_platooned() {
        let (mut sim, lanes) = road(1);
        let connected = VehicleAttributes::connected();
        let ids = [400.0, 350.0, 300.0]
            .iter()
            .map(|pos| sim.add_vehicle(&connected, lanes[0], *pos, 20.0).unwrap())
            .collect::<Vec<_>>();
        let platoon = sim.create_platoon(ids[0], 3).unwrap();
        sim.add_to_platoon(platoon, ids[1]).unwrap();
        sim.add_to_platoon(platoon, ids[2]).unwrap();

        sim.remove_vehicle(ids[0]).unwrap();
        assert!(sim.get_platoon(platoon).is_none());
        let rest = sim.get_vehicle(ids[1]).unwrap().platoon_id().unwrap();
        assert_eq!(sim.get_platoon(rest).unwrap().members(), &ids[1..]);
        assert_eq!(sim.get_platoon(rest).unwrap().max_size(), 3);
    }

    #[test]
    fn records_report_gaps() {
        let (mut sim, lanes) = road(1);
        let attribs = VehicleAttributes::human_driven();
        let a = sim.add_vehicle(&attribs, lanes[0], 300.0, 20.0).unwrap();
        let b = sim.add_vehicle(&attribs, lanes[0], 250.0, 20.0).unwrap();
        let records = sim.records();
        assert_eq!(records.len(), 2);
        assert_eq!((records[0].id, records[0].gap), (a, None));
        assert_eq!(records[1].id, b);
        assert_approx_eq!(records[1].gap.unwrap(), 45.0);
    }
}
