use crate::util::Interval;
use crate::{Error, LaneId, Result, VehicleId, VehicleSet};
use arrayvec::ArrayVec;
use itertools::Itertools;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A single lane of traffic.
///
/// Vehicles are kept ordered front to back, i.e. by descending position,
/// and their `front`/`rear` links always mirror that order.
#[derive(Clone, Debug)]
pub struct Lane {
    /// The lane ID.
    id: LaneId,
    /// Whether this is a through lane or an on-ramp.
    lane_type: LaneType,
    /// The longitudinal extent of the lane in m.
    extent: Interval<f64>,
    /// Speed limit in m/s.
    max_speed: f64,
    /// Minimum speed in m/s.
    min_speed: f64,
    /// Nominal capacity in veh/h.
    capacity: usize,
    /// The lane to the left.
    pub(crate) left: Option<LaneId>,
    /// The lane to the right.
    pub(crate) right: Option<LaneId>,
    /// The vehicles on the lane, front to back.
    vehicles: Vec<VehicleId>,
}

/// The type of a lane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LaneType {
    /// A through lane. Vehicles leave the simulation past its end.
    Main,
    /// An on-ramp. Its end is a dead end vehicles must merge before.
    Ramp,
}

/// A side of a lane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Direction {
    Left,
    Right,
}

/// The attributes of a lane.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LaneAttributes {
    pub lane_type: LaneType,
    /// The start and end positions in m.
    pub extent: Interval<f64>,
    /// The speed limit in m/s.
    pub max_speed: f64,
    /// The minimum speed in m/s.
    pub min_speed: f64,
    /// Nominal capacity in veh/h.
    pub capacity: usize,
}

/// The nearest vehicles in another lane ahead of and behind a position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Neighbours {
    /// The nearest vehicle with a strictly greater position.
    pub front: Option<VehicleId>,
    /// The nearest vehicle with a lesser or equal position.
    pub rear: Option<VehicleId>,
}

impl LaneAttributes {
    /// A main lane spanning `start` to `end` with the default speed limit of 120 km/h.
    pub fn main(start: f64, end: f64) -> Self {
        Self {
            lane_type: LaneType::Main,
            extent: Interval::new(start, end),
            max_speed: 120.0 / 3.6,
            min_speed: 0.0,
            capacity: 1600,
        }
    }

    /// An on-ramp spanning `start` to `end` with a speed limit of 60 km/h.
    pub fn ramp(start: f64, end: f64) -> Self {
        Self {
            lane_type: LaneType::Ramp,
            max_speed: 60.0 / 3.6,
            ..Self::main(start, end)
        }
    }
}

impl Lane {
    /// Creates a new lane.
    pub(crate) fn new(id: LaneId, attribs: &LaneAttributes) -> Self {
        Self {
            id,
            lane_type: attribs.lane_type,
            extent: attribs.extent,
            max_speed: attribs.max_speed,
            min_speed: attribs.min_speed,
            capacity: attribs.capacity,
            left: None,
            right: None,
            vehicles: vec![],
        }
    }

    /// Gets the lane ID.
    pub fn id(&self) -> LaneId {
        self.id
    }

    /// Gets the lane type.
    pub fn lane_type(&self) -> LaneType {
        self.lane_type
    }

    /// Gets the start and end positions of the lane in m.
    pub fn extent(&self) -> Interval<f64> {
        self.extent
    }

    /// Gets the length of the lane in m.
    pub fn length(&self) -> f64 {
        self.extent.length()
    }

    /// Gets the speed limit in m/s.
    pub fn max_speed(&self) -> f64 {
        self.max_speed
    }

    /// Gets the minimum speed in m/s.
    pub fn min_speed(&self) -> f64 {
        self.min_speed
    }

    /// Gets the nominal capacity in veh/h.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The position vehicles must stop before, if the lane is a dead end.
    pub fn dead_end(&self) -> Option<f64> {
        match self.lane_type {
            LaneType::Ramp => Some(self.extent.max),
            LaneType::Main => None,
        }
    }

    /// The lane to the left.
    pub fn left_lane(&self) -> Option<LaneId> {
        self.left
    }

    /// The lane to the right.
    pub fn right_lane(&self) -> Option<LaneId> {
        self.right
    }

    /// The adjacent lane in the given direction.
    pub fn adjacent(&self, direction: Direction) -> Option<LaneId> {
        match direction {
            Direction::Left => self.left,
            Direction::Right => self.right,
        }
    }

    /// The adjacent lanes which exist, left first.
    pub fn adjacent_lanes(&self) -> ArrayVec<(Direction, LaneId), 2> {
        [Direction::Left, Direction::Right]
            .into_iter()
            .filter_map(|dir| self.adjacent(dir).map(|id| (dir, id)))
            .collect()
    }

    /// The vehicles on the lane, front to back.
    pub fn vehicles(&self) -> &[VehicleId] {
        &self.vehicles
    }

    /// The number of vehicles on the lane.
    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    /// Whether there are no vehicles on the lane.
    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    /// The frontmost vehicle.
    pub fn head(&self) -> Option<VehicleId> {
        self.vehicles.first().copied()
    }

    /// The rearmost vehicle.
    pub fn tail(&self) -> Option<VehicleId> {
        self.vehicles.last().copied()
    }

    /// Whether the vehicle is on this lane.
    pub fn contains(&self, id: VehicleId) -> bool {
        self.vehicles.contains(&id)
    }

    /// The index at which a vehicle at `pos` belongs.
    fn slot_for(&self, vehicles: &VehicleSet, pos: f64) -> usize {
        self.vehicles.partition_point(|id| vehicles[*id].pos() > pos)
    }

    /// Determines the index at which the vehicle would be inserted directly behind `front`,
    /// or at the head of the lane if `front` is `None`, without modifying anything.
    pub(crate) fn slot_behind(
        &self,
        vehicles: &VehicleSet,
        front: Option<VehicleId>,
        id: VehicleId,
    ) -> Result<usize> {
        let index = match front {
            Some(front) => {
                let idx = self
                    .vehicles
                    .iter()
                    .position(|v| *v == front)
                    .ok_or(Error::VehicleNotInLane {
                        vehicle: front,
                        lane: self.id,
                    })?;
                idx + 1
            }
            None => 0,
        };
        self.check_slot(vehicles, index, id)?;
        Ok(index)
    }

    /// Checks that the vehicle can be inserted at `index` without breaking the order.
    fn check_slot(&self, vehicles: &VehicleSet, index: usize, id: VehicleId) -> Result<()> {
        if index > self.vehicles.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.vehicles.len(),
            });
        }
        let pos = vehicles[id].pos();
        let after_front = index == 0 || vehicles[self.vehicles[index - 1]].pos() > pos;
        let before_rear = self
            .vehicles
            .get(index)
            .map_or(true, |rear| vehicles[*rear].pos() < pos);
        if after_front && before_rear && !self.contains(id) {
            Ok(())
        } else {
            Err(Error::OutOfOrder {
                vehicle: id,
                lane: self.id,
                pos,
            })
        }
    }

    /// Inserts the vehicle at the given index and repairs the neighbour links.
    ///
    /// Fails if the index is out of range, or if the vehicle's position does not
    /// lie strictly between those of its new neighbours.
    pub(crate) fn insert(&mut self, vehicles: &mut VehicleSet, index: usize, id: VehicleId) -> Result<()> {
        self.check_slot(vehicles, index, id)?;

        let front = index.checked_sub(1).map(|i| self.vehicles[i]);
        let rear = self.vehicles.get(index).copied();
        if let Some(front) = front {
            vehicles[front].rear = Some(id);
        }
        if let Some(rear) = rear {
            vehicles[rear].front = Some(id);
        }
        let vehicle = &mut vehicles[id];
        vehicle.front = front;
        vehicle.rear = rear;
        vehicle.lane = Some(self.id);
        self.vehicles.insert(index, id);
        Ok(())
    }

    /// Appends the vehicle behind the current rearmost vehicle.
    pub(crate) fn push_back(&mut self, vehicles: &mut VehicleSet, id: VehicleId) -> Result<()> {
        self.insert(vehicles, self.vehicles.len(), id)
    }

    /// Inserts the vehicle directly behind `front`, or at the head if `front` is `None`.
    pub(crate) fn insert_behind(
        &mut self,
        vehicles: &mut VehicleSet,
        front: Option<VehicleId>,
        id: VehicleId,
    ) -> Result<()> {
        let index = self.slot_behind(vehicles, front, id)?;
        self.insert(vehicles, index, id)
    }

    /// Determines the index given by the vehicle's position, without modifying anything.
    pub(crate) fn slot_by_position(&self, vehicles: &VehicleSet, id: VehicleId) -> Result<usize> {
        let index = self.slot_for(vehicles, vehicles[id].pos());
        self.check_slot(vehicles, index, id)?;
        Ok(index)
    }

    /// Inserts the vehicle at the place given by its position.
    pub(crate) fn insert_by_position(&mut self, vehicles: &mut VehicleSet, id: VehicleId) -> Result<usize> {
        // New traffic usually enters behind everyone else
        let behind_tail = self
            .tail()
            .map_or(true, |tail| vehicles[tail].pos() > vehicles[id].pos());
        if behind_tail {
            self.push_back(vehicles, id)?;
            return Ok(self.vehicles.len() - 1);
        }
        let index = self.slot_by_position(vehicles, id)?;
        self.insert(vehicles, index, id)?;
        Ok(index)
    }

    /// Removes the vehicle from the lane, splicing its neighbours together.
    pub(crate) fn remove(&mut self, vehicles: &mut VehicleSet, id: VehicleId) -> Result<usize> {
        let index = self
            .vehicles
            .iter()
            .position(|v| *v == id)
            .ok_or(Error::VehicleNotInLane {
                vehicle: id,
                lane: self.id,
            })?;
        self.vehicles.remove(index);

        let vehicle = &mut vehicles[id];
        let (front, rear) = (vehicle.front, vehicle.rear);
        vehicle.clear_links();
        if let Some(front) = front {
            vehicles[front].rear = rear;
        }
        if let Some(rear) = rear {
            vehicles[rear].front = front;
        }
        Ok(index)
    }

    /// Finds, for each vehicle on this lane in order, the nearest vehicles
    /// on `other` ahead of and behind it.
    ///
    /// Both lanes are sorted, so this is a single merge pass.
    pub fn project(&self, other: &Lane, vehicles: &VehicleSet) -> Vec<Neighbours> {
        let mut idx = 0;
        self.vehicles
            .iter()
            .map(|id| {
                let pos = vehicles[*id].pos();
                idx += other.vehicles[idx..]
                    .iter()
                    .take_while(|v| vehicles[**v].pos() > pos)
                    .count();
                Neighbours {
                    front: idx.checked_sub(1).map(|i| other.vehicles[i]),
                    rear: other.vehicles.get(idx).copied(),
                }
            })
            .collect()
    }

    /// The nearest vehicles on this lane ahead of and behind a position.
    pub fn neighbours_at(&self, vehicles: &VehicleSet, pos: f64) -> Neighbours {
        let idx = self.slot_for(vehicles, pos);
        Neighbours {
            front: idx.checked_sub(1).map(|i| self.vehicles[i]),
            rear: self.vehicles.get(idx).copied(),
        }
    }

    /// Checks that the vehicles are strictly ordered and that their neighbour
    /// links agree with the order.
    pub fn is_consistent(&self, vehicles: &VehicleSet) -> bool {
        let ordered = self
            .vehicles
            .iter()
            .tuple_windows()
            .all(|(a, b)| vehicles[*a].pos() > vehicles[*b].pos());
        let linked = self.vehicles.iter().enumerate().all(|(i, id)| {
            let vehicle = &vehicles[*id];
            vehicle.lane == Some(self.id)
                && vehicle.front == i.checked_sub(1).map(|i| self.vehicles[i])
                && vehicle.rear == self.vehicles.get(i + 1).copied()
        });
        ordered && linked
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vehicle::{Vehicle, VehicleAttributes};
    use crate::LaneSet;

    fn setup(positions: &[f64]) -> (Lane, VehicleSet, Vec<VehicleId>) {
        let mut lanes = LaneSet::with_key();
        let lane_id = lanes.insert_with_key(|id| Lane::new(id, &LaneAttributes::main(0.0, 1000.0)));
        let mut lane = lanes.remove(lane_id).unwrap();
        let mut vehicles = VehicleSet::with_key();
        let attribs = VehicleAttributes::human_driven();
        let ids = positions
            .iter()
            .map(|pos| vehicles.insert_with_key(|id| Vehicle::new(id, &attribs, *pos, 20.0)))
            .collect::<Vec<_>>();
        for id in &ids {
            lane.push_back(&mut vehicles, *id).unwrap();
        }
        (lane, vehicles, ids)
    }

    fn assert_symmetric(lane: &Lane, vehicles: &VehicleSet) {
        assert!(lane.is_consistent(vehicles));
        for id in lane.vehicles() {
            let vehicle = &vehicles[*id];
            if let Some(front) = vehicle.front_vehicle() {
                assert_eq!(vehicles[front].rear_vehicle(), Some(*id));
            }
            if let Some(rear) = vehicle.rear_vehicle() {
                assert_eq!(vehicles[rear].front_vehicle(), Some(*id));
            }
        }
    }

    #[test]
    fn push_back_links_neighbours() {
        let (lane, vehicles, ids) = setup(&[300.0, 200.0, 100.0]);
        assert_symmetric(&lane, &vehicles);
        assert_eq!(lane.head(), Some(ids[0]));
        assert_eq!(lane.tail(), Some(ids[2]));
        assert_eq!(vehicles[ids[0]].front_vehicle(), None);
        assert_eq!(vehicles[ids[2]].rear_vehicle(), None);
    }

    #[test]
    fn push_back_rejects_vehicle_ahead_of_tail() {
        let (mut lane, mut vehicles, _) = setup(&[300.0, 200.0]);
        let attribs = VehicleAttributes::human_driven();
        let id = vehicles.insert_with_key(|id| Vehicle::new(id, &attribs, 250.0, 20.0));
        assert!(matches!(
            lane.push_back(&mut vehicles, id),
            Err(Error::OutOfOrder { .. })
        ));
        assert_eq!(lane.len(), 2);
        assert_eq!(vehicles[id].lane_id(), None);
    }

    #[test]
    fn insert_and_remove_keep_links_symmetric() {
        let (mut lane, mut vehicles, ids) = setup(&[400.0, 300.0, 100.0]);
        let attribs = VehicleAttributes::human_driven();
        let a = vehicles.insert_with_key(|id| Vehicle::new(id, &attribs, 200.0, 20.0));
        let b = vehicles.insert_with_key(|id| Vehicle::new(id, &attribs, 500.0, 20.0));
        let c = vehicles.insert_with_key(|id| Vehicle::new(id, &attribs, 50.0, 20.0));

        lane.insert(&mut vehicles, 2, a).unwrap();
        assert_symmetric(&lane, &vehicles);
        lane.insert_behind(&mut vehicles, None, b).unwrap();
        assert_symmetric(&lane, &vehicles);
        lane.insert_by_position(&mut vehicles, c).unwrap();
        assert_symmetric(&lane, &vehicles);
        assert_eq!(lane.vehicles(), &[b, ids[0], ids[1], a, ids[2], c]);

        lane.remove(&mut vehicles, ids[1]).unwrap();
        assert_symmetric(&lane, &vehicles);
        assert_eq!(vehicles[a].front_vehicle(), Some(ids[0]));
        lane.remove(&mut vehicles, b).unwrap();
        lane.remove(&mut vehicles, c).unwrap();
        assert_symmetric(&lane, &vehicles);
        assert_eq!(vehicles[ids[2]].rear_vehicle(), None);
        assert_eq!(vehicles[ids[1]].lane_id(), None);
        assert_eq!(vehicles[ids[1]].front_vehicle(), None);
    }

    #[test]
    fn removing_sole_vehicle_clears_links() {
        let (mut lane, mut vehicles, ids) = setup(&[100.0]);
        lane.remove(&mut vehicles, ids[0]).unwrap();
        assert!(lane.is_empty());
        assert_eq!(vehicles[ids[0]].front_vehicle(), None);
        assert_eq!(vehicles[ids[0]].rear_vehicle(), None);
    }

    #[test]
    fn invalid_operations_fail() {
        let (mut lane, mut vehicles, ids) = setup(&[300.0, 200.0]);
        let attribs = VehicleAttributes::human_driven();
        let stray = vehicles.insert_with_key(|id| Vehicle::new(id, &attribs, 100.0, 20.0));
        assert!(matches!(
            lane.remove(&mut vehicles, stray),
            Err(Error::VehicleNotInLane { .. })
        ));
        assert!(matches!(
            lane.insert(&mut vehicles, 5, stray),
            Err(Error::IndexOutOfRange { index: 5, len: 2 })
        ));
        assert!(matches!(
            lane.insert(&mut vehicles, 0, stray),
            Err(Error::OutOfOrder { .. })
        ));
        assert!(matches!(
            lane.insert(&mut vehicles, 2, ids[0]),
            Err(Error::OutOfOrder { .. })
        ));
        assert_symmetric(&lane, &vehicles);
    }

    #[test]
    fn projection_finds_nearest_neighbours() {
        let (lane, mut vehicles, ids) = setup(&[500.0, 300.0, 100.0]);
        let mut lanes = LaneSet::with_key();
        let other_id = lanes.insert_with_key(|id| Lane::new(id, &LaneAttributes::main(0.0, 1000.0)));
        let mut other = lanes.remove(other_id).unwrap();
        let attribs = VehicleAttributes::human_driven();
        let others = [600.0, 300.0, 250.0]
            .iter()
            .map(|pos| vehicles.insert_with_key(|id| Vehicle::new(id, &attribs, *pos, 20.0)))
            .collect::<Vec<_>>();
        for id in &others {
            other.push_back(&mut vehicles, *id).unwrap();
        }

        let projection = lane.project(&other, &vehicles);
        assert_eq!(
            projection,
            vec![
                Neighbours {
                    front: Some(others[0]),
                    rear: Some(others[1]),
                },
                Neighbours {
                    front: Some(others[0]),
                    rear: Some(others[1]),
                },
                Neighbours {
                    front: Some(others[2]),
                    rear: None,
                },
            ]
        );
        let back = other.project(&lane, &vehicles);
        assert_eq!(back[0], Neighbours { front: None, rear: Some(ids[0]) });
        assert_eq!(back[2], Neighbours { front: Some(ids[1]), rear: Some(ids[2]) });
        assert_eq!(other.neighbours_at(&vehicles, 300.0), projection[1]);
    }
}
