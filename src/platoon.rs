use crate::vehicle::{Agent, Collision, COLLISION_GAP};
use crate::{Error, PlatoonId, Result, VehicleId, VehicleSet};

/// The minimum net gap between a vehicle and the platoon it joins, in m.
pub const MIN_PLATOON_GAP: f64 = 10.0; // m

/// An ordered group of connected vehicles on one lane which move as a unit.
///
/// The first member is the leader. Members are consecutive vehicles on the lane.
#[derive(Clone, Debug)]
pub struct Platoon {
    /// The platoon ID.
    id: PlatoonId,
    /// The members, leader first.
    members: Vec<VehicleId>,
    /// The maximum number of members.
    max_size: usize,
}

/// Computes the accelerations of the followers in a platoon.
pub trait PlatoonController {
    /// The acceleration of `follower`, which drives directly behind `predecessor`
    /// in a platoon led by `leader`.
    fn follower_acceleration(
        &self,
        follower: &Agent,
        predecessor: &Agent,
        leader: &Agent,
    ) -> std::result::Result<f64, Collision>;
}

/// Followers use their own car following model against the member ahead.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdmFollowing;

/// A linear constant time gap controller.
///
/// `acc = k_gap * (gap - standstill - time_gap * vel) + k_vel * (pred_vel - vel)`
#[derive(Clone, Copy, Debug)]
pub struct LinearController {
    /// The time gap kept to the predecessor, in s.
    pub time_gap: f64,
    /// The net gap kept at standstill, in m.
    pub standstill: f64,
    /// The gain on the spacing error, in 1/s<sup>2</sup>.
    pub k_gap: f64,
    /// The gain on the velocity difference, in 1/s.
    pub k_vel: f64,
}

impl Default for LinearController {
    fn default() -> Self {
        Self {
            time_gap: 0.6,
            standstill: 2.0,
            k_gap: 0.45,
            k_vel: 0.25,
        }
    }
}

impl PlatoonController for IdmFollowing {
    fn follower_acceleration(
        &self,
        follower: &Agent,
        predecessor: &Agent,
        _leader: &Agent,
    ) -> std::result::Result<f64, Collision> {
        follower.following(Some(predecessor))
    }
}

impl PlatoonController for LinearController {
    fn follower_acceleration(
        &self,
        follower: &Agent,
        predecessor: &Agent,
        _leader: &Agent,
    ) -> std::result::Result<f64, Collision> {
        let gap = predecessor.as_leader().gap_from(follower.pos);
        if gap < COLLISION_GAP {
            return Err(Collision { gap });
        }
        let spacing_err = gap - self.standstill - self.time_gap * follower.vel;
        Ok(self.k_gap * spacing_err + self.k_vel * (predecessor.vel - follower.vel))
    }
}

impl Platoon {
    /// Creates a platoon led by the given vehicle.
    pub(crate) fn new(id: PlatoonId, leader: VehicleId, max_size: usize) -> Self {
        Self::from_members(id, vec![leader], max_size)
    }

    /// Creates a platoon from existing members.
    pub(crate) fn from_members(id: PlatoonId, members: Vec<VehicleId>, max_size: usize) -> Self {
        Self {
            id,
            members,
            max_size,
        }
    }

    /// Gets the platoon ID.
    pub fn id(&self) -> PlatoonId {
        self.id
    }

    /// The members, leader first.
    pub fn members(&self) -> &[VehicleId] {
        &self.members
    }

    /// The leading vehicle.
    pub fn leader(&self) -> Option<VehicleId> {
        self.members.first().copied()
    }

    /// The last vehicle.
    pub fn last(&self) -> Option<VehicleId> {
        self.members.last().copied()
    }

    /// The index of the member, the leader being 0.
    pub fn position(&self, id: VehicleId) -> Option<usize> {
        self.members.iter().position(|m| *m == id)
    }

    /// The member directly ahead of `id`, or `None` for the leader.
    pub fn predecessor(&self, id: VehicleId) -> Option<VehicleId> {
        let idx = self.position(id)?;
        idx.checked_sub(1).map(|i| self.members[i])
    }

    /// The maximum number of members.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// The number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the platoon has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether the platoon has reached its maximum size.
    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_size
    }

    /// Whether the vehicle is a member.
    pub fn contains(&self, id: VehicleId) -> bool {
        self.members.contains(&id)
    }

    /// Checks whether the vehicle may join at the back of the platoon.
    ///
    /// It must be connected, not already in a platoon, directly behind the last
    /// member on the same lane and at least [MIN_PLATOON_GAP] behind it.
    pub(crate) fn check_join(&self, vehicles: &VehicleSet, id: VehicleId) -> Result<()> {
        let vehicle = &vehicles[id];
        if !vehicle.is_connected() {
            return Err(Error::NotConnected(id));
        }
        if let Some(platoon) = vehicle.platoon {
            return Err(Error::AlreadyInPlatoon {
                vehicle: id,
                platoon,
            });
        }
        if self.is_full() {
            return Err(Error::PlatoonFull {
                platoon: self.id,
                max_size: self.max_size,
            });
        }
        let last = self.last().ok_or(Error::PlatoonEmpty(self.id))?;
        if vehicle.front != Some(last) {
            return Err(Error::NotBehindPlatoon {
                vehicle: id,
                platoon: self.id,
            });
        }
        let gap = vehicles[last].as_leader().gap_from(vehicle.pos());
        if gap < MIN_PLATOON_GAP {
            return Err(Error::PlatoonGapTooSmall {
                platoon: self.id,
                gap,
                min: MIN_PLATOON_GAP,
            });
        }
        Ok(())
    }

    /// Adds a vehicle at the back of the platoon. The membership is unchanged on failure.
    pub(crate) fn add_vehicle(&mut self, vehicles: &mut VehicleSet, id: VehicleId) -> Result<()> {
        self.check_join(vehicles, id)?;
        self.members.push(id);
        vehicles[id].platoon = Some(self.id);
        Ok(())
    }

    /// Removes a follower from the platoon. The leader cannot be removed this way.
    ///
    /// Members behind the follower must be split off first to keep the
    /// platoon consecutive.
    pub(crate) fn remove_vehicle(&mut self, vehicles: &mut VehicleSet, id: VehicleId) -> Result<()> {
        let idx = self.position(id).ok_or(Error::NotInPlatoon {
            vehicle: id,
            platoon: self.id,
        })?;
        if idx == 0 {
            return Err(Error::CannotRemoveLeader(self.id));
        }
        self.members.remove(idx);
        vehicles[id].platoon = None;
        Ok(())
    }

    /// Splits off the members from `index` onwards, which must be a follower's index.
    /// The returned members still refer to this platoon until they are reassigned.
    pub(crate) fn split_off(&mut self, index: usize) -> Result<Vec<VehicleId>> {
        if self.members.is_empty() {
            return Err(Error::PlatoonEmpty(self.id));
        }
        if index == 0 {
            return Err(Error::CannotRemoveLeader(self.id));
        }
        if index >= self.members.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.members.len(),
            });
        }
        Ok(self.members.split_off(index))
    }

    /// Checks that `other` can be appended to this platoon.
    pub(crate) fn check_extend(&self, other: &Platoon, vehicles: &VehicleSet) -> Result<()> {
        let last = self.last().ok_or(Error::PlatoonEmpty(self.id))?;
        let head = other.leader().ok_or(Error::PlatoonEmpty(other.id))?;
        if self.members.len() + other.members.len() > self.max_size {
            return Err(Error::PlatoonFull {
                platoon: self.id,
                max_size: self.max_size,
            });
        }
        if vehicles[head].front != Some(last) {
            return Err(Error::NotBehindPlatoon {
                vehicle: head,
                platoon: self.id,
            });
        }
        Ok(())
    }

    /// Appends all members of `other`, which must directly follow this platoon.
    pub(crate) fn extend(&mut self, vehicles: &mut VehicleSet, other: Platoon) -> Result<()> {
        self.check_extend(&other, vehicles)?;
        for id in &other.members {
            vehicles[*id].platoon = Some(self.id);
        }
        self.members.extend(other.members);
        Ok(())
    }

    /// Releases all members and leaves the platoon empty.
    pub(crate) fn dissolve(&mut self, vehicles: &mut VehicleSet) -> Vec<VehicleId> {
        for id in &self.members {
            if let Some(vehicle) = vehicles.get_mut(*id) {
                vehicle.platoon = None;
            }
        }
        std::mem::take(&mut self.members)
    }
}
