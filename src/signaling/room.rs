use std::collections::HashMap;

use super::message::{AttemptSessionId, ConnectionId, PeerRole};

#[derive(Debug, Clone)]
pub struct Occupant<S> {
    pub connection_id: ConnectionId,
    pub role: PeerRole,
    pub sink: S,
}

/// Result of a join: who was already there, and who got displaced
#[derive(Debug)]
pub struct JoinOutcome<S> {
    pub existing: Vec<Occupant<S>>,
    pub displaced: Option<Occupant<S>>,
}

#[derive(Debug)]
pub struct LeaveOutcome<S> {
    pub left: Occupant<S>,
    pub remaining: Vec<Occupant<S>>,
}

/// Room membership per exam attempt: one candidate and at most one proctor.
///
/// A second join with a role already present replaces the older occupant.
/// The registry only tracks membership; callers deliver the messages.
pub struct RoomRegistry<S> {
    rooms: HashMap<AttemptSessionId, Vec<Occupant<S>>>,
}

impl<S: Clone> RoomRegistry<S> {
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
        }
    }

    pub fn join(
        &mut self,
        attempt: &AttemptSessionId,
        role: PeerRole,
        connection_id: ConnectionId,
        sink: S,
    ) -> JoinOutcome<S> {
        let occupants = self.rooms.entry(attempt.clone()).or_default();

        let displaced = occupants
            .iter()
            .position(|o| o.role == role)
            .map(|pos| occupants.remove(pos));

        let existing = occupants.clone();
        occupants.push(Occupant {
            connection_id: connection_id.clone(),
            role,
            sink,
        });

        tracing::info!(
            attempt_id = %attempt,
            connection_id = %connection_id,
            role = ?role,
            displaced = displaced.is_some(),
            "Connection joined attempt room"
        );

        JoinOutcome {
            existing,
            displaced,
        }
    }

    pub fn leave(
        &mut self,
        attempt: &AttemptSessionId,
        connection_id: &ConnectionId,
    ) -> Option<LeaveOutcome<S>> {
        let occupants = self.rooms.get_mut(attempt)?;
        let pos = occupants
            .iter()
            .position(|o| &o.connection_id == connection_id)?;
        let left = occupants.remove(pos);
        let remaining = occupants.clone();

        if occupants.is_empty() {
            self.rooms.remove(attempt);
            tracing::debug!(attempt_id = %attempt, "Attempt room emptied");
        }

        tracing::info!(
            attempt_id = %attempt,
            connection_id = %connection_id,
            role = ?left.role,
            "Connection left attempt room"
        );

        Some(LeaveOutcome { left, remaining })
    }

    /// Recipients for a message sent by `from`. A targeted message reaches
    /// only its target, and nobody when the target is not in the room.
    /// Untargeted messages go to every other occupant.
    pub fn route(
        &self,
        attempt: &AttemptSessionId,
        from: &ConnectionId,
        target: Option<&ConnectionId>,
    ) -> Vec<Occupant<S>> {
        let Some(occupants) = self.rooms.get(attempt) else {
            return Vec::new();
        };

        match target {
            Some(target) => occupants
                .iter()
                .filter(|o| &o.connection_id == target && &o.connection_id != from)
                .cloned()
                .collect(),
            None => occupants
                .iter()
                .filter(|o| &o.connection_id != from)
                .cloned()
                .collect(),
        }
    }

    /// Everyone in the room, for broadcasts from external producers
    pub fn occupants(&self, attempt: &AttemptSessionId) -> Vec<Occupant<S>> {
        self.rooms.get(attempt).cloned().unwrap_or_default()
    }

    pub fn room_exists(&self, attempt: &AttemptSessionId) -> bool {
        self.rooms.contains_key(attempt)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl<S: Clone> Default for RoomRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt() -> AttemptSessionId {
        AttemptSessionId::new("attempt-1")
    }

    #[test]
    fn test_joiner_sees_existing_occupant() {
        let mut rooms: RoomRegistry<u8> = RoomRegistry::new();
        let first = rooms.join(&attempt(), PeerRole::Candidate, ConnectionId::new("c"), 1);
        assert!(first.existing.is_empty());

        let second = rooms.join(&attempt(), PeerRole::Proctor, ConnectionId::new("p"), 2);
        assert_eq!(second.existing.len(), 1);
        assert_eq!(second.existing[0].role, PeerRole::Candidate);
        assert!(second.displaced.is_none());
    }

    #[test]
    fn test_same_role_join_displaces_older_occupant() {
        let mut rooms: RoomRegistry<u8> = RoomRegistry::new();
        rooms.join(&attempt(), PeerRole::Proctor, ConnectionId::new("p1"), 1);
        let outcome = rooms.join(&attempt(), PeerRole::Proctor, ConnectionId::new("p2"), 2);

        let displaced = outcome.displaced.expect("older proctor displaced");
        assert_eq!(displaced.connection_id, ConnectionId::new("p1"));
        assert_eq!(rooms.occupants(&attempt()).len(), 1);
    }

    #[test]
    fn test_route_unicast_and_broadcast() {
        let mut rooms: RoomRegistry<u8> = RoomRegistry::new();
        rooms.join(&attempt(), PeerRole::Candidate, ConnectionId::new("c"), 1);
        rooms.join(&attempt(), PeerRole::Proctor, ConnectionId::new("p"), 2);

        let unicast = rooms.route(&attempt(), &ConnectionId::new("c"), Some(&ConnectionId::new("p")));
        assert_eq!(unicast.len(), 1);
        assert_eq!(unicast[0].sink, 2);

        let broadcast = rooms.route(&attempt(), &ConnectionId::new("p"), None);
        assert_eq!(broadcast.len(), 1);
        assert_eq!(broadcast[0].sink, 1);

        let unknown = rooms.route(&attempt(), &ConnectionId::new("c"), Some(&ConnectionId::new("gone")));
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_route_never_echoes_to_sender() {
        let mut rooms: RoomRegistry<u8> = RoomRegistry::new();
        rooms.join(&attempt(), PeerRole::Candidate, ConnectionId::new("c"), 1);
        let routed = rooms.route(&attempt(), &ConnectionId::new("c"), Some(&ConnectionId::new("c")));
        assert!(routed.is_empty());
    }

    #[test]
    fn test_last_leave_removes_room() {
        let mut rooms: RoomRegistry<u8> = RoomRegistry::new();
        rooms.join(&attempt(), PeerRole::Candidate, ConnectionId::new("c"), 1);
        rooms.join(&attempt(), PeerRole::Proctor, ConnectionId::new("p"), 2);

        let outcome = rooms.leave(&attempt(), &ConnectionId::new("c")).unwrap();
        assert_eq!(outcome.remaining.len(), 1);
        assert!(rooms.room_exists(&attempt()));

        rooms.leave(&attempt(), &ConnectionId::new("p")).unwrap();
        assert!(!rooms.room_exists(&attempt()));
        assert!(rooms.leave(&attempt(), &ConnectionId::new("p")).is_none());
    }
}
