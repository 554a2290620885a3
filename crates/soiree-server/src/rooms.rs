use std::collections::{HashMap, HashSet};

use soiree_shared::{ObjectId, UserId};

/// An ephemeral signal room. Conversation and group ids live in separate
/// namespaces even though both are [`ObjectId`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    Conversation(ObjectId),
    Group(ObjectId),
}

/// Live room memberships. Rooms exist only while someone has joined them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoomRegistry {
    conversations: HashMap<ObjectId, HashSet<UserId>>,
    groups: HashMap<ObjectId, HashSet<UserId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(&self, room: Room) -> (&HashMap<ObjectId, HashSet<UserId>>, ObjectId) {
        match room {
            Room::Conversation(id) => (&self.conversations, id),
            Room::Group(id) => (&self.groups, id),
        }
    }

    fn namespace_mut(&mut self, room: Room) -> (&mut HashMap<ObjectId, HashSet<UserId>>, ObjectId) {
        match room {
            Room::Conversation(id) => (&mut self.conversations, id),
            Room::Group(id) => (&mut self.groups, id),
        }
    }

    /// Returns `true` if the user was not already in the room.
    pub fn join(&mut self, room: Room, user: &UserId) -> bool {
        let (rooms, id) = self.namespace_mut(room);
        rooms.entry(id).or_default().insert(user.clone())
    }

    /// Returns `true` if the user was in the room. Empty rooms are dropped.
    pub fn leave(&mut self, room: Room, user: &UserId) -> bool {
        let (rooms, id) = self.namespace_mut(room);
        let Some(members) = rooms.get_mut(&id) else {
            return false;
        };
        let removed = members.remove(user);
        if members.is_empty() {
            rooms.remove(&id);
        }
        removed
    }

    pub fn members(&self, room: Room) -> Vec<UserId> {
        let (rooms, id) = self.namespace(room);
        rooms
            .get(&id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, room: Room, user: &UserId) -> bool {
        let (rooms, id) = self.namespace(room);
        rooms.get(&id).is_some_and(|members| members.contains(user))
    }

    /// Remove `user` from every room. Returns how many rooms they left.
    pub fn release_user(&mut self, user: &UserId) -> usize {
        let mut released = 0;
        for rooms in [&mut self.conversations, &mut self.groups] {
            rooms.retain(|_, members| {
                if members.remove(user) {
                    released += 1;
                }
                !members.is_empty()
            });
        }
        released
    }

    pub fn room_count(&self) -> usize {
        self.conversations.len() + self.groups.len()
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(email: &str) -> UserId {
        UserId::parse(email).unwrap()
    }

    #[test]
    fn join_then_leave_restores_registry() {
        let mut rooms = RoomRegistry::new();
        let id = ObjectId::new();
        rooms.join(Room::Group(id), &user("a@x.com"));
        let before = rooms.clone();

        assert!(rooms.join(Room::Conversation(id), &user("b@x.com")));
        assert!(rooms.leave(Room::Conversation(id), &user("b@x.com")));
        assert_eq!(rooms, before);
    }

    #[test]
    fn namespaces_are_disjoint() {
        let mut rooms = RoomRegistry::new();
        let id = ObjectId::new();
        let a = user("a@x.com");
        rooms.join(Room::Conversation(id), &a);

        assert!(rooms.contains(Room::Conversation(id), &a));
        assert!(!rooms.contains(Room::Group(id), &a));
        assert!(rooms.members(Room::Group(id)).is_empty());
        assert!(!rooms.leave(Room::Group(id), &a));
    }

    #[test]
    fn empty_rooms_are_collected() {
        let mut rooms = RoomRegistry::new();
        let id = ObjectId::new();
        let a = user("a@x.com");
        assert!(rooms.join(Room::Group(id), &a));
        assert!(!rooms.join(Room::Group(id), &a));
        assert_eq!(rooms.room_count(), 1);

        rooms.leave(Room::Group(id), &a);
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn release_user_leaves_everything() {
        let mut rooms = RoomRegistry::new();
        let (a, b) = (user("a@x.com"), user("b@x.com"));
        let (g1, g2, c) = (ObjectId::new(), ObjectId::new(), ObjectId::new());
        rooms.join(Room::Group(g1), &a);
        rooms.join(Room::Group(g2), &a);
        rooms.join(Room::Group(g2), &b);
        rooms.join(Room::Conversation(c), &a);

        assert_eq!(rooms.release_user(&a), 3);
        assert_eq!(rooms.room_count(), 1);
        assert_eq!(rooms.members(Room::Group(g2)), vec![b]);
    }
}
