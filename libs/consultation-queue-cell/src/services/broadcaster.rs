use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::events::ServerEvent;
use crate::models::Specialty;

pub type RoomSender = broadcast::Sender<String>;
pub type RoomReceiver = broadcast::Receiver<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    Specialty(Specialty),
    User(Uuid),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Specialty(specialty) => write!(f, "queue:{}", specialty),
            Room::User(user_id) => write!(f, "user:{}", user_id),
        }
    }
}

/// Fan-out of queue and consultation events to per-specialty and per-user
/// rooms. Slow receivers lose messages; nothing is replayed.
pub struct RealtimeBroadcaster {
    rooms: Arc<RwLock<HashMap<Room, RoomSender>>>,
    capacity: usize,
}

impl RealtimeBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub async fn subscribe(&self, room: Room) -> RoomReceiver {
        {
            let rooms = self.rooms.read().await;
            if let Some(sender) = rooms.get(&room) {
                return sender.subscribe();
            }
        }

        let mut rooms = self.rooms.write().await;
        let sender = rooms.entry(room).or_insert_with(|| {
            debug!("Created realtime room {}", room);
            broadcast::channel(self.capacity).0
        });
        sender.subscribe()
    }

    /// Publish to a room, returning how many receivers got the message.
    pub async fn publish(&self, room: Room, event: &ServerEvent) -> Result<usize, QueueError> {
        let message = event.to_message()?;

        let rooms = self.rooms.read().await;
        let delivered = match rooms.get(&room) {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        };

        debug!("Sent {} to {} ({} receivers)", event.name(), room, delivered);
        Ok(delivered)
    }

    pub async fn publish_to_users(&self, users: &[Uuid], event: &ServerEvent) -> Result<usize, QueueError> {
        let mut delivered = 0;
        for user_id in users {
            delivered += self.publish(Room::User(*user_id), event).await?;
        }
        Ok(delivered)
    }

    /// Drop rooms nobody listens to anymore.
    pub async fn prune_empty_rooms(&self) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|_, sender| sender.receiver_count() > 0);
        before - rooms.len()
    }

    pub async fn subscriber_count(&self, room: Room) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(&room).map(|s| s.receiver_count()).unwrap_or(0)
    }

    pub async fn get_active_rooms(&self) -> Vec<Room> {
        let rooms = self.rooms.read().await;
        rooms.keys().cloned().collect()
    }
}

impl Default for RealtimeBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RoomMembershipPayload;
    use shared_models::user::UserRole;

    fn joined(user_id: Uuid) -> ServerEvent {
        ServerEvent::UserJoinedQueue(RoomMembershipPayload {
            specialty: Specialty::Dentista,
            user_id,
            role: UserRole::Patient,
        })
    }

    #[test]
    fn test_publish_reaches_only_room_members() {
        tokio_test::block_on(async {
            let broadcaster = RealtimeBroadcaster::new(8);
            let user_id = Uuid::new_v4();
            let mut queue_rx = broadcaster.subscribe(Room::Specialty(Specialty::Dentista)).await;

            let delivered = broadcaster
                .publish(Room::Specialty(Specialty::Dentista), &joined(user_id))
                .await
                .unwrap();
            assert_eq!(delivered, 1);
            assert!(queue_rx.try_recv().unwrap().contains("user-joined-queue"));

            let delivered = broadcaster.publish_to_users(&[user_id], &joined(user_id)).await.unwrap();
            assert_eq!(delivered, 0);
            assert!(queue_rx.try_recv().is_err());
        });
    }

    #[test]
    fn test_prune_drops_rooms_without_receivers() {
        tokio_test::block_on(async {
            let broadcaster = RealtimeBroadcaster::new(8);
            let kept = broadcaster.subscribe(Room::Specialty(Specialty::Psicologo)).await;
            drop(broadcaster.subscribe(Room::User(Uuid::new_v4())).await);

            assert_eq!(broadcaster.get_active_rooms().await.len(), 2);
            assert_eq!(broadcaster.prune_empty_rooms().await, 1);
            assert_eq!(broadcaster.subscriber_count(Room::Specialty(Specialty::Psicologo)).await, 1);
            drop(kept);
        });
    }
}
