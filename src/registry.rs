use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use log::debug;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use warp::ws::Message;

use crate::error::StoreError;

/// Outbound side of one live socket. The write half of the WebSocket is
/// owned by a dedicated task draining the channel, so a send here never
/// blocks and never touches a closed socket directly.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
    /// Highest message id this connection received via replay; stored room
    /// broadcasts at or below it are skipped.
    replayed_through: i64,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        ConnectionHandle {
            id: Uuid::new_v4(),
            tx,
            replayed_through: 0,
        }
    }

    /// Returns false when the writer task is gone. Callers treat that as a
    /// skipped target, not a failure; the disconnect path cleans up.
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

type Targets = HashMap<Uuid, ConnectionHandle>;

/// Live sockets per chat room. Membership here is connection lifetime only;
/// the durable member list lives in the store.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<i64, Targets>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, room_id: i64, handle: ConnectionHandle) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(room_id).or_default().insert(handle.id, handle);
    }

    /// Register a connection and queue its history replay as one atomic
    /// step: the fetch runs while the room map is write-locked, so a
    /// concurrent `broadcast_stored` either lands in the snapshot or is
    /// delivered live after it, never ahead of it. Messages present in the
    /// snapshot are remembered on the handle and skipped on later
    /// broadcasts, relying on message ids growing in persist order.
    ///
    /// The handle is registered only when the fetch succeeds.
    pub async fn connect_with_replay<Fut>(
        &self,
        room_id: i64,
        mut handle: ConnectionHandle,
        fetch: Fut,
    ) -> Result<(), StoreError>
    where
        Fut: Future<Output = Result<Vec<(i64, Message)>, StoreError>>,
    {
        let mut rooms = self.rooms.write().await;
        let frames = fetch.await?;
        if let Some((last_id, _)) = frames.last() {
            handle.replayed_through = *last_id;
        }
        for (_, frame) in frames {
            let _ = handle.send(frame);
        }
        rooms.entry(room_id).or_default().insert(handle.id, handle);
        Ok(())
    }

    /// Idempotent: removing an absent connection is a no-op.
    pub async fn disconnect(&self, room_id: i64, connection_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(targets) = rooms.get_mut(&room_id) {
            targets.remove(&connection_id);
            if targets.is_empty() {
                rooms.remove(&room_id);
            }
        }
    }

    /// Fan the message out to every socket currently registered under the
    /// room. Each target is sent to independently; a dead one is skipped.
    pub async fn broadcast(&self, room_id: i64, message: Message) {
        let rooms = self.rooms.read().await;
        let Some(targets) = rooms.get(&room_id) else {
            return;
        };
        let mut delivered = 0usize;
        for handle in targets.values() {
            if handle.send(message.clone()) {
                delivered += 1;
            }
        }
        debug!(
            "room {room_id}: broadcast reached {delivered} of {} connections",
            targets.len()
        );
    }

    /// Fan a persisted room message out to every registered socket, except
    /// those that already received this id during their replay.
    pub async fn broadcast_stored(&self, room_id: i64, message_id: i64, message: Message) {
        let rooms = self.rooms.read().await;
        let Some(targets) = rooms.get(&room_id) else {
            return;
        };
        let mut delivered = 0usize;
        for handle in targets.values() {
            if handle.replayed_through >= message_id {
                continue;
            }
            if handle.send(message.clone()) {
                delivered += 1;
            }
        }
        debug!(
            "room {room_id}: message {message_id} reached {delivered} of {} connections",
            targets.len()
        );
    }

    pub async fn connection_count(&self, room_id: i64) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(&room_id).map_or(0, Targets::len)
    }
}

/// Live one-to-one sockets, keyed by user id alone: a user's connections
/// receive traffic from all of their counterparts, so delivery between two
/// users always resolves both identities and fans out to the union.
#[derive(Clone, Default)]
pub struct ConversationRegistry {
    users: Arc<RwLock<HashMap<i64, Targets>>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, user_id: i64, handle: ConnectionHandle) {
        let mut users = self.users.write().await;
        users.entry(user_id).or_default().insert(handle.id, handle);
    }

    /// Register a connection and queue its conversation replay atomically
    /// with respect to `send`: a status frame racing the replay window is
    /// held back until after the snapshot, keeping the replay a strict
    /// prefix of the live stream. Registered only when the fetch succeeds.
    pub async fn connect_with_replay<Fut>(
        &self,
        user_id: i64,
        handle: ConnectionHandle,
        fetch: Fut,
    ) -> Result<(), StoreError>
    where
        Fut: Future<Output = Result<Vec<Message>, StoreError>>,
    {
        let mut users = self.users.write().await;
        let frames = fetch.await?;
        for frame in frames {
            let _ = handle.send(frame);
        }
        users.entry(user_id).or_default().insert(handle.id, handle);
        Ok(())
    }

    /// Idempotent, and scoped to exactly one connection: a user's other
    /// sockets stay registered.
    pub async fn disconnect(&self, user_id: i64, connection_id: Uuid) {
        let mut users = self.users.write().await;
        if let Some(targets) = users.get_mut(&user_id) {
            targets.remove(&connection_id);
            if targets.is_empty() {
                users.remove(&user_id);
            }
        }
    }

    /// Deliver one frame to every live connection of both parties. Either
    /// side may have zero connections; sends are isolated per target.
    pub async fn send(&self, user_a: i64, user_b: i64, message: Message) {
        let users = self.users.read().await;
        let mut parties = vec![user_a];
        if user_b != user_a {
            parties.push(user_b);
        }
        for user_id in parties {
            if let Some(targets) = users.get(&user_id) {
                for handle in targets.values() {
                    let _ = handle.send(message.clone());
                }
            }
        }
    }

    pub async fn connection_count(&self, user_id: i64) -> usize {
        let users = self.users.read().await;
        users.get(&user_id).map_or(0, Targets::len)
    }
}
