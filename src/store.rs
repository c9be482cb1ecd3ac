use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Delivery lifecycle of a direct message. Room messages carry no status.
/// Variant order matters: transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Delivered => write!(f, "delivered"),
            MessageStatus::Read => write!(f, "read"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
}

impl UserRecord {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub id: i64,
    pub name: String,
    pub is_private: bool,
    /// Salted hash produced by `auth::hash_password`; never the plaintext.
    pub password_hash: Option<String>,
}

/// Reference to a stored attachment, as handed back by the file storage.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub url: String,
    pub mime_type: String,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub content: Option<String>,
    pub sender_id: i64,
    pub room_id: Option<i64>,
    pub receiver_id: Option<i64>,
    pub sent_at: DateTime<Utc>,
    pub status: Option<MessageStatus>,
    pub file_url: Option<String>,
    pub file_type: Option<String>,
}

/// A message joined with its sender's display name, ready for rendering.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub message: StoredMessage,
    pub sender_name: String,
}

/// Gateway to the persistent store. The core only touches the fields it
/// needs; durable schema and CRUD belong to the surrounding application.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn user(&self, user_id: i64) -> Result<Option<UserRecord>, StoreError>;

    async fn room(&self, room_id: i64) -> Result<Option<RoomRecord>, StoreError>;

    /// Durable membership, not live registry presence.
    async fn is_member(&self, user_id: i64, room_id: i64) -> Result<bool, StoreError>;

    async fn create_room_message(
        &self,
        sender_id: i64,
        room_id: i64,
        content: Option<String>,
        file: Option<FileRef>,
    ) -> Result<HistoryEntry, StoreError>;

    /// Created with status `sent`.
    async fn create_direct_message(
        &self,
        sender_id: i64,
        receiver_id: i64,
        content: Option<String>,
        file: Option<FileRef>,
    ) -> Result<HistoryEntry, StoreError>;

    async fn message(&self, message_id: i64) -> Result<Option<StoredMessage>, StoreError>;

    /// Forward-only: a repeat or regression is a silent no-op, which keeps
    /// read acknowledgements idempotent.
    async fn advance_status(
        &self,
        message_id: i64,
        status: MessageStatus,
    ) -> Result<(), StoreError>;

    /// Full room history, ascending by send time.
    async fn room_history(&self, room_id: i64) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Both directions of the pair, ascending by send time.
    async fn direct_history(&self, a: i64, b: i64) -> Result<Vec<HistoryEntry>, StoreError>;
}

#[derive(Default)]
struct Tables {
    users: HashMap<i64, UserRecord>,
    rooms: HashMap<i64, RoomRecord>,
    members: Vec<(i64, i64)>,
    messages: Vec<StoredMessage>,
    next_message_id: i64,
}

/// In-process implementation of the store gateway. User, room, and
/// membership rows are provisioned through the `add_*` helpers, standing in
/// for the registration/administration endpoints that live outside the core.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            tables: RwLock::new(Tables {
                next_message_id: 1,
                ..Tables::default()
            }),
        }
    }

    pub async fn add_user(&self, user: UserRecord) {
        let mut tables = self.tables.write().await;
        tables.users.insert(user.id, user);
    }

    pub async fn add_room(&self, room: RoomRecord) {
        let mut tables = self.tables.write().await;
        tables.rooms.insert(room.id, room);
    }

    pub async fn add_member(&self, user_id: i64, room_id: i64) {
        let mut tables = self.tables.write().await;
        if !tables.members.contains(&(user_id, room_id)) {
            tables.members.push((user_id, room_id));
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sender_name(tables: &Tables, sender_id: i64) -> Result<String, StoreError> {
    tables
        .users
        .get(&sender_id)
        .map(UserRecord::display_name)
        .ok_or(StoreError::UnknownUser(sender_id))
}

fn insert_message(
    tables: &mut Tables,
    sender_id: i64,
    room_id: Option<i64>,
    receiver_id: Option<i64>,
    content: Option<String>,
    file: Option<FileRef>,
    status: Option<MessageStatus>,
) -> Result<HistoryEntry, StoreError> {
    let name = sender_name(tables, sender_id)?;
    let id = tables.next_message_id;
    tables.next_message_id += 1;

    let (file_url, file_type) = match file {
        Some(file) => (Some(file.url), Some(file.mime_type)),
        None => (None, None),
    };

    let message = StoredMessage {
        id,
        content,
        sender_id,
        room_id,
        receiver_id,
        sent_at: Utc::now(),
        status,
        file_url,
        file_type,
    };
    tables.messages.push(message.clone());

    Ok(HistoryEntry {
        message,
        sender_name: name,
    })
}

fn history(
    tables: &Tables,
    filter: impl Fn(&StoredMessage) -> bool,
) -> Result<Vec<HistoryEntry>, StoreError> {
    let mut selected: Vec<&StoredMessage> = tables.messages.iter().filter(|m| filter(m)).collect();
    selected.sort_by_key(|m| (m.sent_at, m.id));

    selected
        .into_iter()
        .map(|message| {
            Ok(HistoryEntry {
                message: message.clone(),
                sender_name: sender_name(tables, message.sender_id)?,
            })
        })
        .collect()
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn user(&self, user_id: i64) -> Result<Option<UserRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.users.get(&user_id).cloned())
    }

    async fn room(&self, room_id: i64) -> Result<Option<RoomRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.rooms.get(&room_id).cloned())
    }

    async fn is_member(&self, user_id: i64, room_id: i64) -> Result<bool, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.members.contains(&(user_id, room_id)))
    }

    async fn create_room_message(
        &self,
        sender_id: i64,
        room_id: i64,
        content: Option<String>,
        file: Option<FileRef>,
    ) -> Result<HistoryEntry, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.rooms.contains_key(&room_id) {
            return Err(StoreError::UnknownRoom(room_id));
        }
        insert_message(&mut tables, sender_id, Some(room_id), None, content, file, None)
    }

    async fn create_direct_message(
        &self,
        sender_id: i64,
        receiver_id: i64,
        content: Option<String>,
        file: Option<FileRef>,
    ) -> Result<HistoryEntry, StoreError> {
        let mut tables = self.tables.write().await;
        insert_message(
            &mut tables,
            sender_id,
            None,
            Some(receiver_id),
            content,
            file,
            Some(MessageStatus::Sent),
        )
    }

    async fn message(&self, message_id: i64) -> Result<Option<StoredMessage>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.messages.iter().find(|m| m.id == message_id).cloned())
    }

    async fn advance_status(
        &self,
        message_id: i64,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(message) = tables.messages.iter_mut().find(|m| m.id == message_id) {
            if let Some(current) = message.status {
                if status > current {
                    message.status = Some(status);
                }
            }
        }
        Ok(())
    }

    async fn room_history(&self, room_id: i64) -> Result<Vec<HistoryEntry>, StoreError> {
        let tables = self.tables.read().await;
        history(&tables, |m| m.room_id == Some(room_id))
    }

    async fn direct_history(&self, a: i64, b: i64) -> Result<Vec<HistoryEntry>, StoreError> {
        let tables = self.tables.read().await;
        history(&tables, |m| {
            (m.sender_id == a && m.receiver_id == Some(b))
                || (m.sender_id == b && m.receiver_id == Some(a))
        })
    }
}
