use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket, Ws};
use warp::Filter;

use crate::auth::{verify_password, Authenticator};
use crate::error::{AdmissionError, FrameError, ProtocolError, StoreError};
use crate::files::UploadStore;
use crate::frames::{left_notice, online_notice, ClientFrame, ServerFrame};
use crate::registry::{ConnectionHandle, ConversationRegistry, RoomRegistry};
use crate::store::{ChatStore, FileRef, HistoryEntry, MessageStatus, UserRecord};

/// RFC 6455 policy-violation close code, used for every admission refusal.
const POLICY_VIOLATION: u16 = 1008;

type Query = HashMap<String, String>;

/// The live-connection core. Built once at startup and injected into every
/// route; tests construct isolated instances.
pub struct ChatServer {
    store: Arc<dyn ChatStore>,
    auth: Arc<dyn Authenticator>,
    rooms: RoomRegistry,
    conversations: ConversationRegistry,
    uploads: UploadStore,
}

/// WebSocket routes plus the static mount for stored attachments.
pub fn routes(
    server: Arc<ChatServer>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let room = {
        let server = server.clone();
        warp::path!("chat" / i64)
            .and(warp::ws())
            .and(warp::query::<Query>())
            .map(move |room_id: i64, ws: Ws, query: Query| {
                let server = server.clone();
                ws.on_upgrade(move |socket| async move {
                    server.handle_room_socket(socket, room_id, &query).await;
                })
            })
    };

    let direct = {
        let server = server.clone();
        warp::path!("userchat" / i64)
            .and(warp::ws())
            .and(warp::query::<Query>())
            .map(move |receiver_id: i64, ws: Ws, query: Query| {
                let server = server.clone();
                ws.on_upgrade(move |socket| async move {
                    server.handle_direct_socket(socket, receiver_id, &query).await;
                })
            })
    };

    let read_ack = {
        let server = server.clone();
        warp::path!("readstatus")
            .and(warp::ws())
            .and(warp::query::<Query>())
            .map(move |ws: Ws, query: Query| {
                let server = server.clone();
                ws.on_upgrade(move |socket| async move {
                    server.handle_read_ack_socket(socket, &query).await;
                })
            })
    };

    let attachments = warp::path("uploads")
        .and(warp::path("messages"))
        .and(warp::fs::dir(server.uploads.dir().to_path_buf()));

    room.or(direct)
        .or(read_ack)
        .or(attachments)
        .with(warp::cors().allow_any_origin())
}

impl ChatServer {
    pub fn new(
        store: Arc<dyn ChatStore>,
        auth: Arc<dyn Authenticator>,
        uploads: UploadStore,
    ) -> Self {
        ChatServer {
            store,
            auth,
            rooms: RoomRegistry::new(),
            conversations: ConversationRegistry::new(),
            uploads,
        }
    }

    // ---- room chat ----

    async fn handle_room_socket(&self, ws: WebSocket, room_id: i64, query: &Query) {
        let token = query.get("token").map(String::as_str).unwrap_or_default();
        let password = query.get("password").map(String::as_str);

        let user = match self.admit_room(room_id, token, password).await {
            Ok(user) => user,
            Err(refusal) => {
                warn!("room {room_id}: admission refused: {refusal}");
                close_refused(ws, &refusal.to_string()).await;
                return;
            }
        };
        let name = user.display_name();
        info!("room {room_id}: {name} connected");

        let (handle, mut ws_rx) = spawn_writer(ws);
        let connection_id = handle.id;

        // Snapshot and registration are one atomic step in the registry, so
        // the replay is a strict prefix of the live stream and a message
        // racing the join is seen exactly once.
        if let Err(e) = self
            .rooms
            .connect_with_replay(room_id, handle.clone(), self.room_replay_frames(room_id))
            .await
        {
            error!("room {room_id}: history replay failed: {e}");
            return;
        }

        self.rooms
            .broadcast(room_id, Message::text(online_notice(&name)))
            .await;

        while let Some(result) = ws_rx.next().await {
            let message = match result {
                Ok(message) => message,
                Err(e) => {
                    debug!("room {room_id}: socket error for {name}: {e}");
                    break;
                }
            };
            if message.is_close() {
                break;
            }
            let Ok(raw) = message.to_str() else { continue };
            self.handle_room_frame(&handle, &user, room_id, raw).await;
        }

        self.rooms.disconnect(room_id, connection_id).await;
        self.rooms
            .broadcast(room_id, Message::text(left_notice(&name)))
            .await;
        info!("room {room_id}: {name} disconnected");
    }

    async fn admit_room(
        &self,
        room_id: i64,
        token: &str,
        password: Option<&str>,
    ) -> Result<UserRecord, AdmissionError> {
        let user = self.auth.verify(token).await?;
        let room = self
            .store
            .room(room_id)
            .await?
            .ok_or(AdmissionError::RoomNotFound)?;
        if !self.store.is_member(user.id, room_id).await? {
            return Err(AdmissionError::NotAMember);
        }
        if room.is_private {
            let supplied = password.unwrap_or_default();
            if supplied.is_empty() {
                return Err(AdmissionError::CredentialRequired);
            }
            let stored = room.password_hash.as_deref().unwrap_or_default();
            if !verify_password(supplied, stored) {
                return Err(AdmissionError::BadCredential);
            }
        }
        Ok(user)
    }

    async fn room_replay_frames(&self, room_id: i64) -> Result<Vec<(i64, Message)>, StoreError> {
        let history = self.store.room_history(room_id).await?;
        debug!("room {room_id}: replaying {} messages", history.len());
        Ok(history
            .iter()
            .filter_map(|entry| {
                serde_json::to_string(&ServerFrame::from_history(entry))
                    .ok()
                    .map(|text| (entry.message.id, Message::text(text)))
            })
            .collect())
    }

    async fn handle_room_frame(
        &self,
        handle: &ConnectionHandle,
        user: &UserRecord,
        room_id: i64,
        raw: &str,
    ) {
        let Some(frame) = parse_frame(handle, raw) else {
            return;
        };

        let outcome = match frame {
            ClientFrame::Text { text } => self.room_text(user, room_id, text).await,
            ClientFrame::File {
                data,
                filename,
                mimetype,
                text,
            } => self.room_file(user, room_id, &data, &filename, mimetype, text).await,
            // The room path has no delivery-status machine.
            ClientFrame::Read { .. } => Err(ProtocolError::ReadInRoom.into()),
        };
        if let Err(e) = outcome {
            report_frame_error(handle, &e, &format!("room {room_id}"));
        }
    }

    async fn room_text(
        &self,
        user: &UserRecord,
        room_id: i64,
        text: String,
    ) -> Result<(), FrameError> {
        let entry = self
            .store
            .create_room_message(user.id, room_id, Some(text), None)
            .await?;
        self.broadcast_entry(room_id, &entry).await;
        Ok(())
    }

    async fn room_file(
        &self,
        user: &UserRecord,
        room_id: i64,
        data: &str,
        filename: &str,
        mimetype: String,
        caption: Option<String>,
    ) -> Result<(), FrameError> {
        let url = self.uploads.save(data, filename).await?;
        let entry = self
            .store
            .create_room_message(
                user.id,
                room_id,
                caption,
                Some(FileRef {
                    url,
                    mime_type: mimetype,
                }),
            )
            .await?;
        self.broadcast_entry(room_id, &entry).await;
        Ok(())
    }

    // ---- one-to-one chat ----

    async fn handle_direct_socket(&self, ws: WebSocket, receiver_id: i64, query: &Query) {
        let token = query.get("token").map(String::as_str).unwrap_or_default();

        let user = match self.admit_direct(receiver_id, token).await {
            Ok(user) => user,
            Err(refusal) => {
                warn!("userchat {receiver_id}: admission refused: {refusal}");
                close_refused(ws, &refusal.to_string()).await;
                return;
            }
        };
        let name = user.display_name();
        info!("userchat: {name} connected to chat with user {receiver_id}");

        let (handle, mut ws_rx) = spawn_writer(ws);
        let connection_id = handle.id;

        if let Err(e) = self
            .conversations
            .connect_with_replay(
                user.id,
                handle.clone(),
                self.direct_replay_frames(user.id, receiver_id),
            )
            .await
        {
            error!("userchat: history replay failed for {name}: {e}");
            return;
        }

        while let Some(result) = ws_rx.next().await {
            let message = match result {
                Ok(message) => message,
                Err(e) => {
                    debug!("userchat: socket error for {name}: {e}");
                    break;
                }
            };
            if message.is_close() {
                break;
            }
            let Ok(raw) = message.to_str() else { continue };
            self.handle_direct_frame(&handle, &user, receiver_id, raw).await;
        }

        self.conversations.disconnect(user.id, connection_id).await;
        info!("userchat: {name} disconnected");
    }

    async fn admit_direct(
        &self,
        receiver_id: i64,
        token: &str,
    ) -> Result<UserRecord, AdmissionError> {
        let user = self.auth.verify(token).await?;
        if self.store.user(receiver_id).await?.is_none() {
            return Err(AdmissionError::UnknownUser);
        }
        Ok(user)
    }

    async fn direct_replay_frames(
        &self,
        user_id: i64,
        receiver_id: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let history = self.store.direct_history(user_id, receiver_id).await?;
        debug!(
            "userchat {user_id}<->{receiver_id}: replaying {} messages",
            history.len()
        );
        Ok(history
            .iter()
            .filter_map(|entry| serde_json::to_string(&ServerFrame::from_history(entry)).ok())
            .map(Message::text)
            .collect())
    }

    async fn handle_direct_frame(
        &self,
        handle: &ConnectionHandle,
        user: &UserRecord,
        receiver_id: i64,
        raw: &str,
    ) {
        let Some(frame) = parse_frame(handle, raw) else {
            return;
        };

        let outcome = match frame {
            ClientFrame::Text { text } => {
                self.direct_message(user, receiver_id, Some(text), None).await
            }
            ClientFrame::File {
                data,
                filename,
                mimetype,
                text,
            } => match self.uploads.save(&data, &filename).await {
                Ok(url) => {
                    self.direct_message(
                        user,
                        receiver_id,
                        text,
                        Some(FileRef {
                            url,
                            mime_type: mimetype,
                        }),
                    )
                    .await
                }
                Err(e) => Err(e.into()),
            },
            ClientFrame::Read { message_id } => self.direct_read(user, message_id).await,
        };
        if let Err(e) = outcome {
            report_frame_error(handle, &e, "userchat");
        }
    }

    /// Persist, notify both parties of `sent`, then advance to `delivered`.
    /// Delivery is optimistic: it marks the fan-out, not a transport ack.
    async fn direct_message(
        &self,
        user: &UserRecord,
        receiver_id: i64,
        content: Option<String>,
        file: Option<FileRef>,
    ) -> Result<(), FrameError> {
        let entry = self
            .store
            .create_direct_message(user.id, receiver_id, content, file)
            .await?;

        self.send_conversation_frame(
            user.id,
            receiver_id,
            &ServerFrame::status_update(&entry, MessageStatus::Sent),
        )
        .await;

        self.store
            .advance_status(entry.message.id, MessageStatus::Delivered)
            .await?;
        self.send_conversation_frame(
            user.id,
            receiver_id,
            &ServerFrame::status_update(&entry, MessageStatus::Delivered),
        )
        .await;
        Ok(())
    }

    async fn direct_read(&self, user: &UserRecord, message_id: i64) -> Result<(), FrameError> {
        self.mark_read(message_id, user).await.map(|_| ())
    }

    /// Shared by the in-session `read` frame and the standalone
    /// acknowledgement socket. Advances the status, notifies both parties'
    /// live conversation sockets, and returns the resulting frame.
    async fn mark_read(
        &self,
        message_id: i64,
        caller: &UserRecord,
    ) -> Result<ServerFrame, FrameError> {
        let message = self
            .store
            .message(message_id)
            .await?
            .ok_or(ProtocolError::UnknownMessage)?;
        if message.receiver_id != Some(caller.id) {
            return Err(ProtocolError::NotReceiver.into());
        }

        self.store.advance_status(message_id, MessageStatus::Read).await?;

        let sender_id = message.sender_id;
        let sender_name = self
            .store
            .user(sender_id)
            .await?
            .map(|u| u.display_name())
            .unwrap_or_default();
        let entry = HistoryEntry {
            message,
            sender_name,
        };
        let frame = ServerFrame::status_update(&entry, MessageStatus::Read);
        self.send_conversation_frame(sender_id, caller.id, &frame).await;
        Ok(frame)
    }

    // ---- read-acknowledgement socket ----

    /// Short-lived socket: verify, mark read, emit one `status_update`,
    /// close. Failures are reported inline before closing.
    async fn handle_read_ack_socket(&self, ws: WebSocket, query: &Query) {
        let (mut ws_tx, _ws_rx) = ws.split();

        let frame = match self.acknowledge_read(query).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("readstatus: refused: {e}");
                ServerFrame::error(e.to_string())
            }
        };
        if let Ok(text) = serde_json::to_string(&frame) {
            let _ = ws_tx.send(Message::text(text)).await;
        }
        let _ = ws_tx.close().await;
    }

    async fn acknowledge_read(&self, query: &Query) -> Result<ServerFrame, FrameError> {
        let message_id = query
            .get("messageid")
            .and_then(|raw| raw.parse::<i64>().ok())
            .ok_or(ProtocolError::Malformed)?;
        let token = query
            .get("receivertoken")
            .map(String::as_str)
            .unwrap_or_default();
        let caller = self.auth.verify(token).await?;
        self.mark_read(message_id, &caller).await
    }

    // ---- fan-out helpers ----

    async fn broadcast_entry(&self, room_id: i64, entry: &HistoryEntry) {
        if let Ok(text) = serde_json::to_string(&ServerFrame::from_history(entry)) {
            self.rooms
                .broadcast_stored(room_id, entry.message.id, Message::text(text))
                .await;
        }
    }

    async fn send_conversation_frame(&self, user_a: i64, user_b: i64, frame: &ServerFrame) {
        if let Ok(text) = serde_json::to_string(frame) {
            self.conversations
                .send(user_a, user_b, Message::text(text))
                .await;
        }
    }
}

/// Split the socket and spawn the writer task draining the per-connection
/// channel; returns the registry handle plus the inbound stream.
fn spawn_writer(ws: WebSocket) -> (ConnectionHandle, SplitStream<WebSocket>) {
    let (mut ws_tx, ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_tx.send(message).await {
                debug!("websocket send failed: {e}");
                break;
            }
        }
    });

    (ConnectionHandle::new(tx), ws_rx)
}

/// Terminate an unadmitted socket with a policy-violation close frame.
async fn close_refused(ws: WebSocket, reason: &str) {
    let (mut ws_tx, _ws_rx) = ws.split();
    let _ = ws_tx
        .send(Message::close_with(POLICY_VIOLATION, reason.to_string()))
        .await;
    let _ = ws_tx.close().await;
}

fn parse_frame(handle: &ConnectionHandle, raw: &str) -> Option<ClientFrame> {
    match serde_json::from_str::<ClientFrame>(raw) {
        Ok(frame) => Some(frame),
        Err(e) => {
            debug!("malformed frame: {e}");
            send_frame(handle, &ServerFrame::error(ProtocolError::Malformed.to_string()));
            None
        }
    }
}

/// Inline error report; the session stays open. Store failures are the only
/// ones worth an error-level log, the rest are client mistakes.
fn report_frame_error(handle: &ConnectionHandle, e: &FrameError, context: &str) {
    match e {
        FrameError::Store(_) => error!("{context}: frame not applied: {e}"),
        _ => debug!("{context}: rejected frame: {e}"),
    }
    send_frame(handle, &ServerFrame::error(e.to_string()));
}

fn send_frame(handle: &ConnectionHandle, frame: &ServerFrame) {
    if let Ok(text) = serde_json::to_string(frame) {
        let _ = handle.send(Message::text(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{hash_password, TokenTable};
    use crate::store::{MemoryStore, RoomRecord};

    async fn server() -> (Arc<MemoryStore>, Arc<TokenTable>, ChatServer, tempfile::TempDir) {
        let store = Arc::new(MemoryStore::new());
        for (id, username, first, last) in [
            (1, "alice", "Alice", "Anders"),
            (2, "bob", "Bob", "Burton"),
        ] {
            store
                .add_user(UserRecord {
                    id,
                    username: username.into(),
                    first_name: first.into(),
                    last_name: last.into(),
                })
                .await;
        }
        store
            .add_room(RoomRecord {
                id: 9,
                name: "vault".into(),
                is_private: true,
                password_hash: Some(hash_password("swordfish")),
            })
            .await;
        store.add_member(1, 9).await;

        let auth = Arc::new(TokenTable::new(store.clone()));
        let dir = tempfile::tempdir().unwrap();
        let uploads = UploadStore::new(dir.path().join("messages")).await.unwrap();
        let server = ChatServer::new(store.clone(), auth.clone(), uploads);
        (store, auth, server, dir)
    }

    #[tokio::test]
    async fn admit_room_rejects_bad_token() {
        let (_store, _auth, server, _dir) = server().await;
        let err = server.admit_room(9, "bogus", Some("swordfish")).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Auth(_)));
    }

    #[tokio::test]
    async fn admit_room_rejects_unknown_room() {
        let (_store, auth, server, _dir) = server().await;
        let token = auth.issue(1).await;
        let err = server.admit_room(404, &token, None).await.unwrap_err();
        assert!(matches!(err, AdmissionError::RoomNotFound));
    }

    #[tokio::test]
    async fn admit_room_rejects_non_member() {
        let (_store, auth, server, _dir) = server().await;
        let token = auth.issue(2).await;
        let err = server
            .admit_room(9, &token, Some("swordfish"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::NotAMember));
    }

    #[tokio::test]
    async fn admit_room_credential_matrix() {
        let (_store, auth, server, _dir) = server().await;
        let token = auth.issue(1).await;

        let err = server.admit_room(9, &token, None).await.unwrap_err();
        assert!(matches!(err, AdmissionError::CredentialRequired));

        let err = server.admit_room(9, &token, Some("wrong")).await.unwrap_err();
        assert!(matches!(err, AdmissionError::BadCredential));

        let user = server.admit_room(9, &token, Some("swordfish")).await.unwrap();
        assert_eq!(user.id, 1);
    }

    #[tokio::test]
    async fn admit_direct_rejects_unknown_counterpart() {
        let (_store, auth, server, _dir) = server().await;
        let token = auth.issue(1).await;
        let err = server.admit_direct(404, &token).await.unwrap_err();
        assert!(matches!(err, AdmissionError::UnknownUser));
    }

    #[tokio::test]
    async fn mark_read_rejects_non_receiver() {
        let (store, _auth, server, _dir) = server().await;
        let entry = store
            .create_direct_message(1, 2, Some("for bob".into()), None)
            .await
            .unwrap();
        let alice = store.user(1).await.unwrap().unwrap();

        let err = server.mark_read(entry.message.id, &alice).await.unwrap_err();
        assert!(matches!(err, FrameError::Protocol(ProtocolError::NotReceiver)));
        let message = store.message(entry.message.id).await.unwrap().unwrap();
        assert_eq!(message.status, Some(MessageStatus::Sent));
    }

    #[tokio::test]
    async fn mark_read_advances_and_is_idempotent() {
        let (store, _auth, server, _dir) = server().await;
        let entry = store
            .create_direct_message(1, 2, Some("for bob".into()), None)
            .await
            .unwrap();
        let bob = store.user(2).await.unwrap().unwrap();

        server.mark_read(entry.message.id, &bob).await.unwrap();
        server.mark_read(entry.message.id, &bob).await.unwrap();

        let message = store.message(entry.message.id).await.unwrap().unwrap();
        assert_eq!(message.status, Some(MessageStatus::Read));
    }

    #[tokio::test]
    async fn mark_read_rejects_unknown_message() {
        let (store, _auth, server, _dir) = server().await;
        let bob = store.user(2).await.unwrap().unwrap();
        let err = server.mark_read(404, &bob).await.unwrap_err();
        assert!(matches!(err, FrameError::Protocol(ProtocolError::UnknownMessage)));
    }
}
