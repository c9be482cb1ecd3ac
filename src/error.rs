use thiserror::Error;

/// Authentication collaborator failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("token has expired")]
    Expired,
    #[error("invalid or missing token")]
    Invalid,
    #[error("user not found")]
    NotFound,
}

/// Refusals raised before a socket is admitted into a registry.
/// Every variant terminates the socket with a policy-violation close.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("room not found")]
    RoomNotFound,
    #[error("not a member of this room")]
    NotAMember,
    #[error("room credential required")]
    CredentialRequired,
    #[error("bad room credential")]
    BadCredential,
    #[error("unknown user")]
    UnknownUser,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-frame failures reported inline; the session stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid JSON format.")]
    Malformed,
    #[error("read receipts are not supported in room chat")]
    ReadInRoom,
    #[error("message not found")]
    UnknownMessage,
    #[error("not the receiver of this message")]
    NotReceiver,
}

/// Persistent store failures. Fatal for the triggering operation only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unknown user id {0}")]
    UnknownUser(i64),
    #[error("unknown room id {0}")]
    UnknownRoom(i64),
}

/// Attachment decode/write failures.
#[derive(Error, Debug)]
pub enum FileError {
    #[error("malformed data url")]
    MalformedDataUrl,
    #[error("invalid base64 payload")]
    BadEncoding,
    #[error("empty attachment")]
    Empty,
    #[error("failed to write attachment: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that can go wrong while applying a single inbound frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}
