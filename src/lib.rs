//! Live-connection and message-delivery core of a chat backend: in-memory
//! registries of active sockets (per room and per one-to-one conversation),
//! broadcast fan-out, and the `sent -> delivered -> read` status machine for
//! direct messages. User CRUD, search, and profile handling live elsewhere;
//! this crate talks to them through the `store`, `auth`, and `files` seams.

pub mod auth;
pub mod config;
pub mod error;
pub mod files;
pub mod frames;
pub mod registry;
pub mod server;
pub mod store;
