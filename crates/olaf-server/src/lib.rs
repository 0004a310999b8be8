//! OLAF neighbourhood server.
//!
//! Hosts clients over WebSocket, authenticates their signed envelopes,
//! routes public and private chat, and federates its client directory with
//! neighbour servers.

pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod federation;
pub mod registry;
pub mod router;
pub mod server_state;

pub use config::{load_config, Config, ConfigError};
pub use connection::serve;
pub use directory::Directory;
pub use error::ServerError;
pub use federation::{spawn_neighbour_links, PeerLinks};
pub use registry::{ConnectionHandle, Registry};
pub use server_state::ServerState;
