pub mod canonical;
pub mod error;
pub mod messaging;
pub mod replay;
pub mod session;

pub use error::ProtocolError;
pub use messaging::{
    DirectoryEntry, Frame, Payload, ServerMessage, SignedEnvelope, StatusResponse,
};
pub use replay::ReplayGuard;
pub use session::{ClientSession, ReceivedChat};
