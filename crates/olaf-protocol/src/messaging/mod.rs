pub mod envelope;
pub mod receiver;
pub mod sender;

pub use envelope::{
    ChatMessage, DirectoryEntry, Frame, Hello, Payload, PublicChat, PublicChatDelivery,
    ServerHello, ServerMessage, SignedEnvelope, Status, StatusResponse,
};
pub use receiver::{classify, decode_and_verify, parse_frame, verify_envelope};
pub use sender::{build_envelope, encode_frame, signed_frame};
