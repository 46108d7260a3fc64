//! LAN peer overlay: discovery, sessions, routing and file transfer

pub mod access;
pub mod codec;
pub mod connection;
pub mod discovery;
pub mod history;
pub mod message;
pub mod peer;
pub mod protocol;
pub mod router;
pub mod transfer;
pub mod types;

// Re-exports
pub use access::{AccessControl, AccessList};
pub use codec::{CodecError, JsonCodec};
pub use connection::Outbound;
pub use discovery::{classify, DiscoveryAction};
pub use history::{ChatHistory, ChatMessage};
pub use message::{
    ChatBody, DiscoveryKind, DiscoveryPacket, Envelope, FileChunk, FileTransferRequest,
    FileTransferResponse, MessageKind, Payload, PayloadError,
};
pub use peer::{Peer, PeerInfo, PeerTable};
pub use protocol::{NetConfig, NetError, NetEvent, Network};
pub use router::{DECRYPT_FAILED_PLACEHOLDER, NO_SESSION_KEY_PLACEHOLDER};
pub use transfer::{
    new_file_id, sanitize_file_name, total_chunks, ChunkOutcome, Direction, TransferRecord,
    TransferStatus, TransferTable,
};
pub use types::*;
