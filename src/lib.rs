pub mod cli;
pub mod crypto;
pub mod net;

pub use crypto::{CryptoError, EphemeralKeyPair, SharedSecret};
pub use net::{NetConfig, NetError, NetEvent, Network, PeerInfo, TransferRecord, TransferStatus};
