//! Pairing-code peer protocol: one machine, one connection, chunked file transfer.
//! Host-driven: no I/O; the host owns the transport and feeds events to the machine.

pub mod config;
pub mod identity;
pub mod machine;
pub mod memory;
pub mod protocol;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use identity::LocalIdentity;
pub use machine::{PeerError, PeerMachine, RemotePeer, Status};
pub use protocol::{FileChunk, Message};
pub use transfer::{ChunkReceiver, FileData, FileSender, TransferError};
pub use transport::{
    ConnId, Connection, Endpoint, Transport, TransportError, TransportErrorKind, TransportEvent,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
