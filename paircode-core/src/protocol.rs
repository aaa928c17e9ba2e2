//! Message types crossing the connection. Encoding is bincode; framing is
//! length-prefix (see wire module).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything a peer may send over an open connection. Chunk messages are
/// recognized and consumed by the transfer layer; any other variant is
/// passed through untouched to the generic data handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Arbitrary application payload.
    Data(Vec<u8>),
    /// One fragment of a chunked file transfer.
    FileChunk(FileChunk),
}

/// A bounded-size fragment of one file, addressed by zero-based index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Transfer this fragment belongs to.
    pub transfer_id: Uuid,
    pub file_name: String,
    /// MIME type reported by the sender.
    pub file_type: String,
    /// Index in `[0, total_chunks)`.
    pub chunk_index: u32,
    /// Fixed at first sight for a transfer; every later chunk must agree.
    pub total_chunks: u32,
    pub payload: Vec<u8>,
}
