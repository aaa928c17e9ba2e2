//! Chunked file transfer: fragment outgoing files into bounded chunks,
//! reassemble incoming fragments losslessly, report progress.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::machine::PeerError;
use crate::protocol::{FileChunk, Message};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024; // 64 KiB

/// Number of chunks a `total_size`-byte file splits into.
pub fn chunk_count(total_size: usize, chunk_size: usize) -> u32 {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    total_size.div_ceil(size) as u32
}

/// A complete file as it crosses the transfer layer: what the sender hands
/// in and what the receiver emits on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    pub name: String,
    /// MIME type string.
    pub media_type: String,
    pub bytes: Vec<u8>,
}

type ProgressListener = Box<dyn FnMut(Uuid, &str, f64)>;
type CompleteListener = Box<dyn FnMut(&FileData)>;

/// Sender side: splits files into chunk messages and pushes them through a
/// send primitive in index order, one file at a time.
///
/// Register listeners before calling `send_files`; emission is synchronous,
/// so later registrations would never observe anything.
pub struct FileSender {
    chunk_size: usize,
    progress_listeners: Vec<ProgressListener>,
    complete_listeners: Vec<CompleteListener>,
}

impl FileSender {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            chunk_size,
            progress_listeners: Vec::new(),
            complete_listeners: Vec::new(),
        }
    }

    /// Invoked after every chunk with `(transfer_id, file_name, percent)`;
    /// percent is monotonically non-decreasing and reaches exactly 100.
    pub fn on_progress(&mut self, listener: impl FnMut(Uuid, &str, f64) + 'static) {
        self.progress_listeners.push(Box::new(listener));
    }

    /// Invoked once per file after its final chunk, with the full original
    /// file descriptor.
    pub fn on_complete(&mut self, listener: impl FnMut(&FileData) + 'static) {
        self.complete_listeners.push(Box::new(listener));
    }

    /// Send each file independently: fresh transfer id, fixed-size chunks
    /// emitted in index order through `send` (last chunk may be shorter).
    /// An empty file produces no wire traffic and completes immediately.
    /// A failing send aborts the remaining chunks of that file and
    /// propagates the error.
    pub fn send_files(
        &mut self,
        files: &[FileData],
        send: &mut dyn FnMut(Message) -> Result<(), PeerError>,
    ) -> Result<(), PeerError> {
        for file in files {
            self.send_one(file, send)?;
        }
        Ok(())
    }

    fn send_one(
        &mut self,
        file: &FileData,
        send: &mut dyn FnMut(Message) -> Result<(), PeerError>,
    ) -> Result<(), PeerError> {
        let transfer_id = Uuid::new_v4();
        let total_size = file.bytes.len();
        let total_chunks = chunk_count(total_size, self.chunk_size);

        let mut sent = 0usize;
        for (chunk_index, piece) in file.bytes.chunks(self.chunk_size).enumerate() {
            send(Message::FileChunk(FileChunk {
                transfer_id,
                file_name: file.name.clone(),
                file_type: file.media_type.clone(),
                chunk_index: chunk_index as u32,
                total_chunks,
                payload: piece.to_vec(),
            }))?;
            sent += piece.len();
            let percent = (sent as f64 / total_size as f64 * 100.0).min(100.0);
            for listener in self.progress_listeners.iter_mut() {
                listener(transfer_id, &file.name, percent);
            }
        }

        if total_size == 0 {
            // Nothing to put on the wire; complete locally.
            for listener in self.progress_listeners.iter_mut() {
                listener(transfer_id, &file.name, 100.0);
            }
        }
        for listener in self.complete_listeners.iter_mut() {
            listener(file);
        }
        Ok(())
    }
}

impl Default for FileSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunk metadata disagreed with the transfer it claims to belong to. The
/// offending message is ignored; the transfer itself stays intact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("transfer {transfer_id}: total_chunks {got} disagrees with first-seen {expected}")]
    TotalChunksMismatch {
        transfer_id: Uuid,
        expected: u32,
        got: u32,
    },
    #[error("transfer {transfer_id}: chunk index {index} out of range (total {total})")]
    ChunkIndexOutOfRange {
        transfer_id: Uuid,
        index: u32,
        total: u32,
    },
}

/// Per-transfer reassembly buffer. Slots are addressed by chunk index, so
/// arrival order does not matter.
struct ReceiveBuffer {
    file_name: String,
    file_type: String,
    total_chunks: u32,
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
}

/// Receiver side: collects chunk messages per transfer id and emits the
/// assembled file once every slot is filled.
pub struct ChunkReceiver {
    buffers: HashMap<Uuid, ReceiveBuffer>,
    progress_listeners: Vec<ProgressListener>,
    complete_listeners: Vec<CompleteListener>,
}

impl ChunkReceiver {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            progress_listeners: Vec::new(),
            complete_listeners: Vec::new(),
        }
    }

    /// Invoked after every accepted chunk with
    /// `(transfer_id, file_name, round(filled/total*100))`.
    pub fn on_progress(&mut self, listener: impl FnMut(Uuid, &str, f64) + 'static) {
        self.progress_listeners.push(Box::new(listener));
    }

    /// Invoked with the assembled file once a transfer completes. The
    /// buffer and its metadata are discarded afterwards.
    pub fn on_complete(&mut self, listener: impl FnMut(&FileData) + 'static) {
        self.complete_listeners.push(Box::new(listener));
    }

    /// Number of transfers currently being reassembled.
    pub fn in_flight(&self) -> usize {
        self.buffers.len()
    }

    /// Process one chunk message. The first chunk seen for a transfer id
    /// fixes its metadata; later chunks that disagree are ignored and
    /// returned as an error. A duplicate index overwrites the slot without
    /// double-counting it.
    pub fn handle_chunk(&mut self, chunk: FileChunk) -> Result<(), TransferError> {
        let FileChunk {
            transfer_id,
            file_name,
            file_type,
            chunk_index,
            total_chunks,
            payload,
        } = chunk;

        let buffer = self.buffers.entry(transfer_id).or_insert_with(|| ReceiveBuffer {
            file_name,
            file_type,
            total_chunks,
            slots: vec![None; total_chunks as usize],
            filled: 0,
        });

        if buffer.total_chunks != total_chunks {
            let err = TransferError::TotalChunksMismatch {
                transfer_id,
                expected: buffer.total_chunks,
                got: total_chunks,
            };
            tracing::warn!(error = %err, "ignoring chunk");
            return Err(err);
        }
        if chunk_index >= buffer.total_chunks {
            let err = TransferError::ChunkIndexOutOfRange {
                transfer_id,
                index: chunk_index,
                total: buffer.total_chunks,
            };
            tracing::warn!(error = %err, "ignoring chunk");
            // A first-seen message with no valid slot leaves nothing to wait for.
            if buffer.filled == 0 && buffer.slots.iter().all(Option::is_none) {
                self.buffers.remove(&transfer_id);
            }
            return Err(err);
        }

        let slot = &mut buffer.slots[chunk_index as usize];
        if slot.is_none() {
            buffer.filled += 1;
        }
        *slot = Some(payload);

        let percent = (buffer.filled as f64 / buffer.total_chunks as f64 * 100.0).round();
        let name = buffer.file_name.clone();
        for listener in self.progress_listeners.iter_mut() {
            listener(transfer_id, &name, percent);
        }

        if buffer.filled == buffer.total_chunks as usize {
            let Some(buffer) = self.buffers.remove(&transfer_id) else {
                return Ok(());
            };
            let mut bytes =
                Vec::with_capacity(buffer.slots.iter().flatten().map(Vec::len).sum());
            for slot in buffer.slots.into_iter().flatten() {
                bytes.extend_from_slice(&slot);
            }
            let file = FileData {
                name: buffer.file_name,
                media_type: buffer.file_type,
                bytes,
            };
            for listener in self.complete_listeners.iter_mut() {
                listener(&file);
            }
        }
        Ok(())
    }
}

impl Default for ChunkReceiver {
    fn default() -> Self {
        Self::new()
    }
}

/// Write an assembled file into `dir` under its own (sanitized) name.
/// Plumbing for hosts that want a save-to-disk action.
pub fn save_to_dir(file: &FileData, dir: &Path) -> std::io::Result<PathBuf> {
    let name = Path::new(&file.name)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "received.bin".into());
    let path = dir.join(name);
    std::fs::write(&path, &file.bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const C: usize = DEFAULT_CHUNK_SIZE;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn file(len: usize) -> FileData {
        FileData {
            name: "sample.bin".into(),
            media_type: "application/octet-stream".into(),
            bytes: patterned(len),
        }
    }

    fn collect_chunks(file: &FileData, chunk_size: usize) -> Vec<FileChunk> {
        let mut sender = FileSender::with_chunk_size(chunk_size);
        let chunks = Rc::new(RefCell::new(Vec::new()));
        let sink = chunks.clone();
        let mut send = move |msg: Message| -> Result<(), PeerError> {
            match msg {
                Message::FileChunk(c) => sink.borrow_mut().push(c),
                Message::Data(_) => panic!("sender must only emit chunks"),
            }
            Ok(())
        };
        sender.send_files(std::slice::from_ref(file), &mut send).unwrap();
        let out = chunks.borrow().clone();
        out
    }

    #[test]
    fn chunk_count_boundaries() {
        for (size, expect) in [
            (0usize, 0u32),
            (1, 1),
            (C - 1, 1),
            (C, 1),
            (C + 1, 2),
            (10 * C, 10),
        ] {
            assert_eq!(chunk_count(size, C), expect, "size {size}");
        }
    }

    #[test]
    fn chunk_count_zero_chunk_size_uses_default() {
        assert_eq!(chunk_count(2 * C, 0), 2);
    }

    #[test]
    fn sender_emits_expected_chunk_sizes() {
        // 200000 bytes at 65536 per chunk: 65536, 65536, 65536, 3392.
        let f = file(200_000);
        let chunks = collect_chunks(&f, 65_536);
        assert_eq!(chunks.len(), 4);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.payload.len()).collect();
        assert_eq!(sizes, vec![65_536, 65_536, 65_536, 3_392]);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as u32);
            assert_eq!(c.total_chunks, 4);
            assert_eq!(c.transfer_id, chunks[0].transfer_id);
            assert_eq!(c.file_name, "sample.bin");
        }
    }

    #[test]
    fn sender_progress_monotonic_to_100() {
        let f = file(10 * C + 7);
        let mut sender = FileSender::with_chunk_size(C);
        let progress = Rc::new(RefCell::new(Vec::new()));
        let sink = progress.clone();
        sender.on_progress(move |_, _, p| sink.borrow_mut().push(p));
        let mut send = |_: Message| -> Result<(), PeerError> { Ok(()) };
        sender.send_files(&[f], &mut send).unwrap();

        let p = progress.borrow();
        assert_eq!(p.len(), 11);
        assert!(p.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*p.last().unwrap(), 100.0);
    }

    #[test]
    fn sender_completion_carries_full_bytes() {
        let f = file(3 * C + 5);
        let mut sender = FileSender::with_chunk_size(C);
        let done = Rc::new(RefCell::new(Vec::new()));
        let sink = done.clone();
        sender.on_complete(move |fd| sink.borrow_mut().push(fd.clone()));
        let mut send = |_: Message| -> Result<(), PeerError> { Ok(()) };
        sender.send_files(std::slice::from_ref(&f), &mut send).unwrap();

        let done = done.borrow();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0], f);
    }

    #[test]
    fn empty_file_completes_without_wire_traffic() {
        let f = file(0);
        let mut sender = FileSender::with_chunk_size(C);
        let progress = Rc::new(RefCell::new(Vec::new()));
        let done = Rc::new(RefCell::new(0u32));
        let (ps, ds) = (progress.clone(), done.clone());
        sender.on_progress(move |_, _, p| ps.borrow_mut().push(p));
        sender.on_complete(move |_| *ds.borrow_mut() += 1);
        let sent = Rc::new(RefCell::new(0u32));
        let ss = sent.clone();
        let mut send = move |_: Message| -> Result<(), PeerError> {
            *ss.borrow_mut() += 1;
            Ok(())
        };
        sender.send_files(&[f], &mut send).unwrap();

        assert_eq!(*sent.borrow(), 0);
        assert_eq!(progress.borrow().as_slice(), &[100.0]);
        assert_eq!(*done.borrow(), 1);
    }

    #[test]
    fn send_failure_aborts_file() {
        let f = file(4 * C);
        let mut sender = FileSender::with_chunk_size(C);
        let done = Rc::new(RefCell::new(0u32));
        let ds = done.clone();
        sender.on_complete(move |_| *ds.borrow_mut() += 1);
        let mut calls = 0;
        let mut send = move |_: Message| -> Result<(), PeerError> {
            calls += 1;
            if calls == 2 {
                Err(PeerError::NoConnection)
            } else {
                Ok(())
            }
        };
        let err = sender.send_files(&[f], &mut send).unwrap_err();
        assert_eq!(err, PeerError::NoConnection);
        assert_eq!(*done.borrow(), 0);
    }

    #[test]
    fn roundtrip_boundary_sizes() {
        for size in [0usize, 1, C - 1, C, C + 1, 10 * C] {
            let f = file(size);
            let chunks = collect_chunks(&f, C);
            assert_eq!(chunks.len(), chunk_count(size, C) as usize);

            let mut receiver = ChunkReceiver::new();
            let out = Rc::new(RefCell::new(Vec::new()));
            let sink = out.clone();
            receiver.on_complete(move |fd| sink.borrow_mut().push(fd.clone()));
            for c in chunks {
                receiver.handle_chunk(c).unwrap();
            }
            if size == 0 {
                // Empty files never cross the wire; sender completes locally.
                assert!(out.borrow().is_empty());
            } else {
                assert_eq!(out.borrow().as_slice(), &[f]);
                assert_eq!(receiver.in_flight(), 0);
            }
        }
    }

    #[test]
    fn out_of_order_arrival_reassembles_correctly() {
        let f = file(3 * C + 100);
        let mut chunks = collect_chunks(&f, C);
        chunks.swap(0, 2); // deliver 2, 1, 0, 3

        let mut receiver = ChunkReceiver::new();
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = out.clone();
        receiver.on_complete(move |fd| sink.borrow_mut().push(fd.clone()));
        for c in chunks {
            receiver.handle_chunk(c).unwrap();
        }
        assert_eq!(out.borrow().as_slice(), &[f]);
    }

    #[test]
    fn duplicate_chunk_does_not_double_count() {
        let f = file(2 * C);
        let chunks = collect_chunks(&f, C);

        let mut receiver = ChunkReceiver::new();
        let progress = Rc::new(RefCell::new(Vec::new()));
        let out = Rc::new(RefCell::new(Vec::new()));
        let (ps, os) = (progress.clone(), out.clone());
        receiver.on_progress(move |_, _, p| ps.borrow_mut().push(p));
        receiver.on_complete(move |fd| os.borrow_mut().push(fd.clone()));

        receiver.handle_chunk(chunks[0].clone()).unwrap();
        receiver.handle_chunk(chunks[0].clone()).unwrap(); // last write wins
        assert!(out.borrow().is_empty());
        assert_eq!(progress.borrow().as_slice(), &[50.0, 50.0]);

        receiver.handle_chunk(chunks[1].clone()).unwrap();
        assert_eq!(out.borrow().as_slice(), &[f]);
        assert_eq!(*progress.borrow().last().unwrap(), 100.0);
    }

    #[test]
    fn receiver_progress_monotonic_to_100() {
        let f = file(7 * C);
        let chunks = collect_chunks(&f, C);
        let mut receiver = ChunkReceiver::new();
        let progress = Rc::new(RefCell::new(Vec::new()));
        let ps = progress.clone();
        receiver.on_progress(move |_, _, p| ps.borrow_mut().push(p));
        for c in chunks {
            receiver.handle_chunk(c).unwrap();
        }
        let p = progress.borrow();
        assert!(p.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*p.last().unwrap(), 100.0);
    }

    #[test]
    fn total_chunks_mismatch_ignored_and_reported() {
        let f = file(2 * C);
        let chunks = collect_chunks(&f, C);
        let mut receiver = ChunkReceiver::new();
        let out = Rc::new(RefCell::new(Vec::new()));
        let os = out.clone();
        receiver.on_complete(move |fd| os.borrow_mut().push(fd.clone()));

        receiver.handle_chunk(chunks[0].clone()).unwrap();

        let mut bad = chunks[1].clone();
        bad.total_chunks = 9;
        assert!(matches!(
            receiver.handle_chunk(bad),
            Err(TransferError::TotalChunksMismatch { expected: 2, got: 9, .. })
        ));

        // The transfer still completes once the honest chunk arrives.
        receiver.handle_chunk(chunks[1].clone()).unwrap();
        assert_eq!(out.borrow().as_slice(), &[f]);
    }

    #[test]
    fn chunk_index_out_of_range_rejected() {
        let f = file(2 * C);
        let chunks = collect_chunks(&f, C);
        let mut receiver = ChunkReceiver::new();
        receiver.handle_chunk(chunks[0].clone()).unwrap();

        let mut bad = chunks[1].clone();
        bad.chunk_index = 5;
        assert!(matches!(
            receiver.handle_chunk(bad),
            Err(TransferError::ChunkIndexOutOfRange { index: 5, total: 2, .. })
        ));
        assert_eq!(receiver.in_flight(), 1);
    }

    #[test]
    fn concurrent_transfers_keep_separate_buffers() {
        let a = FileData {
            name: "a.txt".into(),
            media_type: "text/plain".into(),
            bytes: patterned(2 * C),
        };
        let b = FileData {
            name: "b.txt".into(),
            media_type: "text/plain".into(),
            bytes: patterned(C + 3),
        };
        let ca = collect_chunks(&a, C);
        let cb = collect_chunks(&b, C);

        let mut receiver = ChunkReceiver::new();
        let out = Rc::new(RefCell::new(Vec::new()));
        let os = out.clone();
        receiver.on_complete(move |fd| os.borrow_mut().push(fd.clone()));

        // Interleave the two transfers.
        receiver.handle_chunk(ca[0].clone()).unwrap();
        receiver.handle_chunk(cb[1].clone()).unwrap();
        assert_eq!(receiver.in_flight(), 2);
        receiver.handle_chunk(cb[0].clone()).unwrap();
        receiver.handle_chunk(ca[1].clone()).unwrap();

        assert_eq!(out.borrow().as_slice(), &[b, a]);
        assert_eq!(receiver.in_flight(), 0);
    }

    #[test]
    fn save_to_dir_strips_path_components() {
        let dir = std::env::temp_dir().join(format!("paircode-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let f = FileData {
            name: "../sneaky/name.txt".into(),
            media_type: "text/plain".into(),
            bytes: b"payload".to_vec(),
        };
        let path = save_to_dir(&f, &dir).unwrap();
        assert_eq!(path, dir.join("name.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
