// Loopback host: pairs two machines over the in-memory transport and pushes
// a file through the chunked transfer protocol, end to end in one process.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use paircode_core::memory::MemoryHub;
use paircode_core::transfer::{self, ChunkReceiver, FileData, FileSender};
use paircode_core::{Config, Message, PeerError, PeerMachine, Status};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut file_arg: Option<PathBuf> = None;
    let mut out_dir = PathBuf::from(".");
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("paircode-local {}", VERSION);
                return Ok(());
            }
            "--out" => {
                out_dir = PathBuf::from(args.next().ok_or("--out needs a directory")?);
            }
            _ => file_arg = Some(PathBuf::from(arg)),
        }
    }
    let path = file_arg.ok_or("usage: paircode-local [--out DIR] <file>")?;

    let config = paircode_core::config::load();
    let chunk_size = config.chunk_size;

    let mut hub = MemoryHub::new();
    let mut sender_machine = PeerMachine::new(config.clone());
    let mut receiver_machine = PeerMachine::new(config);
    sender_machine.initialize(&mut hub)?;
    receiver_machine.initialize(&mut hub)?;
    pump(&hub, &mut sender_machine, &mut receiver_machine);

    let code = receiver_machine
        .short_id()
        .ok_or("receiver has no identity")?
        .to_string();
    tracing::info!(code = %code, "receiver is ready; dialing");

    sender_machine.connect(&code)?;
    pump(&hub, &mut sender_machine, &mut receiver_machine);
    if sender_machine.status() != Status::Connected {
        return Err("machines failed to pair".into());
    }
    tracing::info!(
        local = sender_machine.short_id().unwrap_or_default(),
        remote = sender_machine.remote_short_id().unwrap_or_default(),
        "paired"
    );

    // Receiving side: feed chunk messages into the reassembler.
    let receiver = Rc::new(RefCell::new(ChunkReceiver::new()));
    let received: Rc<RefCell<Vec<FileData>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    receiver
        .borrow_mut()
        .on_complete(move |f| sink.borrow_mut().push(f.clone()));
    receiver.borrow_mut().on_progress(|_, name, percent| {
        tracing::info!(file = name, percent, "receiving");
    });
    let rx = receiver.clone();
    receiver_machine.set_data_handler(move |msg| match msg {
        Message::FileChunk(chunk) => {
            if let Err(e) = rx.borrow_mut().handle_chunk(chunk) {
                tracing::warn!(error = %e, "chunk rejected");
            }
        }
        Message::Data(bytes) => {
            tracing::info!(len = bytes.len(), "plain message received");
        }
    });

    let file = FileData {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file.bin".into()),
        media_type: mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
        bytes: std::fs::read(&path)?,
    };
    let size = file.bytes.len();

    let mut file_sender = FileSender::with_chunk_size(chunk_size);
    file_sender.on_progress(|_, name, percent| {
        tracing::info!(file = name, percent, "sending");
    });
    {
        let machine = &mut sender_machine;
        let mut send = |msg: Message| -> Result<(), PeerError> { machine.send(&msg) };
        file_sender.send_files(std::slice::from_ref(&file), &mut send)?;
    }
    pump(&hub, &mut sender_machine, &mut receiver_machine);

    let received = received.borrow();
    let assembled = received.first().ok_or("transfer did not complete")?;
    if assembled.bytes != file.bytes {
        return Err("received bytes differ from source".into());
    }
    let saved = transfer::save_to_dir(assembled, &out_dir)?;
    println!(
        "{} ({} bytes, {}) delivered to {}",
        assembled.name,
        size,
        assembled.media_type,
        saved.display()
    );

    sender_machine.destroy();
    receiver_machine.destroy();
    Ok(())
}

/// Deliver queued hub events to whichever machine owns the endpoint, until
/// the hub runs dry.
fn pump(hub: &MemoryHub, a: &mut PeerMachine, b: &mut PeerMachine) {
    loop {
        let events = hub.drain_events();
        if events.is_empty() {
            break;
        }
        for (endpoint, event) in events {
            if a.qualified_id() == Some(endpoint.as_str()) {
                a.handle_event(event);
            } else if b.qualified_id() == Some(endpoint.as_str()) {
                b.handle_event(event);
            }
        }
    }
}
