//! Transport adapter boundary. The core performs no I/O: hosts implement
//! these traits over whatever signaling/data layer they have, then feed the
//! resulting events into the machine.

/// Host-assigned identifier for one transport-level connection. Events carry
/// it so the machine can ignore stragglers from a connection it no longer
/// holds (a rejected inbound attempt, a torn-down outbound one).
pub type ConnId = u64;

/// Creates local endpoints addressable by qualified id.
pub trait Transport {
    /// Open a local endpoint under `id`. The host later delivers
    /// `EndpointOpen` once the endpoint is reachable.
    fn open_endpoint(&mut self, id: &str) -> Result<Box<dyn Endpoint>, TransportError>;
}

/// One local endpoint: the thing remote peers dial.
pub trait Endpoint {
    /// Start a connection to a remote qualified id. `None` means the
    /// transport could not even produce a connection object; an unreachable
    /// peer may instead surface later as an `EndpointError` with the
    /// `PeerUnreachable` kind.
    fn connect(&mut self, remote_id: &str) -> Option<Box<dyn Connection>>;

    /// The qualified id this endpoint was opened under.
    fn local_id(&self) -> &str;

    /// Release the endpoint. No further events may be delivered for it.
    fn destroy(&mut self);
}

/// One transport-level connection to a single remote peer.
pub trait Connection {
    fn id(&self) -> ConnId;

    /// Qualified id of the remote endpoint.
    fn remote_id(&self) -> &str;

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    fn close(&mut self);
}

/// Kind tag so callers can tell "peer not found" from generic faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The dialed id has no reachable endpoint behind it.
    PeerUnreachable,
    Other,
}

/// A transport-level fault: kind tag plus human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::PeerUnreachable,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Other,
            message: message.into(),
        }
    }
}

/// Everything a transport can tell the machine. The host drains these from
/// its transport and dispatches them via `PeerMachine::handle_event`.
pub enum TransportEvent {
    /// The local endpoint is open and reachable.
    EndpointOpen,
    /// Endpoint-level fault (not tied to one connection).
    EndpointError(TransportError),
    /// A remote peer dialed us; ownership of the connection moves to the machine.
    IncomingConnection(Box<dyn Connection>),
    /// The identified connection finished opening.
    ConnectionOpen { conn: ConnId },
    /// The identified connection was closed by the remote side.
    ConnectionClosed { conn: ConnId },
    /// The identified connection failed.
    ConnectionError { conn: ConnId, message: String },
    /// Bytes arrived on the identified connection.
    Data { conn: ConnId, payload: Vec<u8> },
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::EndpointOpen => write!(f, "EndpointOpen"),
            TransportEvent::EndpointError(e) => write!(f, "EndpointError({e:?})"),
            TransportEvent::IncomingConnection(c) => {
                write!(f, "IncomingConnection(conn={}, remote={})", c.id(), c.remote_id())
            }
            TransportEvent::ConnectionOpen { conn } => write!(f, "ConnectionOpen({conn})"),
            TransportEvent::ConnectionClosed { conn } => write!(f, "ConnectionClosed({conn})"),
            TransportEvent::ConnectionError { conn, message } => {
                write!(f, "ConnectionError({conn}, {message:?})")
            }
            TransportEvent::Data { conn, payload } => {
                write!(f, "Data({conn}, {} bytes)", payload.len())
            }
        }
    }
}
