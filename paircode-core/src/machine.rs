//! Connection state machine: one local endpoint, at most one remote
//! connection. The host feeds transport events in; transitions happen
//! synchronously inside the handlers.

use crate::config::Config;
use crate::identity::{self, LocalIdentity};
use crate::protocol::Message;
use crate::transport::{
    ConnId, Connection, Endpoint, Transport, TransportError, TransportErrorKind, TransportEvent,
};
use crate::wire;

/// Connection lifecycle status. Exactly one holds at any observation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Local endpoint not yet open.
    #[default]
    Loading,
    /// Endpoint open, no remote connection.
    Ready,
    /// A connection attempt is in flight (outbound or inbound).
    Pending,
    /// An open, usable connection to exactly one remote peer.
    Connected,
}

/// Who we are connected to. Populated only while `Connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    /// The numeric code the remote shared.
    pub short_id: String,
    /// The remote's full endpoint name.
    pub qualified_id: String,
}

/// All recoverable failures of the machine. None are fatal: connection-level
/// failures resolve back to `Ready` and permit immediate retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("already connected to a peer")]
    AlreadyConnected,
    #[error("machine not initialized")]
    NotInitialized,
    #[error("this peer does not exist or is not reachable")]
    PeerUnreachable,
    #[error("connection attempt timed out")]
    ConnectTimeout,
    #[error("no connection established")]
    NoConnection,
    #[error("connection not ready")]
    ConnectionNotReady,
    #[error("connection closed by remote peer")]
    ConnectionClosed,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("malformed frame: {0}")]
    Decode(String),
}

impl PeerError {
    /// True for the "wrong identifier" case, so UIs can offer a retry
    /// distinct from generic faults.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, PeerError::PeerUnreachable)
    }
}

/// Handle returned by `on_error`; pass to `remove_error_listener` to
/// unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type ErrorListener = Box<dyn FnMut(&PeerError)>;
type SuccessListener = Box<dyn FnMut(&RemotePeer)>;
type DataHandler = Box<dyn FnMut(Message)>;

/// One peer machine. Single-threaded, exclusively owned; not designed for
/// concurrent mutation from multiple callers.
pub struct PeerMachine {
    config: Config,
    identity: Option<LocalIdentity>,
    endpoint: Option<Box<dyn Endpoint>>,
    connection: Option<Box<dyn Connection>>,
    remote: Option<RemotePeer>,
    status: Status,
    tick_count: u64,
    /// Tick at which an in-flight outbound attempt is declared failed.
    connect_deadline: Option<u64>,
    error_listeners: Vec<(SubscriptionId, ErrorListener)>,
    success_listener: Option<SuccessListener>,
    data_handler: Option<DataHandler>,
    next_subscription: u64,
}

impl PeerMachine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            identity: None,
            endpoint: None,
            connection: None,
            remote: None,
            status: Status::Loading,
            tick_count: 0,
            connect_deadline: None,
            error_listeners: Vec::new(),
            success_listener: None,
            data_handler: None,
            next_subscription: 0,
        }
    }

    /// Generate a fresh identity and open the local endpoint. The machine
    /// stays `Loading` until the host delivers `EndpointOpen`. Teardown is
    /// `destroy()`; re-initializing an already-initialized machine is not a
    /// supported use.
    pub fn initialize(&mut self, transport: &mut dyn Transport) -> Result<(), PeerError> {
        let short_id = identity::generate_short_id(self.config.short_id_len);
        self.initialize_with_short_id(transport, short_id)
    }

    /// Like `initialize`, but under a caller-chosen short id (e.g. rejoining
    /// with a previously shared code).
    pub fn initialize_with_short_id(
        &mut self,
        transport: &mut dyn Transport,
        short_id: impl Into<String>,
    ) -> Result<(), PeerError> {
        self.status = Status::Loading;
        let id = LocalIdentity::from_short_id(&self.config.prefix, short_id);
        let endpoint = transport
            .open_endpoint(id.qualified_id())
            .map_err(|e| PeerError::Transport(e.message))?;
        self.endpoint = Some(endpoint);
        self.identity = Some(id);
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn short_id(&self) -> Option<&str> {
        self.identity.as_ref().map(LocalIdentity::short_id)
    }

    pub fn qualified_id(&self) -> Option<&str> {
        self.identity.as_ref().map(LocalIdentity::qualified_id)
    }

    pub fn remote(&self) -> Option<&RemotePeer> {
        self.remote.as_ref()
    }

    pub fn remote_short_id(&self) -> Option<&str> {
        self.remote.as_ref().map(|r| r.short_id.as_str())
    }

    /// Start an outbound connection to the peer behind `remote_short_id`.
    ///
    /// Fails synchronously (without touching identity, remote info or the
    /// transport) if a connection is already held. Every later failure of
    /// the attempt arrives through the error registry instead.
    pub fn connect(&mut self, remote_short_id: &str) -> Result<(), PeerError> {
        if self.connection.is_some() {
            return Err(PeerError::AlreadyConnected);
        }
        let remote_qualified = identity::qualify(&self.config.prefix, remote_short_id);
        let Some(endpoint) = self.endpoint.as_mut() else {
            return Err(PeerError::NotInitialized);
        };
        self.status = Status::Pending;
        match endpoint.connect(&remote_qualified) {
            Some(conn) => {
                tracing::debug!(remote = %remote_qualified, conn = conn.id(), "connecting");
                self.connection = Some(conn);
                self.connect_deadline =
                    Some(self.tick_count + self.config.connect_timeout_ticks);
                Ok(())
            }
            None => {
                self.status = Status::Ready;
                self.report(PeerError::PeerUnreachable);
                Ok(())
            }
        }
    }

    /// Send a message to the connected peer. Permitted only while
    /// `Connected`; otherwise the failure is reported and returned, and no
    /// transport action happens.
    pub fn send(&mut self, msg: &Message) -> Result<(), PeerError> {
        if self.connection.is_none() {
            let err = PeerError::NoConnection;
            self.report(err.clone());
            return Err(err);
        }
        if self.status != Status::Connected {
            let err = PeerError::ConnectionNotReady;
            self.report(err.clone());
            return Err(err);
        }
        let frame = match wire::encode_frame(msg) {
            Ok(f) => f,
            Err(e) => {
                let err = PeerError::Encode(e.to_string());
                self.report(err.clone());
                return Err(err);
            }
        };
        let send_result = match self.connection.as_mut() {
            Some(conn) => conn.send(&frame),
            None => return Err(PeerError::NoConnection),
        };
        if let Err(e) = send_result {
            let err = PeerError::Transport(e.message);
            self.report(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Register the single data handler. Inbound frames are decoded and
    /// delivered to it for as long as it stays registered, across
    /// reconnects; registering again replaces it.
    pub fn set_data_handler(&mut self, handler: impl FnMut(Message) + 'static) {
        self.data_handler = Some(Box::new(handler));
    }

    /// Register an error listener. All listeners are invoked in registration
    /// order for every error event; with none registered, errors are only
    /// logged, never thrown.
    pub fn on_error(&mut self, listener: impl FnMut(&PeerError) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.error_listeners.push((id, Box::new(listener)));
        id
    }

    /// Unsubscribe an error listener. Returns false if it was already gone.
    pub fn remove_error_listener(&mut self, id: SubscriptionId) -> bool {
        let before = self.error_listeners.len();
        self.error_listeners.retain(|(sid, _)| *sid != id);
        self.error_listeners.len() != before
    }

    /// Register the single success listener, invoked once per transition
    /// into `Connected`.
    pub fn on_success(&mut self, listener: impl FnMut(&RemotePeer) + 'static) {
        self.success_listener = Some(Box::new(listener));
    }

    /// Close the held connection, if any, and return to `Ready`.
    pub fn disconnect(&mut self) {
        if self.connection.is_some() {
            self.reset_connection();
        }
    }

    /// Disconnect, then release the local endpoint. Terminal: the machine
    /// must not be reused afterward.
    pub fn destroy(&mut self) {
        self.disconnect();
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.destroy();
        }
        self.identity = None;
    }

    /// Advance the tick clock and fail a still-pending connection attempt
    /// whose deadline has passed. Hosts call this roughly once per second.
    pub fn tick(&mut self) {
        self.tick_count += 1;
        let Some(deadline) = self.connect_deadline else {
            return;
        };
        // Re-verify PENDING: a timer surviving past open must not tear down
        // an established connection.
        if self.status != Status::Pending {
            self.connect_deadline = None;
            return;
        }
        if self.tick_count >= deadline {
            self.connect_deadline = None;
            self.reset_connection();
            self.report(PeerError::ConnectTimeout);
        }
    }

    /// Dispatch one transport event to the matching handler.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::EndpointOpen => self.on_endpoint_open(),
            TransportEvent::EndpointError(e) => self.on_endpoint_error(e),
            TransportEvent::IncomingConnection(conn) => self.on_incoming_connection(conn),
            TransportEvent::ConnectionOpen { conn } => self.on_connection_open(conn),
            TransportEvent::ConnectionClosed { conn } => self.on_connection_closed(conn),
            TransportEvent::ConnectionError { conn, message } => {
                self.on_connection_error(conn, message)
            }
            TransportEvent::Data { conn, payload } => self.on_data(conn, &payload),
        }
    }

    /// The local endpoint finished opening.
    pub fn on_endpoint_open(&mut self) {
        if self.status == Status::Loading {
            tracing::debug!(id = ?self.qualified_id(), "endpoint open");
            self.status = Status::Ready;
        }
    }

    /// Endpoint-level fault. The unreachable kind fails the in-flight
    /// attempt and resets to `Ready`; anything else is reported without
    /// touching an established connection.
    pub fn on_endpoint_error(&mut self, error: TransportError) {
        match error.kind {
            TransportErrorKind::PeerUnreachable => {
                if self.connection.is_some() {
                    self.reset_connection();
                } else if self.status == Status::Pending {
                    self.status = Status::Ready;
                }
                self.report(PeerError::PeerUnreachable);
            }
            TransportErrorKind::Other => {
                self.report(PeerError::Transport(error.message));
            }
        }
    }

    /// A remote peer dialed us. A second attempt while one connection is
    /// held is expected contention: it is closed and otherwise ignored.
    pub fn on_incoming_connection(&mut self, mut conn: Box<dyn Connection>) {
        if self.connection.is_some() {
            conn.close();
            return;
        }
        tracing::debug!(remote = conn.remote_id(), "incoming connection");
        self.connection = Some(conn);
        self.status = Status::Pending;
    }

    /// The held connection finished opening.
    pub fn on_connection_open(&mut self, conn: ConnId) {
        let qualified_id = match self.connection.as_ref() {
            Some(held) if held.id() == conn => held.remote_id().to_string(),
            _ => return,
        };
        self.connect_deadline = None;
        self.status = Status::Connected;
        let short_id = identity::extract_short_id(&qualified_id)
            .unwrap_or_default()
            .to_string();
        let remote = RemotePeer {
            short_id,
            qualified_id,
        };
        tracing::debug!(remote = %remote.qualified_id, "connected");
        self.remote = Some(remote.clone());
        if let Some(listener) = self.success_listener.as_mut() {
            listener(&remote);
        }
    }

    /// The held connection was closed by the remote side.
    pub fn on_connection_closed(&mut self, conn: ConnId) {
        if !self.holds(conn) {
            return;
        }
        self.report(PeerError::ConnectionClosed);
        self.reset_connection();
    }

    /// The held connection failed.
    pub fn on_connection_error(&mut self, conn: ConnId, message: String) {
        if !self.holds(conn) {
            return;
        }
        self.report(PeerError::Connection(message));
        self.reset_connection();
    }

    /// Bytes arrived on the held connection: decode and hand the message to
    /// the registered data handler.
    pub fn on_data(&mut self, conn: ConnId, bytes: &[u8]) {
        if !self.holds(conn) {
            return;
        }
        match wire::decode_frame(bytes) {
            Ok((msg, _)) => {
                if let Some(handler) = self.data_handler.as_mut() {
                    handler(msg);
                } else {
                    tracing::debug!("inbound message dropped: no data handler registered");
                }
            }
            Err(e) => self.report(PeerError::Decode(e.to_string())),
        }
    }

    fn holds(&self, conn: ConnId) -> bool {
        self.connection.as_ref().map(|c| c.id()) == Some(conn)
    }

    /// Close and drop the held connection; clear remote info; back to Ready.
    fn reset_connection(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
        self.connect_deadline = None;
        self.remote = None;
        self.status = Status::Ready;
    }

    fn report(&mut self, err: PeerError) {
        if self.error_listeners.is_empty() {
            tracing::error!(error = %err, "peer error (no listener registered)");
            return;
        }
        for (_, listener) in self.error_listeners.iter_mut() {
            listener(&err);
        }
    }
}
