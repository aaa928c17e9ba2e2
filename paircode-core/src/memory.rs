//! In-process transport: endpoints and connections living in one thread,
//! wired through a shared hub with a FIFO event queue. Backs the loopback
//! host and the end-to-end tests; real hosts substitute their own adapter.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use crate::transport::{
    ConnId, Connection, Endpoint, Transport, TransportError, TransportEvent,
};

#[derive(Default)]
struct HubState {
    /// Qualified ids with a live endpoint behind them.
    endpoints: HashSet<String>,
    /// Global FIFO keyed by destination endpoint, preserving causal order.
    events: VecDeque<(String, TransportEvent)>,
    next_conn: ConnId,
}

impl HubState {
    fn push(&mut self, endpoint: &str, event: TransportEvent) {
        self.events.push_back((endpoint.to_string(), event));
    }
}

/// The shared medium. Clone handles freely; all clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Rc<RefCell<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued event, in delivery order, paired with the
    /// qualified id of the endpoint it is destined for. Hosts dispatch each
    /// to the machine owning that endpoint.
    pub fn drain_events(&self) -> Vec<(String, TransportEvent)> {
        self.state.borrow_mut().events.drain(..).collect()
    }
}

impl Transport for MemoryHub {
    fn open_endpoint(&mut self, id: &str) -> Result<Box<dyn Endpoint>, TransportError> {
        let mut state = self.state.borrow_mut();
        if !state.endpoints.insert(id.to_string()) {
            return Err(TransportError::other(format!("endpoint id {id} already taken")));
        }
        state.push(id, TransportEvent::EndpointOpen);
        Ok(Box::new(MemoryEndpoint {
            state: self.state.clone(),
            local: id.to_string(),
        }))
    }
}

struct MemoryEndpoint {
    state: Rc<RefCell<HubState>>,
    local: String,
}

impl Endpoint for MemoryEndpoint {
    fn connect(&mut self, remote_id: &str) -> Option<Box<dyn Connection>> {
        let mut state = self.state.borrow_mut();
        state.next_conn += 1;
        let caller_conn = state.next_conn;
        state.next_conn += 1;
        let callee_conn = state.next_conn;

        if !state.endpoints.contains(remote_id) {
            // Nobody behind that id. The connection object exists but its
            // link is dead; the failure surfaces as an endpoint error.
            state.push(
                &self.local,
                TransportEvent::EndpointError(TransportError::unreachable(format!(
                    "no endpoint behind {remote_id}"
                ))),
            );
            return Some(Box::new(MemoryConnection {
                state: self.state.clone(),
                link: Rc::new(RefCell::new(Link { open: false })),
                id: caller_conn,
                peer_conn: callee_conn,
                remote: remote_id.to_string(),
            }));
        }

        let link = Rc::new(RefCell::new(Link { open: true }));
        let callee_side = MemoryConnection {
            state: self.state.clone(),
            link: link.clone(),
            id: callee_conn,
            peer_conn: caller_conn,
            remote: self.local.clone(),
        };
        state.push(remote_id, TransportEvent::IncomingConnection(Box::new(callee_side)));
        state.push(remote_id, TransportEvent::ConnectionOpen { conn: callee_conn });
        state.push(&self.local, TransportEvent::ConnectionOpen { conn: caller_conn });
        Some(Box::new(MemoryConnection {
            state: self.state.clone(),
            link,
            id: caller_conn,
            peer_conn: callee_conn,
            remote: remote_id.to_string(),
        }))
    }

    fn local_id(&self) -> &str {
        &self.local
    }

    fn destroy(&mut self) {
        let mut state = self.state.borrow_mut();
        state.endpoints.remove(&self.local);
        let local = self.local.clone();
        state.events.retain(|(dest, _)| *dest != local);
    }
}

/// State shared by the two sides of one connection.
struct Link {
    open: bool,
}

struct MemoryConnection {
    state: Rc<RefCell<HubState>>,
    link: Rc<RefCell<Link>>,
    id: ConnId,
    /// Conn id the other side knows this connection by.
    peer_conn: ConnId,
    remote: String,
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnId {
        self.id
    }

    fn remote_id(&self) -> &str {
        &self.remote
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.link.borrow().open {
            return Err(TransportError::other("connection is closed"));
        }
        self.state.borrow_mut().push(
            &self.remote,
            TransportEvent::Data {
                conn: self.peer_conn,
                payload: bytes.to_vec(),
            },
        );
        Ok(())
    }

    fn close(&mut self) {
        let mut link = self.link.borrow_mut();
        if !link.open {
            return;
        }
        link.open = false;
        let mut state = self.state.borrow_mut();
        if state.endpoints.contains(&self.remote) {
            state.push(
                &self.remote,
                TransportEvent::ConnectionClosed {
                    conn: self.peer_conn,
                },
            );
        }
    }
}
