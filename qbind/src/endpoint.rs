//! Endpoint: routes datagrams to connections.
//!
//! Connections live in a slab arena. Every connection ID a connection
//! answers to (its source IDs, plus the client's original destination ID
//! for server connections) maps to its slab key. Datagrams whose
//! destination ID is unknown may open a new server connection; datagrams
//! carrying an unsupported version get a Version Negotiation outcome and
//! create no state. Short headers for unknown IDs are answered with a
//! stateless reset when they are large enough.
//!
//! The endpoint does no socket I/O. The host feeds `handle_datagram`, sends
//! what `poll_transmit` returns and calls `on_timeout` at `next_timeout`.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use core::time::Duration;
use crossbeam_channel::{bounded, Receiver, Sender};
use qbind_quic::{
    Connection, ConnectionId, EngineError, Instant, PacketEngine, Side, TransportParameters,
};
use slab::Slab;
use tracing::{debug, info, trace, warn};

use crate::bridge::{ChannelHandler, EndpointEvent};
use crate::cid::CidGenerator;
use crate::config::EndpointConfig;
use crate::error::{EndpointError, Result};

/// Smallest datagram that may carry a client Initial (RFC 9000 Section 14.1)
pub const MIN_INITIAL_SIZE: usize = 1200;

/// Stable reference to a connection inside an [`Endpoint`].
///
/// Handles are slab keys and may be reused after the connection is reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub usize);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Version-independent header fields (RFC 8999)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramHeader {
    /// None for short-header packets
    pub version: Option<u32>,
    pub dcid: ConnectionId,
    /// Present on long-header packets
    pub scid: Option<ConnectionId>,
}

/// Creates engine instances and reads the invariant header bytes.
///
/// Each connection gets its own engine; the factory is the only place
/// engine-global setup (TLS contexts, keys) should live.
pub trait EngineFactory {
    type Engine: PacketEngine;

    /// Parse the version and connection IDs of the first packet in a
    /// datagram. `local_cid_len` is the length of IDs this endpoint issues,
    /// needed for short headers.
    fn decode_header(&self, datagram: &[u8], local_cid_len: usize) -> Option<DatagramHeader>;

    /// Whether a datagram with an unknown destination ID may open a new
    /// connection. The default admits long-header datagrams of at least
    /// [`MIN_INITIAL_SIZE`] bytes.
    fn accept(&self, header: &DatagramHeader, datagram: &[u8], _peer: SocketAddr) -> bool {
        header.version.is_some() && datagram.len() >= MIN_INITIAL_SIZE
    }

    fn new_engine(
        &mut self,
        side: Side,
        scid: &ConnectionId,
        dcid: &ConnectionId,
        params: &TransportParameters,
    ) -> std::result::Result<Self::Engine, EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No parseable header
    Unparseable,
    /// Short header for a connection ID nobody owns, not answered with a
    /// stateless reset
    UnknownConnection,
    /// Unsupported version in a datagram too small to answer
    Undersized,
    /// The factory or configuration refused a new connection
    Refused,
    ConnectionLimit,
    /// Routed to a connection that is already closed
    ConnectionClosed,
    /// Connection ID generation or engine creation failed
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramOutcome {
    /// Ingested by an existing connection
    Delivered(ConnectionHandle),
    /// Opened a new server connection and ingested there
    Accepted(ConnectionHandle),
    /// Unsupported version; the host should send Version Negotiation
    /// with these fields
    VersionNegotiation {
        dcid: ConnectionId,
        scid: ConnectionId,
        versions: Vec<u32>,
    },
    /// Unknown connection; the host should send this stateless reset back
    /// to the sender
    StatelessReset(Bytes),
    Dropped(DropReason),
}

/// One outbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub connection: ConnectionHandle,
    pub destination: SocketAddr,
    pub payload: Bytes,
}

struct Entry<E> {
    conn: Connection<E>,
    peer: SocketAddr,
    /// Routing keys currently pointing at this entry
    cids: Vec<ConnectionId>,
}

pub struct Endpoint<F: EngineFactory> {
    config: EndpointConfig,
    factory: F,
    connections: Slab<Entry<F::Engine>>,
    routes: HashMap<ConnectionId, usize>,
    cids: CidGenerator,
    events: Option<Sender<EndpointEvent>>,
}

impl<F: EngineFactory> fmt::Debug for Endpoint<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("connections", &self.connections.len())
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl<F: EngineFactory> Endpoint<F> {
    pub fn new(config: EndpointConfig, factory: F) -> Result<Self> {
        let cids = CidGenerator::new(config.connection.scid_length)?;
        Ok(Self {
            config,
            factory,
            connections: Slab::new(),
            routes: HashMap::new(),
            cids,
            events: None,
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn factory_mut(&mut self) -> &mut F {
        &mut self.factory
    }

    pub fn cid_generator(&self) -> &CidGenerator {
        &self.cids
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .map(|(key, _)| ConnectionHandle(key))
            .collect()
    }

    pub fn connection(&self, handle: ConnectionHandle) -> Option<&Connection<F::Engine>> {
        self.connections.get(handle.0).map(|e| &e.conn)
    }

    pub fn connection_mut(
        &mut self,
        handle: ConnectionHandle,
    ) -> Option<&mut Connection<F::Engine>> {
        self.connections.get_mut(handle.0).map(|e| &mut e.conn)
    }

    pub fn peer_addr(&self, handle: ConnectionHandle) -> Option<SocketAddr> {
        self.connections.get(handle.0).map(|e| e.peer)
    }

    /// Connection currently routed by `cid`
    pub fn lookup(&self, cid: &ConnectionId) -> Option<ConnectionHandle> {
        self.routes.get(cid).copied().map(ConnectionHandle)
    }

    /// Forward every connection's events to a bounded channel.
    ///
    /// Installs a [`ChannelHandler`] as the connection handler of existing
    /// and future connections. Calling it again replaces the channel.
    pub fn event_channel(&mut self) -> Receiver<EndpointEvent> {
        let (tx, rx) = bounded(self.config.endpoint.event_channel_capacity);
        for (key, entry) in self.connections.iter_mut() {
            entry
                .conn
                .set_connection_handler(ChannelHandler::new(ConnectionHandle(key), tx.clone()));
        }
        self.events = Some(tx);
        rx
    }

    /// Start a client connection to `peer`
    pub fn connect(&mut self, peer: SocketAddr, now: Instant) -> Result<ConnectionHandle> {
        self.check_capacity()?;

        let scid = self.cids.generate()?;
        // Client-chosen initial destination ID (RFC 9000 Section 7.2)
        let dcid = self.cids.generate()?;
        let params = self.config.connection.local_transport_parameters();
        let engine = self.factory.new_engine(Side::Client, &scid, &dcid, &params)?;

        let conn = Connection::client(self.config.connection.clone(), scid.clone(), dcid, engine, now);
        let handle = self.insert(conn, peer, vec![scid]);
        info!(connection = %handle, %peer, "client connection started");
        Ok(handle)
    }

    /// Route one inbound datagram.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        peer: SocketAddr,
        now: Instant,
    ) -> DatagramOutcome {
        let Some(header) = self.factory.decode_header(datagram, self.cids.cid_len()) else {
            trace!(%peer, len = datagram.len(), "dropping unparseable datagram");
            return DatagramOutcome::Dropped(DropReason::Unparseable);
        };

        if let Some(&key) = self.routes.get(&header.dcid) {
            return self.deliver(key, datagram, now);
        }

        let version = match header.version {
            Some(version) => version,
            None => return self.stateless_reset(&header.dcid, datagram.len(), peer),
        };

        if !self.config.endpoint.supported_versions.contains(&version) {
            // RFC 9000 Section 14.1: servers drop small datagrams with unknown versions
            if datagram.len() < MIN_INITIAL_SIZE {
                return DatagramOutcome::Dropped(DropReason::Undersized);
            }
            debug!(%peer, version = format_args!("0x{:08x}", version), "version negotiation");
            return DatagramOutcome::VersionNegotiation {
                dcid: header.scid.clone().unwrap_or_else(ConnectionId::empty),
                scid: header.dcid.clone(),
                versions: self.config.endpoint.supported_versions.clone(),
            };
        }

        if !self.config.endpoint.accept_incoming || !self.factory.accept(&header, datagram, peer) {
            trace!(%peer, "new connection refused");
            return DatagramOutcome::Dropped(DropReason::Refused);
        }

        match self.accept(header, peer, now) {
            Ok(handle) => {
                let outcome = self.deliver(handle.0, datagram, now);
                match outcome {
                    DatagramOutcome::Delivered(handle) => DatagramOutcome::Accepted(handle),
                    other => other,
                }
            }
            Err(EndpointError::ConnectionLimit(max)) => {
                warn!(%peer, max, "connection limit reached, refusing");
                DatagramOutcome::Dropped(DropReason::ConnectionLimit)
            }
            Err(err) => {
                warn!(%peer, error = %err, "failed to create connection");
                DatagramOutcome::Dropped(DropReason::Internal)
            }
        }
    }

    /// Route an extra connection ID to `handle`
    pub fn associate(&mut self, handle: ConnectionHandle, cid: ConnectionId) -> Result<()> {
        let entry = self
            .connections
            .get_mut(handle.0)
            .ok_or(EndpointError::UnknownConnection(handle))?;
        if !entry.cids.contains(&cid) {
            entry.cids.push(cid.clone());
        }
        self.routes.insert(cid, handle.0);
        Ok(())
    }

    /// Stop routing `cid`; returns the connection it pointed at
    pub fn disassociate(&mut self, cid: &ConnectionId) -> Option<ConnectionHandle> {
        let key = self.routes.remove(cid)?;
        if let Some(entry) = self.connections.get_mut(key) {
            entry.cids.retain(|c| c != cid);
        }
        Some(ConnectionHandle(key))
    }

    /// Outbound datagrams from every connection
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<Transmit> {
        let mut out = Vec::new();
        for (key, entry) in self.connections.iter_mut() {
            match entry.conn.produce_datagrams(now) {
                Ok(datagrams) => out.extend(datagrams.into_iter().map(|payload| Transmit {
                    connection: ConnectionHandle(key),
                    destination: entry.peer,
                    payload,
                })),
                Err(err) => debug!(connection = key, error = %err, "produce_datagrams failed"),
            }
        }
        out
    }

    /// Earliest timer across all connections
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.connections
            .iter()
            .filter_map(|(_, entry)| entry.conn.next_timeout(now))
            .min()
    }

    /// Fire due timers; connections that close stop being routed.
    pub fn on_timeout(&mut self, now: Instant) {
        let mut closed = Vec::new();
        for (key, entry) in self.connections.iter_mut() {
            if entry.conn.next_deadline().map_or(false, |at| at <= now) {
                entry.conn.on_timeout(now);
            }
            if entry.conn.is_closed() && !entry.cids.is_empty() {
                closed.push(key);
            }
        }
        for key in closed {
            self.retire_routes(key);
        }
    }

    /// Close every open connection
    pub fn close_all(&mut self, error_code: u64, reason: &[u8], now: Instant) {
        for (_, entry) in self.connections.iter_mut() {
            if !entry.conn.is_closed() {
                let _ = entry.conn.close(error_code, reason, now);
            }
        }
    }

    /// Remove closed connections from the arena.
    ///
    /// They are handed back so unread stream data can still be read.
    pub fn reap(&mut self) -> Vec<(ConnectionHandle, Connection<F::Engine>)> {
        let closed: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.conn.is_closed())
            .map(|(key, _)| key)
            .collect();

        closed
            .into_iter()
            .map(|key| {
                self.retire_routes(key);
                let entry = self.connections.remove(key);
                debug!(connection = key, "connection reaped");
                (ConnectionHandle(key), entry.conn)
            })
            .collect()
    }

    fn check_capacity(&self) -> Result<()> {
        let max = self.config.endpoint.max_connections;
        if self.connections.len() >= max {
            return Err(EndpointError::ConnectionLimit(max));
        }
        Ok(())
    }

    fn accept(
        &mut self,
        header: DatagramHeader,
        peer: SocketAddr,
        now: Instant,
    ) -> Result<ConnectionHandle> {
        self.check_capacity()?;

        let scid = self.cids.generate()?;
        let peer_cid = header.scid.unwrap_or_else(ConnectionId::empty);
        let params = self.config.connection.local_transport_parameters();
        let engine = self
            .factory
            .new_engine(Side::Server, &scid, &peer_cid, &params)?;

        let conn = Connection::server(
            self.config.connection.clone(),
            scid.clone(),
            peer_cid,
            engine,
            now,
        );
        // The client keeps using its original DCID until it sees ours
        let handle = self.insert(conn, peer, vec![scid, header.dcid]);
        info!(connection = %handle, %peer, "server connection accepted");
        Ok(handle)
    }

    fn insert(
        &mut self,
        mut conn: Connection<F::Engine>,
        peer: SocketAddr,
        cids: Vec<ConnectionId>,
    ) -> ConnectionHandle {
        let slot = self.connections.vacant_entry();
        let key = slot.key();
        if let Some(tx) = &self.events {
            conn.set_connection_handler(ChannelHandler::new(ConnectionHandle(key), tx.clone()));
        }
        for cid in &cids {
            self.routes.insert(cid.clone(), key);
        }
        slot.insert(Entry { conn, peer, cids });
        ConnectionHandle(key)
    }

    fn deliver(&mut self, key: usize, datagram: &[u8], now: Instant) -> DatagramOutcome {
        let Some(entry) = self.connections.get_mut(key) else {
            return DatagramOutcome::Dropped(DropReason::UnknownConnection);
        };
        let outcome = match entry.conn.ingest(datagram, now) {
            Ok(()) => DatagramOutcome::Delivered(ConnectionHandle(key)),
            Err(_) => DatagramOutcome::Dropped(DropReason::ConnectionClosed),
        };
        if entry.conn.is_closed() {
            self.retire_routes(key);
        }
        outcome
    }

    fn stateless_reset(
        &self,
        dcid: &ConnectionId,
        trigger_len: usize,
        peer: SocketAddr,
    ) -> DatagramOutcome {
        if !self.config.endpoint.stateless_reset {
            trace!(%peer, %dcid, "short header for unknown connection");
            return DatagramOutcome::Dropped(DropReason::UnknownConnection);
        }
        match self.cids.stateless_reset(dcid, trigger_len) {
            Ok(Some(payload)) => {
                debug!(%peer, %dcid, len = payload.len(), "stateless reset");
                DatagramOutcome::StatelessReset(payload)
            }
            Ok(None) => {
                trace!(%peer, %dcid, trigger_len, "too small to answer with a reset");
                DatagramOutcome::Dropped(DropReason::UnknownConnection)
            }
            Err(err) => {
                warn!(%peer, error = %err, "failed to build stateless reset");
                DatagramOutcome::Dropped(DropReason::Internal)
            }
        }
    }

    fn retire_routes(&mut self, key: usize) {
        let Some(entry) = self.connections.get_mut(key) else {
            return;
        };
        for cid in entry.cids.drain(..) {
            if self.routes.get(&cid) == Some(&key) {
                self.routes.remove(&cid);
            }
        }
    }
}
