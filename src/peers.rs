//! Peer connection management
//!
//! A TCP server with a fixed table of `MAX_CLIENT` connection slots. Slot
//! numbers identify peers for the lifetime of their connection; a freed slot
//! is handed to the next peer before any higher one.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::Duration;
use chrono::{DateTime, Utc};
use crate::{RelayError, Result, MAX_CLIENT};

/// Default read timeout on peer sockets, short enough for one thread to
/// poll every slot
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Default write timeout on peer sockets
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval of the blocking `accept`
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Metadata recorded when a peer is accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Slot the peer occupies
    pub slot: usize,
    /// Remote socket address
    pub addr: SocketAddr,
    /// Key derived from the remote address
    pub key: u64,
    /// Accept time
    pub connected_at: DateTime<Utc>,
}

/// Numeric key for a peer address: address octets weighted by 256, the
/// lowest one unweighted, plus the port
pub fn address_key(addr: &SocketAddr) -> u64 {
    let octets: Vec<u8> = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    let (last, rest) = match octets.split_last() {
        Some(split) => split,
        None => return addr.port() as u64,
    };
    rest.iter().map(|b| *b as u64 * 256).sum::<u64>() + *last as u64 + addr.port() as u64
}

/// Connected stream; writes are serialized so messages from different
/// threads never interleave. A failed write may leave part of a message on
/// the wire, so the owner of the slot drops the connection after one.
#[derive(Debug)]
struct PeerStream {
    stream: TcpStream,
    write_lock: Mutex<()>,
}

impl PeerStream {
    fn write_message(&self, data: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        (&self.stream).write_all(data)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }
}

/// An occupied slot
#[derive(Debug)]
struct PeerConnection {
    stream: Arc<PeerStream>,
    info: PeerInfo,
}

/// Fixed-capacity TCP broadcast server
#[derive(Debug)]
pub struct ClientBroadcastServer {
    bind_addr: IpAddr,
    port: u16,
    read_timeout: Duration,
    write_timeout: Duration,
    listener: OnceLock<TcpListener>,
    slots: Mutex<[Option<PeerConnection>; MAX_CLIENT]>,
}

impl Default for ClientBroadcastServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBroadcastServer {
    /// Server bound to all interfaces, port not yet set
    pub fn new() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            listener: OnceLock::new(),
            slots: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the port to listen on; 0 picks an ephemeral port
    pub fn init(&mut self, port: u16) {
        self.port = port;
    }

    /// Bind the listener. Failures are logged and reported as `false`;
    /// calling it again once listening is a no-op.
    ///
    /// The listener is non-blocking from here on, so `accept` and
    /// `try_accept` can share it between threads.
    pub fn listen(&self) -> bool {
        if self.is_listening() {
            return true;
        }
        let addr = SocketAddr::new(self.bind_addr, self.port);
        match TcpListener::bind(addr).and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        }) {
            Ok(listener) => {
                match listener.local_addr() {
                    Ok(local) => log::info!("Listening for peers on {}", local),
                    Err(_) => log::info!("Listening for peers on {}", addr),
                }
                // a concurrent listen may have won; its listener is kept
                let _ = self.listener.set(listener);
                true
            }
            Err(e) => {
                log::error!("Cannot listen on {}: {}", addr, e);
                false
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener.get().is_some()
    }

    /// Bound address of the listener
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener()?.local_addr()?)
    }

    fn listener(&self) -> Result<&TcpListener> {
        self.listener
            .get()
            .ok_or_else(|| RelayError::System("server is not listening".to_string()))
    }

    fn lock_slots(&self) -> MutexGuard<'_, [Option<PeerConnection>; MAX_CLIENT]> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until a peer connects and give it the lowest free slot
    pub fn accept(&self) -> Result<usize> {
        loop {
            if let Some(slot) = self.try_accept()? {
                return Ok(slot);
            }
            thread::sleep(ACCEPT_POLL);
        }
    }

    /// Accept a pending peer without blocking; `None` when nobody is waiting
    pub fn try_accept(&self) -> Result<Option<usize>> {
        let listener = self.listener()?;
        match listener.accept() {
            Ok((stream, addr)) => self.admit(stream, addr).map(Some),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) -> Result<usize> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.write_timeout))?;
        stream.set_nodelay(true)?;

        let mut slots = self.lock_slots();
        let Some(slot) = slots.iter().position(Option::is_none) else {
            drop(slots);
            log::warn!("Rejecting peer {}: all {} slots are occupied", addr, MAX_CLIENT);
            let _ = stream.shutdown(Shutdown::Both);
            return Err(RelayError::CapacityExceeded { max: MAX_CLIENT });
        };

        let info = PeerInfo {
            slot,
            addr,
            key: address_key(&addr),
            connected_at: Utc::now(),
        };
        slots[slot] = Some(PeerConnection {
            stream: Arc::new(PeerStream {
                stream,
                write_lock: Mutex::new(()),
            }),
            info,
        });
        drop(slots);

        log::info!("Peer {} connected on slot {}", addr, slot);
        Ok(slot)
    }

    fn stream(&self, slot: usize) -> Result<Arc<PeerStream>> {
        self.lock_slots()
            .get(slot)
            .and_then(Option::as_ref)
            .map(|conn| Arc::clone(&conn.stream))
            .ok_or(RelayError::InvalidSlot(slot))
    }

    /// Send to one peer. A failed send closes the slot.
    pub fn send_to(&self, slot: usize, data: &[u8]) -> Result<()> {
        let stream = self.stream(slot)?;
        stream.write_message(data).map_err(|e| {
            self.drop_broken(slot, &stream);
            RelayError::SendFailed(format!("slot {}: {}", slot, e))
        })
    }

    /// Send to every connected peer; returns how many were reached
    pub fn broadcast(&self, data: &[u8]) -> usize {
        self.fan_out(None, data)
    }

    /// Send to every connected peer except `slot`; returns how many were
    /// reached
    pub fn broadcast_except(&self, slot: usize, data: &[u8]) -> usize {
        self.fan_out(Some(slot), data)
    }

    fn fan_out(&self, skip: Option<usize>, data: &[u8]) -> usize {
        let targets: Vec<(usize, Arc<PeerStream>)> = self
            .lock_slots()
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != skip)
            .filter_map(|(index, conn)| conn.as_ref().map(|c| (index, Arc::clone(&c.stream))))
            .collect();

        let mut delivered = 0;
        let mut broken = Vec::new();
        for (index, stream) in targets {
            match stream.write_message(data) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Send to slot {} failed: {}", index, e);
                    broken.push((index, stream));
                }
            }
        }
        for (index, stream) in broken {
            self.drop_broken(index, &stream);
        }
        delivered
    }

    /// Close `slot` if it still holds `stream`; a peer admitted into the
    /// slot since the failed write is left alone
    fn drop_broken(&self, slot: usize, stream: &Arc<PeerStream>) {
        let closed = {
            let mut slots = self.lock_slots();
            match &slots[slot] {
                Some(conn) if Arc::ptr_eq(&conn.stream, stream) => slots[slot].take(),
                _ => None,
            }
        };
        if let Some(conn) = closed {
            let _ = conn.stream.stream.shutdown(Shutdown::Both);
            log::info!("Dropped peer {} on slot {} after a failed send", conn.info.addr, slot);
        }
    }

    /// Read whatever a peer has sent.
    ///
    /// Returns `Ok(0)` when the read timeout elapses with nothing available
    /// and `ConnectionClosed` once the peer has hung up.
    pub fn receive_from(&self, slot: usize, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream(slot)?;
        if buf.is_empty() {
            return Ok(0);
        }
        match stream.read(buf) {
            Ok(0) => Err(RelayError::ConnectionClosed(slot)),
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Free a slot and shut its connection down; closing a free slot is a
    /// no-op
    pub fn close(&self, slot: usize) -> Result<()> {
        if slot >= MAX_CLIENT {
            return Err(RelayError::InvalidSlot(slot));
        }
        let closed = self.lock_slots()[slot].take();
        if let Some(conn) = closed {
            let _ = conn.stream.stream.shutdown(Shutdown::Both);
            log::info!("Peer {} on slot {} disconnected", conn.info.addr, slot);
        }
        Ok(())
    }

    /// Close every connection
    pub fn close_all(&self) {
        for slot in self.occupied_slots() {
            let _ = self.close(slot);
        }
    }

    pub fn client_count(&self) -> usize {
        self.lock_slots().iter().filter(|conn| conn.is_some()).count()
    }

    /// Occupied slot numbers in ascending order
    pub fn occupied_slots(&self) -> Vec<usize> {
        self.lock_slots()
            .iter()
            .enumerate()
            .filter_map(|(index, conn)| conn.as_ref().map(|_| index))
            .collect()
    }

    pub fn peer_info(&self, slot: usize) -> Option<PeerInfo> {
        self.lock_slots()
            .get(slot)
            .and_then(Option::as_ref)
            .map(|conn| conn.info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listening_server() -> ClientBroadcastServer {
        let mut server = ClientBroadcastServer::new().with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
        server.init(0);
        assert!(server.listen());
        server
    }

    fn connect(server: &ClientBroadcastServer) -> (TcpStream, usize) {
        let client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let slot = server.accept().unwrap();
        (client, slot)
    }

    fn read_exact(client: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        client.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_address_key() {
        let addr: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        assert_eq!(address_key(&addr), 10 * 256 + 2 + 5000);
    }

    #[test]
    fn test_listen_failure_reported() {
        let first = listening_server();
        let port = first.local_addr().unwrap().port();

        let mut second = ClientBroadcastServer::new().with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
        second.init(port);
        assert!(!second.listen());
        assert!(!second.is_listening());
    }

    #[test]
    fn test_accept_records_peer() {
        let server = listening_server();
        let (client, slot) = connect(&server);

        assert_eq!(slot, 0);
        assert_eq!(server.client_count(), 1);
        let info = server.peer_info(slot).unwrap();
        assert_eq!(info.addr, client.local_addr().unwrap());
        assert_eq!(info.key, address_key(&info.addr));
    }

    #[test]
    fn test_capacity_exceeded() {
        let server = listening_server();
        let mut clients = Vec::new();
        for expected in 0..MAX_CLIENT {
            let (client, slot) = connect(&server);
            assert_eq!(slot, expected);
            clients.push(client);
        }

        let mut rejected = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        rejected.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        assert!(matches!(
            server.accept(),
            Err(RelayError::CapacityExceeded { max: MAX_CLIENT })
        ));
        assert_eq!(server.client_count(), MAX_CLIENT);

        let mut buf = [0u8; 1];
        assert_eq!(rejected.read(&mut buf).unwrap_or(0), 0);
    }

    #[test]
    fn test_broadcast_except_skips_sender() {
        let server = listening_server();
        let (mut c0, _) = connect(&server);
        let (mut c1, _) = connect(&server);
        let (mut c2, s2) = connect(&server);

        assert_eq!(server.broadcast_except(s2, b"hello"), 2);
        assert_eq!(read_exact(&mut c0, 5), b"hello");
        assert_eq!(read_exact(&mut c1, 5), b"hello");

        let mut buf = [0u8; 5];
        assert!(c2.read(&mut buf).is_err());
    }

    #[test]
    fn test_broadcast_reaches_all() {
        let server = listening_server();
        let (mut c0, _) = connect(&server);
        let (mut c1, _) = connect(&server);

        assert_eq!(server.broadcast(b"frame"), 2);
        assert_eq!(read_exact(&mut c0, 5), b"frame");
        assert_eq!(read_exact(&mut c1, 5), b"frame");
    }

    #[test]
    fn test_closed_slot_reused_first() {
        let server = listening_server();
        let _clients: Vec<_> = (0..3).map(|_| connect(&server).0).collect();

        server.close(1).unwrap();
        server.close(1).unwrap();
        assert_eq!(server.occupied_slots(), vec![0, 2]);

        let (_client, slot) = connect(&server);
        assert_eq!(slot, 1);
        assert_eq!(server.client_count(), 3);
    }

    #[test]
    fn test_invalid_slots() {
        let server = listening_server();
        assert!(matches!(server.send_to(0, b"x"), Err(RelayError::InvalidSlot(0))));
        assert!(matches!(
            server.send_to(MAX_CLIENT, b"x"),
            Err(RelayError::InvalidSlot(_))
        ));
        assert!(matches!(server.close(MAX_CLIENT), Err(RelayError::InvalidSlot(_))));

        let mut buf = [0u8; 4];
        assert!(matches!(server.receive_from(3, &mut buf), Err(RelayError::InvalidSlot(3))));
        assert!(server.peer_info(3).is_none());
    }

    #[test]
    fn test_send_to_one_peer() {
        let server = listening_server();
        let (mut c0, s0) = connect(&server);
        let (mut c1, _) = connect(&server);

        server.send_to(s0, b"only").unwrap();
        assert_eq!(read_exact(&mut c0, 4), b"only");
        let mut buf = [0u8; 4];
        assert!(c1.read(&mut buf).is_err());
    }

    #[test]
    fn test_receive_from_peer() {
        let server = listening_server();
        let (mut client, slot) = connect(&server);
        let mut buf = [0u8; 64];

        assert_eq!(server.receive_from(slot, &mut buf).unwrap(), 0);

        client.write_all(b"ping").unwrap();
        let mut received = Vec::new();
        for _ in 0..100 {
            let n = server.receive_from(slot, &mut buf).unwrap();
            received.extend_from_slice(&buf[..n]);
            if received.len() >= 4 {
                break;
            }
        }
        assert_eq!(received, b"ping");

        drop(client);
        let mut outcome = Ok(0);
        for _ in 0..100 {
            outcome = server.receive_from(slot, &mut buf);
            if !matches!(outcome, Ok(0)) {
                break;
            }
        }
        assert!(matches!(outcome, Err(RelayError::ConnectionClosed(s)) if s == slot));
    }

    #[test]
    fn test_try_accept_without_pending() {
        let server = listening_server();
        assert!(server.try_accept().unwrap().is_none());

        let _client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let mut slot = None;
        for _ in 0..100 {
            slot = server.try_accept().unwrap();
            if slot.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(slot, Some(0));
    }

    fn stalled_server() -> ClientBroadcastServer {
        let mut server = ClientBroadcastServer::new()
            .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_write_timeout(Duration::from_millis(100));
        server.init(0);
        assert!(server.listen());
        server
    }

    #[test]
    fn test_stalled_peer_dropped_on_broadcast() {
        let server = stalled_server();
        let (_stalled, slot) = connect(&server);
        let message = vec![0x5a; 50_000];

        let mut failed = false;
        for _ in 0..10_000 {
            if server.broadcast(&message) == 0 {
                failed = true;
                break;
            }
        }

        assert!(failed);
        assert_eq!(server.client_count(), 0);
        assert!(server.peer_info(slot).is_none());
        assert_eq!(server.broadcast(&message), 0);
    }

    #[test]
    fn test_stalled_peer_dropped_on_send_to() {
        let server = stalled_server();
        let (_stalled, slot) = connect(&server);
        let message = vec![0xa5; 50_000];

        let mut outcome = Ok(());
        for _ in 0..10_000 {
            outcome = server.send_to(slot, &message);
            if outcome.is_err() {
                break;
            }
        }

        assert!(matches!(outcome, Err(RelayError::SendFailed(_))));
        assert_eq!(server.client_count(), 0);
        assert!(matches!(server.send_to(slot, b"x"), Err(RelayError::InvalidSlot(_))));
    }

    #[test]
    fn test_failed_send_spares_new_occupant() {
        let server = listening_server();
        let (_first, slot) = connect(&server);
        let stale = server.stream(slot).unwrap();

        server.close(slot).unwrap();
        let (_second, reused) = connect(&server);
        assert_eq!(reused, slot);

        server.drop_broken(slot, &stale);
        assert_eq!(server.client_count(), 1);
    }

    #[test]
    fn test_concurrent_churn_and_broadcast() {
        const ROUNDS: usize = 200;
        let server = Arc::new(listening_server());
        let (mut survivor, survivor_slot) = connect(&server);
        let (_victim, victim_slot) = connect(&server);
        assert_eq!((survivor_slot, victim_slot), (0, 1));

        let message: Vec<u8> = (0..64u8).collect();

        let churn = {
            let server = Arc::clone(&server);
            std::thread::spawn(move || {
                let addr = server.local_addr().unwrap();
                for _ in 0..50 {
                    server.close(victim_slot).unwrap();
                    let count = server.client_count();
                    assert!(count <= MAX_CLIENT);
                    let _client = TcpStream::connect(addr).unwrap();
                    assert_eq!(server.accept().unwrap(), victim_slot);
                }
            })
        };

        let sender = {
            let server = Arc::clone(&server);
            let message = message.clone();
            std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let reached = server.broadcast_except(MAX_CLIENT - 1, &message);
                    assert!((1..=MAX_CLIENT).contains(&reached));
                }
            })
        };

        churn.join().unwrap();
        sender.join().unwrap();
        assert!(server.client_count() <= MAX_CLIENT);
        assert!(server.peer_info(survivor_slot).is_some());

        survivor.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let received = read_exact(&mut survivor, ROUNDS * message.len());
        for chunk in received.chunks(message.len()) {
            assert_eq!(chunk, message.as_slice());
        }
        let mut extra = [0u8; 1];
        survivor.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        assert!(survivor.read(&mut extra).is_err());
    }

    #[test]
    fn test_accept_leaves_listener_non_blocking() {
        let server = listening_server();
        let (_client, slot) = connect(&server);
        assert_eq!(slot, 0);

        let started = std::time::Instant::now();
        assert!(server.try_accept().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_accept_requires_listen() {
        let server = ClientBroadcastServer::new();
        assert!(server.accept().is_err());
        assert_eq!(server.client_count(), 0);
    }
}
