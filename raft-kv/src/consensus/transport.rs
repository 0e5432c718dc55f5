//! TCP transport for raft messages.
//!
//! Frames are length-prefixed: a big-endian u32 length followed by that many
//! bytes. Every connection starts with one hello frame holding the sender's
//! raft address, followed by prost-encoded `Message` frames. The hello lets a
//! node that has not learned the configuration yet route replies back to
//! whoever contacted it.
//!
//! Outbound traffic goes through one sender thread per peer, each with a
//! bounded queue and a lazily (re)established connection. Messages that
//! cannot be queued or written are dropped; raft retransmits.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use prost::Message as ProstMessage;
use raft::prelude::Message;
use tracing::{debug, warn};

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const PEER_QUEUE_DEPTH: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// A raft message received from the network.
#[derive(Debug)]
pub struct Inbound {
    /// Raft address announced by the sending node.
    pub from: String,
    pub message: Message,
}

/// Accepting side of the transport. Dropping it stops the accept loop and
/// releases the port.
pub struct Listener {
    local: SocketAddr,
    stop: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);

        // Unblock the pending accept with a throwaway connection.
        let mut wake = self.local;
        if wake.ip().is_unspecified() {
            let loopback: IpAddr = match wake.ip() {
                IpAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                IpAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
            };
            wake.set_ip(loopback);
        }
        match TcpStream::connect_timeout(&wake, CONNECT_TIMEOUT) {
            Ok(_) => {
                if let Some(accept) = self.accept.take() {
                    if accept.join().is_err() {
                        warn!(addr = %self.local, "raft listener panicked");
                    }
                }
            }
            Err(err) => warn!(addr = %self.local, error = %err, "failed to wake raft listener"),
        }
    }
}

/// Binds `addr` and forwards every received message to `inbound` until the
/// returned [`Listener`] is dropped.
pub fn listen(addr: &str, inbound: Sender<Inbound>) -> Result<Listener> {
    let listener =
        TcpListener::bind(addr).with_context(|| format!("failed to bind raft address {addr}"))?;
    let local = listener.local_addr()?;
    let stop = Arc::new(AtomicBool::new(false));
    let accept = {
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name(format!("raft-net-listener-{local}"))
            .spawn(move || accept_loop(listener, inbound, &stop))
            .context("failed to spawn network listener")?
    };
    Ok(Listener {
        local,
        stop,
        accept: Some(accept),
    })
}

fn accept_loop(listener: TcpListener, inbound: Sender<Inbound>, stop: &AtomicBool) {
    for stream in listener.incoming() {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match stream {
            Ok(stream) => {
                let inbound = inbound.clone();
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &inbound) {
                        debug!(error = %err, "raft connection closed with error");
                    }
                });
            }
            Err(err) => warn!(error = %err, "failed to accept raft connection"),
        }
    }
    debug!("raft listener stopped");
}

fn handle_connection(stream: TcpStream, inbound: &Sender<Inbound>) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let Some(hello) = read_frame(&mut reader)? else {
        return Ok(());
    };
    let from = String::from_utf8(hello).map_err(invalid_data)?;

    while let Some(frame) = read_frame(&mut reader)? {
        let message = Message::decode(&frame[..]).map_err(invalid_data)?;
        inbound
            .send(Inbound {
                from: from.clone(),
                message,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "raft worker gone"))?;
    }
    Ok(())
}

/// Reads one frame. Returns `None` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(invalid_data(format!("frame of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(bytes)
}

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Outbound side of the transport.
pub struct Transport {
    local: String,
    peers: HashMap<String, Sender<Message>>,
}

impl Transport {
    /// `local` is the raft address announced to peers.
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            peers: HashMap::new(),
        }
    }

    /// Queues `message` for `address`. Never blocks.
    pub fn send(&mut self, address: &str, message: Message) {
        if !self.peers.contains_key(address) {
            match spawn_peer_sender(self.local.clone(), address.to_string()) {
                Ok(queue) => {
                    self.peers.insert(address.to_string(), queue);
                }
                Err(err) => {
                    warn!(peer = address, error = %err, "failed to start peer sender");
                    return;
                }
            }
        }
        let Some(queue) = self.peers.get(address) else {
            return;
        };
        match queue.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(peer = address, "outbound queue full, dropping raft message");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(peer = address, "peer sender stopped, dropping raft message");
                self.peers.remove(address);
            }
        }
    }
}

fn spawn_peer_sender(local: String, address: String) -> io::Result<Sender<Message>> {
    let (tx, rx) = bounded(PEER_QUEUE_DEPTH);
    thread::Builder::new()
        .name(format!("raft-peer-{address}"))
        .spawn(move || run_peer_sender(&local, &address, rx))?;
    Ok(tx)
}

fn run_peer_sender(local: &str, address: &str, queue: Receiver<Message>) {
    let mut connection: Option<BufWriter<TcpStream>> = None;
    for message in queue {
        if connection.is_none() {
            match connect(local, address) {
                Ok(stream) => connection = Some(stream),
                Err(err) => {
                    debug!(peer = address, error = %err, "failed to connect to peer");
                    continue;
                }
            }
        }
        let Some(stream) = connection.as_mut() else {
            continue;
        };
        let bytes = message.encode_to_vec();
        if let Err(err) = write_frame(stream, &bytes).and_then(|()| stream.flush()) {
            debug!(peer = address, error = %err, "failed to send raft message");
            connection = None;
        }
    }
}

fn connect(local: &str, address: &str) -> io::Result<BufWriter<TcpStream>> {
    let target = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "address did not resolve"))?;
    let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let mut writer = BufWriter::new(stream);
    write_frame(&mut writer, local.as_bytes())?;
    Ok(writer)
}

#[cfg(test)]
mod tests {
    use raft::prelude::MessageType;

    use super::*;

    #[test]
    fn frames_round_trip_and_detect_clean_eof() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello").unwrap();
        write_frame(&mut wire, b"").unwrap();

        let mut reader = &wire[..];
        assert_eq!(read_frame(&mut reader).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut reader).unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut reader).unwrap(), None);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let header = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        let mut reader = &header[..];
        assert!(read_frame(&mut reader).is_err());
    }

    #[test]
    fn delivers_messages_with_sender_address() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let listener = listen("127.0.0.1:0", tx).unwrap();
        let bound = listener.local_addr();

        let mut transport = Transport::new("127.0.0.1:65000");
        for to in [2, 3] {
            let mut message = Message::default();
            message.set_msg_type(MessageType::MsgHeartbeat);
            message.from = 1;
            message.to = to;
            transport.send(&bound.to_string(), message);
        }

        for expected in [2, 3] {
            let inbound = rx.recv_timeout(Duration::from_secs(5)).expect("message delivered");
            assert_eq!(inbound.from, "127.0.0.1:65000");
            assert_eq!(inbound.message.to, expected);
            assert_eq!(inbound.message.msg_type(), MessageType::MsgHeartbeat);
        }
    }

    #[test]
    fn dropping_listener_releases_the_port() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let listener = listen("127.0.0.1:0", tx.clone()).unwrap();
        let addr = listener.local_addr();
        drop(listener);

        let rebound = listen(&addr.to_string(), tx).unwrap();
        assert_eq!(rebound.local_addr(), addr);
    }
}
