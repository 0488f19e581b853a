//! Provides a message-passing communicator based on TCP sockets.
//!
//! Each rank binds one listener and keeps a cache of outgoing connections,
//! one per peer it has sent to. A dedicated send thread drains queued
//! frames so sends never block the caller; a receive thread polls the
//! accepted streams and hands completed frames to the blocking `recv`.
//! Because each ordered rank pair reuses a single connection and a single
//! send thread, pairwise FIFO delivery comes from TCP itself.

use super::comm::Communicator;
use super::util::{self, Frame};
use crossbeam_channel::{Receiver, Sender};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_micros(200);
const IDLE_BACKOFF: Duration = Duration::from_micros(50);
const CONNECT_RETRY: Duration = Duration::from_millis(20);
const CONNECT_ATTEMPTS: usize = 500;

type Outgoing = (SocketAddr, usize, Vec<u8>);

/// Maintains a cache of ingoing and outgoing TCP connections.
///
/// Connecting to a peer only opens a socket on the first send; later sends
/// reuse the cached stream. Peers may come up in any order, so the first
/// connection attempt retries briefly while the remote listener binds.
pub struct ConnectionPool {
    alive: Arc<AtomicBool>,
    send_s: Option<Sender<Outgoing>>,
    recv_r: Option<Receiver<Frame>>,
    send_thread: Option<thread::JoinHandle<()>>,
    recv_thread: Option<thread::JoinHandle<()>>,
}

fn connect(address: SocketAddr) -> TcpStream {
    for _ in 0..CONNECT_ATTEMPTS {
        if let Ok(stream) = TcpStream::connect(address) {
            return stream;
        }
        thread::sleep(CONNECT_RETRY);
    }
    panic!("peer at {} never came up", address)
}

impl ConnectionPool {
    /// Creates a `ConnectionPool` from a bound `TcpListener`. The listener
    /// is switched to non-blocking accepts so the receive thread can
    /// interleave accepting with polling.
    pub fn from_listener(listener: TcpListener) -> Self {
        let (send_s, send_r) = crossbeam_channel::unbounded::<Outgoing>();
        let (recv_s, recv_r) = crossbeam_channel::unbounded::<Frame>();
        let alive = Arc::new(AtomicBool::new(true));
        let keep_receiving = alive.clone();

        let send_thread = thread::spawn(move || {
            let mut streams: HashMap<SocketAddr, TcpStream> = HashMap::new();
            for (address, stamp, payload) in send_r {
                let stream = streams.entry(address).or_insert_with(|| connect(address));
                util::write_frame(stream, stamp, &payload).expect("peer stays connected");
            }
        });

        listener.set_nonblocking(true).unwrap();
        let recv_thread = thread::spawn(move || {
            let mut streams: Vec<TcpStream> = Vec::new();
            while keep_receiving.load(Ordering::Relaxed) {
                let mut busy = false;
                for stream in &mut streams {
                    if let Ok(Some(frame)) = util::try_read_frame(stream) {
                        recv_s.send(frame).unwrap();
                        busy = true;
                    }
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
                        streams.push(stream);
                    }
                    Err(_) if busy => {}
                    Err(_) => thread::sleep(IDLE_BACKOFF),
                }
            }
        });

        Self {
            alive,
            send_s: Some(send_s),
            recv_r: Some(recv_r),
            send_thread: Some(send_thread),
            recv_thread: Some(recv_thread),
        }
    }

    /// Initiates a blocking receive from any peer.
    pub fn recv(&mut self) -> Frame {
        self.recv_r.as_ref().unwrap().recv().unwrap()
    }

    /// Initiates a non-blocking send to a particular peer.
    pub fn send(&mut self, peer: SocketAddr, stamp: usize, payload: Vec<u8>) {
        self.send_s
            .as_ref()
            .unwrap()
            .send((peer, stamp, payload))
            .unwrap()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.alive.swap(false, Ordering::Relaxed);
        self.send_s.take().unwrap();
        self.send_thread.take().unwrap().join().unwrap();
        self.recv_thread.take().unwrap().join().unwrap();
    }
}

/// A [`Communicator`] over a pool of TCP peers. Rank `i` is addressed by
/// `peers[i]`; this rank's own entry is the address it listens on.
pub struct TcpCommunicator {
    rank: usize,
    peers: Vec<SocketAddr>,
    connections: RefCell<ConnectionPool>,
    undelivered: RefCell<Vec<Frame>>,
    time_stamp: usize,
}

impl TcpCommunicator {
    pub fn new(rank: usize, peers: Vec<SocketAddr>) -> Self {
        let listener = TcpListener::bind(peers[rank]).unwrap();
        let connections = RefCell::new(ConnectionPool::from_listener(listener));
        Self {
            rank,
            peers,
            connections,
            undelivered: RefCell::new(Vec::new()),
            time_stamp: 0,
        }
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        self.connections
            .borrow_mut()
            .send(self.peers[rank], self.time_stamp, message)
    }

    fn recv(&self) -> Vec<u8> {
        let mut connections = self.connections.borrow_mut();
        let mut undelivered = self.undelivered.borrow_mut();
        match undelivered
            .iter()
            .position(|frame| frame.stamp == self.time_stamp)
        {
            Some(index) => undelivered.remove(index).payload,
            None => loop {
                let frame = connections.recv();
                if frame.stamp != self.time_stamp {
                    undelivered.push(frame)
                } else {
                    return frame.payload;
                }
            },
        }
    }

    fn next_time_stamp(&mut self) {
        self.time_stamp += 1;
    }
}
