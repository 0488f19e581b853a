//! Provides a message-passing communicator for rank groups running as
//! threads of one process, built on crossbeam channels. This is the
//! transport tests and demos use to stand up a multi-rank pool without
//! sockets.

use super::comm::Communicator;
use crossbeam_channel::{Receiver, Sender};
use std::cell::RefCell;

type Frame = (usize, Vec<u8>);

/// One endpoint of an in-process rank group created by
/// [`LocalCommunicator::group`].
pub struct LocalCommunicator {
    rank: usize,
    peers: Vec<Sender<Frame>>,
    inbound: Receiver<Frame>,
    undelivered: RefCell<Vec<Frame>>,
    time_stamp: usize,
}

impl LocalCommunicator {
    /// Creates a fully connected group of the given size; hand one
    /// communicator to each rank thread.
    pub fn group(size: usize) -> Vec<LocalCommunicator> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| crossbeam_channel::unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbound)| LocalCommunicator {
                rank,
                peers: senders.clone(),
                inbound,
                undelivered: RefCell::new(Vec::new()),
                time_stamp: 0,
            })
            .collect()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        self.peers[rank]
            .send((self.time_stamp, message))
            .expect("peer rank outlives the collective")
    }

    fn recv(&self) -> Vec<u8> {
        let mut undelivered = self.undelivered.borrow_mut();
        match undelivered
            .iter()
            .position(|(stamp, _)| *stamp == self.time_stamp)
        {
            Some(index) => undelivered.remove(index).1,
            None => loop {
                let frame = self.inbound.recv().expect("peer ranks outlive the collective");
                if frame.0 != self.time_stamp {
                    undelivered.push(frame)
                } else {
                    return frame.1;
                }
            },
        }
    }

    fn next_time_stamp(&mut self) {
        self.time_stamp += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn group_delivers_between_threads() {
        let mut group = LocalCommunicator::group(2);
        let b = group.pop().unwrap();
        let a = group.pop().unwrap();
        let echo = thread::spawn(move || {
            let message = b.recv();
            b.send(0, message);
        });
        a.send(1, b"ping".to_vec());
        assert_eq!(a.recv(), b"ping".to_vec());
        echo.join().unwrap();
    }

    #[test]
    fn future_generation_frames_wait() {
        let mut group = LocalCommunicator::group(2);
        let mut b = group.pop().unwrap();
        let a = group.pop().unwrap();
        // Rank 1 is already one generation ahead when it sends; rank 0
        // claims the frame only after advancing its own generation.
        b.next_time_stamp();
        b.send(0, b"early".to_vec());
        let mut a = a;
        a.next_time_stamp();
        assert_eq!(a.recv(), b"early".to_vec());
    }
}
