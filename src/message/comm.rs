//! The communicator trait implemented by every transport.

/// A minimal message-passing endpoint: a rank in a fixed-size pool that can
/// send bytes to any peer and receive bytes from whichever peer sent next.
///
/// Sends are non-blocking and reliable; receives block until a message is
/// available. Messages between two given ranks arrive in the order they
/// were sent. There is no global order across senders.
///
/// Each collective operation of the library runs within one *generation*,
/// advanced by [`Communicator::next_time_stamp`] when the operation
/// completes. Transports tag frames with the sender's current generation
/// and hold back frames from a later generation until the receiver
/// advances, so a rank that finishes a collective early cannot have its
/// next operation's traffic misread as part of the current one.
pub trait Communicator {
    /// The index of this rank within the pool.
    fn rank(&self) -> usize;

    /// The number of ranks in the pool.
    fn size(&self) -> usize;

    /// Queues a message for delivery to the given rank.
    fn send(&self, rank: usize, message: Vec<u8>);

    /// Blocks until a message of the current generation arrives.
    fn recv(&self) -> Vec<u8>;

    /// Advances to the next generation.
    fn next_time_stamp(&mut self);
}
