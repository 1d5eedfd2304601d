//! Memif-style endpoint: a single-producer/single-consumer ring of
//! fixed-size buffers reached through a socket in the real implementation.
//!
//! [`MemifTransport`] captures the socket/ring contract (dequeue-with-timeout,
//! enqueue, close) as an interface, since the underlying memif shared-memory
//! packet-I/O library is an external capability out of scope for this crate.
//! [`LocalRingTransport`] is the one concrete implementation shipped here: an
//! in-process SPSC ring that satisfies the same contract for testing and for
//! same-host loopback use, built over a bounded channel pair instead of a
//! real memif socket.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default number of working buffers held by a ring, matching the
/// originating implementation's `MEMIF_BUFFER_NUM`.
pub const MEMIF_BUFFER_NUM: usize = 16;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Blocking-mode timeout convention shared with the public SDK surface:
/// `0` is non-blocking, negative blocks indefinitely, positive bounds the
/// wait in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueTimeout {
    NonBlocking,
    Infinite,
    Bounded(Duration),
}

impl From<i64> for DequeueTimeout {
    fn from(ms: i64) -> Self {
        match ms {
            0 => DequeueTimeout::NonBlocking,
            v if v < 0 => DequeueTimeout::Infinite,
            v => DequeueTimeout::Bounded(Duration::from_millis(v as u64)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemifError {
    #[error("dequeue timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("buffer length {got} does not match expected frame size {expected}")]
    BadBufLen { got: usize, expected: usize },
}

/// The socket/ring contract a connection context drives. One instance is
/// bound to exactly one direction (sender or receiver) of one connection.
pub trait MemifTransport: Send {
    /// Allocates (sender) or retrieves (receiver) one buffer of the
    /// endpoint's fixed frame size, honoring `timeout`.
    fn dequeue(&self, timeout: DequeueTimeout) -> Result<Vec<u8>, MemifError>;

    /// Hands a filled (sender) or drained (receiver) buffer back to the
    /// ring.
    fn enqueue(&self, buf: Vec<u8>) -> Result<(), MemifError>;

    /// Closes the endpoint; any blocked or future `dequeue` call returns
    /// [`MemifError::Closed`].
    fn close(&self);

    fn frame_size(&self) -> usize;
}

struct RingState {
    frame_size: usize,
    buf_num: AtomicU32,
    working_idx: AtomicU32,
    closed: std::sync::atomic::AtomicBool,
}

/// One direction of a [`LocalRingTransport`] pair.
pub struct RingHandle {
    state: std::sync::Arc<RingState>,
    dequeue_rx: Mutex<Receiver<Vec<u8>>>,
    enqueue_tx: Sender<Vec<u8>>,
}

impl RingHandle {
    fn dequeue_blocking(&self, timeout: DequeueTimeout) -> Result<Vec<u8>, MemifError> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(MemifError::Closed);
        }
        let rx = self.dequeue_rx.lock().unwrap();
        let result = match timeout {
            DequeueTimeout::NonBlocking => match rx.try_recv() {
                Ok(buf) => Ok(buf),
                Err(TryRecvError::Empty) => Err(MemifError::Timeout),
                Err(TryRecvError::Disconnected) => Err(MemifError::Closed),
            },
            DequeueTimeout::Infinite => loop {
                if self.state.closed.load(Ordering::Acquire) {
                    break Err(MemifError::Closed);
                }
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(buf) => break Ok(buf),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break Err(MemifError::Closed),
                }
            },
            DequeueTimeout::Bounded(d) => {
                let deadline = Instant::now() + d;
                loop {
                    if self.state.closed.load(Ordering::Acquire) {
                        break Err(MemifError::Closed);
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break Err(MemifError::Timeout);
                    }
                    match rx.recv_timeout(remaining.min(POLL_INTERVAL)) {
                        Ok(buf) => break Ok(buf),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break Err(MemifError::Closed),
                    }
                }
            }
        };

        if result.is_ok() {
            self.state.buf_num.fetch_add(1, Ordering::AcqRel);
            self.state.working_idx.fetch_add(1, Ordering::AcqRel);
        }
        result
    }
}

impl MemifTransport for RingHandle {
    fn dequeue(&self, timeout: DequeueTimeout) -> Result<Vec<u8>, MemifError> {
        let buf = self.dequeue_blocking(timeout)?;
        if buf.len() != self.state.frame_size {
            let got = buf.len();
            let expected = self.state.frame_size;
            // Malformed buffer: hand it back to the ring instead of leaking
            // it, then report the mismatch.
            let _ = self.enqueue(buf);
            return Err(MemifError::BadBufLen { got, expected });
        }
        Ok(buf)
    }

    fn enqueue(&self, buf: Vec<u8>) -> Result<(), MemifError> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(MemifError::Closed);
        }
        self.state.buf_num.fetch_sub(1, Ordering::AcqRel);
        self.enqueue_tx.send(buf).map_err(|_| MemifError::Closed)
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
    }

    fn frame_size(&self) -> usize {
        self.state.frame_size
    }
}

/// An in-process stand-in for a real memif ring: two [`RingHandle`]s, `tx`
/// and `rx`, connected so that `tx.enqueue` delivers to `rx.dequeue`, and
/// `rx.enqueue` recycles a buffer back to `tx.dequeue` — mirroring a sender
/// handing filled buffers to a receiver, which hands emptied ones back.
pub struct LocalRingTransport;

impl LocalRingTransport {
    pub fn pair(frame_size: usize, capacity: usize) -> (RingHandle, RingHandle) {
        let (free_tx, free_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        let (delivered_tx, delivered_rx) = std::sync::mpsc::channel::<Vec<u8>>();

        for _ in 0..capacity {
            free_tx.send(vec![0u8; frame_size]).expect("receiver alive");
        }

        let tx_state = std::sync::Arc::new(RingState {
            frame_size,
            buf_num: AtomicU32::new(0),
            working_idx: AtomicU32::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        let rx_state = tx_state.clone();

        let tx = RingHandle {
            state: tx_state,
            dequeue_rx: Mutex::new(free_rx),
            enqueue_tx: delivered_tx,
        };
        let rx = RingHandle {
            state: rx_state,
            dequeue_rx: Mutex::new(delivered_rx),
            enqueue_tx: free_tx,
        };
        (tx, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_dequeue_then_enqueue_delivers_to_receiver() {
        let (tx, rx) = LocalRingTransport::pair(32, MEMIF_BUFFER_NUM);

        let mut buf = tx.dequeue(DequeueTimeout::NonBlocking).unwrap();
        buf[0] = 0xAB;
        tx.enqueue(buf).unwrap();

        let delivered = rx.dequeue(DequeueTimeout::Bounded(Duration::from_millis(50))).unwrap();
        assert_eq!(delivered[0], 0xAB);
    }

    #[test]
    fn receiver_dequeue_times_out_when_empty() {
        let (_tx, rx) = LocalRingTransport::pair(32, MEMIF_BUFFER_NUM);
        let start = Instant::now();
        let err = rx
            .dequeue(DequeueTimeout::Bounded(Duration::from_millis(30)))
            .unwrap_err();
        assert_eq!(err, MemifError::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn non_blocking_dequeue_returns_immediately_when_empty() {
        let (tx, _rx) = LocalRingTransport::pair(32, 0);
        assert_eq!(
            tx.dequeue(DequeueTimeout::NonBlocking).unwrap_err(),
            MemifError::Timeout
        );
    }

    #[test]
    fn close_interrupts_blocked_dequeue() {
        let (_tx, rx) = LocalRingTransport::pair(32, MEMIF_BUFFER_NUM);
        rx.close();
        assert_eq!(
            rx.dequeue(DequeueTimeout::Infinite).unwrap_err(),
            MemifError::Closed
        );
    }

    #[test]
    fn recycled_buffer_returns_to_free_pool() {
        let (tx, rx) = LocalRingTransport::pair(16, 1);
        let buf = tx.dequeue(DequeueTimeout::NonBlocking).unwrap();
        tx.enqueue(buf).unwrap();
        let buf = rx.dequeue(DequeueTimeout::NonBlocking).unwrap();
        rx.enqueue(buf).unwrap();
        // The single buffer should be back in the free pool for tx.
        assert!(tx.dequeue(DequeueTimeout::NonBlocking).is_ok());
    }

    #[test]
    fn timeout_conversion_matches_convention() {
        assert_eq!(DequeueTimeout::from(0), DequeueTimeout::NonBlocking);
        assert_eq!(DequeueTimeout::from(-1), DequeueTimeout::Infinite);
        assert_eq!(DequeueTimeout::from(-2), DequeueTimeout::Infinite);
        assert!(matches!(DequeueTimeout::from(100), DequeueTimeout::Bounded(_)));
    }
}
