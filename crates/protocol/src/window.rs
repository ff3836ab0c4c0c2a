//! Per-session sliding windows: receive-side ordering and send-side credits.
//!
//! The receive window delivers strictly in-order, buffers gapped arrivals,
//! and drops duplicates, stale and out-of-window frames with a reason. The
//! send window grants `windowSize` credits for business frames; credits are
//! released by ack frames carrying `{ackSeq, ackBitmap}`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::payload::AckPayload;

/// Errors from window operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WindowError {
    /// The window was reset while a sender was waiting for a credit.
    #[error("send window was reset while waiting for a credit")]
    Reset,
}

/// Why an inbound frame was not accepted into the receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The sequence is already buffered awaiting delivery.
    Duplicate,
    /// The sequence is at or below the delivered base.
    Stale,
    /// The sequence is beyond the window.
    OutOfWindow,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate"),
            Self::Stale => write!(f, "stale"),
            Self::OutOfWindow => write!(f, "out_of_window"),
        }
    }
}

/// Outcome of recording one inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Received<T> {
    /// The frame (and possibly previously buffered successors) is deliverable
    /// strictly in order.
    Ready(Vec<T>),
    /// Accepted but gapped; buffered until the gap fills.
    Buffered,
    /// Rejected with a reason; the frame must be discarded.
    Dropped(DropReason),
}

/// Ack state advertised to the peer: `{ackSeq, ackBitmap, recvWindow}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckState {
    /// Highest contiguous sequence delivered.
    pub ack_seq: u64,
    /// Bit `k` set means `ack_seq + 1 + k` was received out of order.
    pub ack_bitmap: u64,
    /// Window size of this receiver.
    pub recv_window: u32,
}

/// Receive-side sliding window.
#[derive(Debug)]
pub struct ReceiveWindow<T> {
    base_seq: u64,
    size: u32,
    buffer: BTreeMap<u64, T>,
}

impl<T> ReceiveWindow<T> {
    /// Create a window of the given size with base sequence 0.
    #[must_use]
    pub fn new(size: u32) -> Self {
        Self {
            base_seq: 0,
            size: size.max(1),
            buffer: BTreeMap::new(),
        }
    }

    /// Highest contiguous sequence delivered so far.
    #[must_use]
    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    /// Window size.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Record an arrival and drain any now-contiguous run of frames.
    pub fn record(&mut self, seq: u64, item: T) -> Received<T> {
        if self.buffer.contains_key(&seq) {
            return Received::Dropped(DropReason::Duplicate);
        }
        if seq <= self.base_seq {
            return Received::Dropped(DropReason::Stale);
        }
        let offset = seq - self.base_seq - 1;
        if offset >= u64::from(self.size) {
            return Received::Dropped(DropReason::OutOfWindow);
        }
        self.buffer.insert(seq, item);

        let mut ready = Vec::new();
        while let Some(item) = self.buffer.remove(&(self.base_seq + 1)) {
            self.base_seq += 1;
            ready.push(item);
        }
        if ready.is_empty() {
            Received::Buffered
        } else {
            Received::Ready(ready)
        }
    }

    /// Current ack state to stamp onto outgoing `control.ack` payloads.
    #[must_use]
    pub fn ack_state(&self) -> AckState {
        let mut bitmap = 0u64;
        for seq in self.buffer.keys() {
            let offset = seq - self.base_seq - 1;
            if offset < 64 {
                bitmap |= 1 << offset;
            }
        }
        AckState {
            ack_seq: self.base_seq,
            ack_bitmap: bitmap,
            recv_window: self.size,
        }
    }

    /// Reset to the initial state, discarding buffered frames.
    pub fn reset(&mut self) {
        self.base_seq = 0;
        self.buffer.clear();
    }
}

/// Returns `true` when `seq` is covered by the ack state `{ack_seq, bitmap}`.
#[must_use]
pub fn is_seq_acked(seq: u64, ack_seq: u64, ack_bitmap: Option<u64>, window: u32) -> bool {
    if seq <= ack_seq {
        return true;
    }
    let offset = seq - ack_seq - 1;
    if offset >= u64::from(window.min(64)) {
        return false;
    }
    ack_bitmap.unwrap_or(0) & (1 << offset) != 0
}

#[derive(Debug, Default)]
struct SendState {
    next_seq: u64,
    inflight: HashMap<u64, String>,
    epoch: u64,
}

/// Send-side credit window.
///
/// Business frames acquire a credit (awaiting when the peer is behind) and
/// are stamped with the next session sequence. A reset wakes any waiters
/// with [`WindowError::Reset`] and restores the full credit budget.
#[derive(Debug)]
pub struct SendWindow {
    size: u32,
    permits: Mutex<Arc<Semaphore>>,
    state: Mutex<SendState>,
}

impl SendWindow {
    /// Create a window granting `size` credits.
    #[must_use]
    pub fn new(size: u32) -> Self {
        let size = size.max(1);
        Self {
            size,
            permits: Mutex::new(Arc::new(Semaphore::new(size as usize))),
            state: Mutex::new(SendState {
                next_seq: 1,
                ..SendState::default()
            }),
        }
    }

    /// Acquire a credit and assign the next session sequence to `message_id`.
    pub async fn acquire(&self, message_id: &str) -> Result<u64, WindowError> {
        let (semaphore, epoch) = {
            let permits = self.permits.lock();
            let state = self.state.lock();
            (Arc::clone(&permits), state.epoch)
        };
        let permit = semaphore.acquire().await.map_err(|_| WindowError::Reset)?;
        // Credits are returned explicitly on ack or release.
        permit.forget();

        let mut state = self.state.lock();
        if state.epoch != epoch {
            return Err(WindowError::Reset);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.inflight.insert(seq, message_id.to_owned());
        Ok(seq)
    }

    /// Release the credit held by `seq` (send failure or explicit drop).
    pub fn release(&self, seq: u64) {
        let released = self.state.lock().inflight.remove(&seq).is_some();
        if released {
            self.permits.lock().add_permits(1);
        }
    }

    /// Apply a peer ack, releasing every credit it covers. Returns the
    /// released sequence numbers.
    pub fn apply_ack(&self, ack: &AckPayload) -> Vec<u64> {
        let Some(ack_seq) = ack.ack_seq else {
            return Vec::new();
        };
        let window = ack.recv_window.unwrap_or(self.size);
        let covered: Vec<u64> = {
            let state = self.state.lock();
            state
                .inflight
                .keys()
                .copied()
                .filter(|&seq| is_seq_acked(seq, ack_seq, ack.ack_bitmap, window))
                .collect()
        };
        for &seq in &covered {
            self.release(seq);
        }
        covered
    }

    /// Number of unacked business frames.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.state.lock().inflight.len()
    }

    /// Reset: bump the epoch, wake waiters with an error, restore credits,
    /// and restart sequences at 1.
    pub fn reset(&self) {
        let mut permits = self.permits.lock();
        let mut state = self.state.lock();
        permits.close();
        *permits = Arc::new(Semaphore::new(self.size as usize));
        state.epoch += 1;
        state.next_seq = 1;
        state.inflight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn in_order_delivery() {
        let mut window = ReceiveWindow::new(4);
        assert_eq!(window.record(1, "a"), Received::Ready(vec!["a"]));
        assert_eq!(window.record(2, "b"), Received::Ready(vec!["b"]));
        assert_eq!(window.base_seq(), 2);
    }

    #[test]
    fn gapped_frames_buffer_then_flush() {
        let mut window = ReceiveWindow::new(8);
        assert_eq!(window.record(2, "b"), Received::Buffered);
        assert_eq!(window.record(3, "c"), Received::Buffered);
        assert_eq!(window.record(1, "a"), Received::Ready(vec!["a", "b", "c"]));
        assert_eq!(window.base_seq(), 3);
    }

    #[test]
    fn duplicate_stale_and_out_of_window_drops() {
        let mut window = ReceiveWindow::new(2);
        assert_eq!(window.record(2, "b"), Received::Buffered);
        assert_eq!(window.record(2, "b"), Received::Dropped(DropReason::Duplicate));
        let _ = window.record(1, "a");
        assert_eq!(window.record(1, "a"), Received::Dropped(DropReason::Stale));
        // base is now 2, size 2: seq 5 is beyond the window.
        assert_eq!(window.record(5, "e"), Received::Dropped(DropReason::OutOfWindow));
    }

    #[test]
    fn window_size_one_still_delivers() {
        let mut window = ReceiveWindow::new(1);
        assert_eq!(window.record(1, 1), Received::Ready(vec![1]));
        assert_eq!(window.record(3, 3), Received::Dropped(DropReason::OutOfWindow));
        assert_eq!(window.record(2, 2), Received::Ready(vec![2]));
    }

    #[test]
    fn ack_state_reflects_gaps() {
        let mut window = ReceiveWindow::new(8);
        let _ = window.record(1, "a");
        let _ = window.record(3, "c");
        let _ = window.record(4, "d");
        let state = window.ack_state();
        assert_eq!(state.ack_seq, 1);
        // Offsets: seq 3 -> bit 1, seq 4 -> bit 2.
        assert_eq!(state.ack_bitmap, 0b110);
        assert_eq!(state.recv_window, 8);
    }

    #[test]
    fn reset_clears_state() {
        let mut window = ReceiveWindow::new(4);
        let _ = window.record(1, "a");
        let _ = window.record(3, "c");
        window.reset();
        assert_eq!(window.base_seq(), 0);
        assert_eq!(window.record(1, "a"), Received::Ready(vec!["a"]));
    }

    #[test]
    fn is_seq_acked_contiguous_and_bitmap() {
        assert!(is_seq_acked(3, 5, None, 64));
        assert!(is_seq_acked(5, 5, None, 64));
        assert!(!is_seq_acked(6, 5, None, 64));
        assert!(is_seq_acked(7, 5, Some(0b10), 64));
        assert!(!is_seq_acked(7, 5, Some(0b01), 64));
        // Beyond the window the bitmap cannot speak for the seq.
        assert!(!is_seq_acked(70, 5, Some(u64::MAX), 64));
    }

    #[tokio::test]
    async fn send_window_assigns_monotonic_seqs() {
        let window = SendWindow::new(4);
        assert_eq!(window.acquire("m1").await.unwrap(), 1);
        assert_eq!(window.acquire("m2").await.unwrap(), 2);
        assert_eq!(window.inflight(), 2);
    }

    #[tokio::test]
    async fn send_window_blocks_until_ack_releases() {
        let window = Arc::new(SendWindow::new(1));
        let seq = window.acquire("m1").await.unwrap();
        assert_eq!(seq, 1);

        let blocked = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.acquire("m2").await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        let released = window.apply_ack(&AckPayload {
            ack_seq: Some(1),
            ..AckPayload::default()
        });
        assert_eq!(released, vec![1]);
        assert_eq!(blocked.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn send_window_ack_bitmap_releases_out_of_order() {
        let window = SendWindow::new(4);
        let _ = window.acquire("m1").await.unwrap();
        let _ = window.acquire("m2").await.unwrap();
        let _ = window.acquire("m3").await.unwrap();
        // Peer delivered 1 and buffered 3 (bit 1 above ackSeq=1).
        let released = window.apply_ack(&AckPayload {
            ack_seq: Some(1),
            ack_bitmap: Some(0b10),
            recv_window: Some(4),
            ..AckPayload::default()
        });
        let mut released = released;
        released.sort_unstable();
        assert_eq!(released, vec![1, 3]);
        assert_eq!(window.inflight(), 1);
    }

    #[tokio::test]
    async fn send_window_reset_wakes_waiters() {
        let window = Arc::new(SendWindow::new(1));
        let _ = window.acquire("m1").await.unwrap();
        let blocked = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.acquire("m2").await })
        };
        tokio::task::yield_now().await;
        window.reset();
        assert_eq!(blocked.await.unwrap(), Err(WindowError::Reset));
        // After reset the full budget is back and sequences restart.
        assert_eq!(window.acquire("m3").await.unwrap(), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let window = SendWindow::new(2);
        window.release(99);
        assert_eq!(window.inflight(), 0);
    }
}
