//! Anti-Replay Protection for AH and ESP
//!
//! Implements the sliding-window anti-replay check of RFC 4302 Section 3.4.3
//! and RFC 4303 Section 3.4.3. Both processors share this window; it lives
//! inside the owning SA's mutable state and is only touched under the SA's
//! lock.
//!
//! # Algorithm
//!
//! ```text
//! Window Size: W packets (32..=64, default 64)
//!
//! Bitmap Representation:
//! ┌────────────────────────────────────────────────────────┐
//! │ MSB                                              LSB   │
//! │  W-1  ...              2   1   0                       │
//! │   ↑                            ↑                       │
//! │ Oldest                  Newest (last)                  │
//! └────────────────────────────────────────────────────────┘
//!
//! seq == 0            → reject (reserved, never transmitted)
//! seq >  last         → diff = seq - last
//!                       diff <  W: bitmap <<= diff, set bit 0
//!                       diff >= W: bitmap = bit 0
//!                       last = seq, accept
//! seq <= last         → diff = last - seq
//!                       diff >= W: reject (too old)
//!                       bit diff set: reject (replay)
//!                       otherwise set bit diff, accept
//! ```

/// Default anti-replay window size (64 packets)
pub const DEFAULT_WINDOW_SIZE: u32 = 64;

/// Minimum allowed window size
pub const MIN_WINDOW_SIZE: u32 = 32;

/// Maximum window size (limited by bitmap storage)
pub const MAX_WINDOW_SIZE: u32 = 64;

/// Anti-Replay Window
///
/// Tracks accepted sequence numbers with a sliding bitmap.
///
/// # Example
///
/// ```
/// use kestrel_proto::ipsec::replay::ReplayWindow;
///
/// let mut window = ReplayWindow::new(64);
///
/// assert!(window.check_and_update(1));
/// assert!(!window.check_and_update(1)); // duplicate
/// assert!(window.check_and_update(2));
/// ```
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Highest sequence number accepted so far (0 = nothing yet)
    last: u32,

    /// Bitmap of accepted packets within the window
    ///
    /// Bit 0 (LSB) = last
    /// Bit n = last - n
    bitmap: u64,

    /// Window width in packets
    window_size: u32,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl ReplayWindow {
    /// Create new anti-replay window
    ///
    /// # Panics
    ///
    /// Panics if window_size is outside `MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE`.
    /// Engine configuration validates the size before any window is built.
    pub fn new(window_size: u32) -> Self {
        assert!(
            (MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&window_size),
            "Window size must be between {} and {}",
            MIN_WINDOW_SIZE,
            MAX_WINDOW_SIZE
        );

        ReplayWindow {
            last: 0,
            bitmap: 0,
            window_size,
        }
    }

    /// Check a sequence number without modifying the window
    ///
    /// Returns `true` if `seq` would be accepted.
    pub fn check(&self, seq: u32) -> bool {
        if seq == 0 {
            return false;
        }

        if seq > self.last {
            return true;
        }

        let diff = self.last - seq;
        if diff >= self.window_size {
            return false;
        }

        self.bitmap & (1u64 << diff) == 0
    }

    /// Record `seq` as received
    ///
    /// Callers must have seen `check(seq)` return `true` under the same lock.
    pub fn update(&mut self, seq: u32) {
        if seq == 0 {
            return;
        }

        if seq > self.last {
            let diff = seq - self.last;
            if diff < self.window_size {
                self.bitmap = (self.bitmap << diff) & self.mask();
                self.bitmap |= 1;
            } else {
                self.bitmap = 1;
            }
            self.last = seq;
        } else {
            let diff = self.last - seq;
            if diff < self.window_size {
                self.bitmap |= 1u64 << diff;
            }
        }
    }

    /// Check sequence number and update window if valid
    ///
    /// Returns `true` if the packet is accepted (window updated), `false` if
    /// it is rejected (sequence 0, duplicate, or older than the window).
    pub fn check_and_update(&mut self, seq: u32) -> bool {
        if !self.check(seq) {
            return false;
        }
        self.update(seq);
        true
    }

    /// Get highest sequence number accepted
    pub fn last(&self) -> u32 {
        self.last
    }

    /// Get window size
    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    /// Get current bitmap (for debugging/testing)
    pub fn bitmap(&self) -> u64 {
        self.bitmap
    }

    /// Reset window to initial state
    pub fn reset(&mut self) {
        self.last = 0;
        self.bitmap = 0;
    }

    fn mask(&self) -> u64 {
        if self.window_size >= 64 {
            u64::MAX
        } else {
            (1u64 << self.window_size) - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_window_new() {
        let window = ReplayWindow::new(64);
        assert_eq!(window.last(), 0);
        assert_eq!(window.bitmap(), 0);
        assert_eq!(window.window_size(), 64);
    }

    #[test]
    fn test_replay_window_default() {
        let window = ReplayWindow::default();
        assert_eq!(window.window_size(), DEFAULT_WINDOW_SIZE);
    }

    #[test]
    #[should_panic(expected = "Window size must be between")]
    fn test_replay_window_invalid_size_too_small() {
        ReplayWindow::new(31);
    }

    #[test]
    #[should_panic(expected = "Window size must be between")]
    fn test_replay_window_invalid_size_too_large() {
        ReplayWindow::new(65);
    }

    #[test]
    fn test_reject_sequence_zero() {
        let mut window = ReplayWindow::new(64);
        assert!(!window.check_and_update(0));
        assert_eq!(window.last(), 0);
    }

    #[test]
    fn test_accept_first_packet() {
        let mut window = ReplayWindow::new(64);
        assert!(window.check_and_update(1));
        assert_eq!(window.last(), 1);
        assert_eq!(window.bitmap(), 1);
    }

    #[test]
    fn test_reject_duplicate_packet() {
        let mut window = ReplayWindow::new(64);
        assert!(window.check_and_update(1));
        assert!(!window.check_and_update(1));
    }

    #[test]
    fn test_accept_sequential_packets() {
        let mut window = ReplayWindow::new(64);
        for i in 1..=10 {
            assert!(window.check_and_update(i), "Failed at seq {}", i);
        }
        assert_eq!(window.last(), 10);
        assert_eq!(window.bitmap(), 0b11_1111_1111);
    }

    #[test]
    fn test_accept_out_of_order_within_window() {
        let mut window = ReplayWindow::new(64);
        assert!(window.check_and_update(10));
        assert!(window.check_and_update(5));
        assert!(window.check_and_update(8));
        assert!(window.check_and_update(3));
        assert!(!window.check_and_update(5));
    }

    #[test]
    fn test_window_boundary_64() {
        let mut window = ReplayWindow::new(64);
        assert!(window.check_and_update(100));

        // diff == W is outside the window
        assert!(!window.check_and_update(36));
        // diff == W - 1 is the oldest slot still inside
        assert!(window.check_and_update(37));
        assert!(!window.check_and_update(35));
    }

    #[test]
    fn test_window_boundary_32() {
        let mut window = ReplayWindow::new(32);
        assert!(window.check_and_update(100));

        assert!(!window.check_and_update(68));
        assert!(window.check_and_update(69));
        assert!(window.check_and_update(80));
    }

    #[test]
    fn test_too_old_rejected_regardless_of_history() {
        let mut window = ReplayWindow::new(32);
        assert!(window.check_and_update(200));
        // Never seen, but last - seq >= W
        for seq in 1..=168 {
            assert!(!window.check(seq), "seq {} should be too old", seq);
        }
    }

    #[test]
    fn test_window_sliding_keeps_history() {
        let mut window = ReplayWindow::new(64);
        assert!(window.check_and_update(100));
        assert!(window.check_and_update(90));

        assert!(window.check_and_update(150));
        assert_eq!(window.last(), 150);

        // 90 was recorded before the slide and is still inside [87, 150]
        assert!(!window.check_and_update(90));
        assert!(window.check_and_update(87));
        assert!(!window.check_and_update(85));
    }

    #[test]
    fn test_large_gap_resets_bitmap() {
        let mut window = ReplayWindow::new(64);
        assert!(window.check_and_update(10));
        assert!(window.check_and_update(200));
        assert_eq!(window.bitmap(), 1);
        assert!(!window.check_and_update(10));
    }

    #[test]
    fn test_shift_drops_bits_beyond_narrow_window() {
        let mut window = ReplayWindow::new(32);
        assert!(window.check_and_update(1));
        assert!(window.check_and_update(20));
        // Bit for seq 1 now sits at position 19; after a further shift of 20
        // it leaves the 32-bit window entirely.
        assert!(window.check_and_update(40));
        assert_eq!(window.bitmap() >> 32, 0);
    }

    #[test]
    fn test_check_does_not_mutate() {
        let mut window = ReplayWindow::new(64);
        assert!(window.check(5));
        assert_eq!(window.last(), 0);
        window.update(5);
        assert!(!window.check(5));
        assert!(window.check(6));
    }

    #[test]
    fn test_reset() {
        let mut window = ReplayWindow::new(64);
        assert!(window.check_and_update(10));
        window.reset();
        assert_eq!(window.last(), 0);
        assert_eq!(window.bitmap(), 0);
        assert!(window.check_and_update(1));
    }

    #[test]
    fn test_max_sequence() {
        let mut window = ReplayWindow::new(64);
        assert!(window.check_and_update(u32::MAX));
        assert!(!window.check_and_update(u32::MAX));
        assert!(window.check_and_update(u32::MAX - 63));
        assert!(!window.check_and_update(u32::MAX - 64));
    }
}
