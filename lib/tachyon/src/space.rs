use crate::shared::{ErrorCode, TransportResult};
use crate::wire::frame::AckFrame;
use std::time::Instant;

/// Sorted, disjoint set of `u64` values kept as inclusive ranges. Used for
/// received packet numbers and acknowledged byte ranges.
#[derive(Debug, Default, Clone)]
pub struct RangeSet {
    // Ascending, non-overlapping, non-adjacent (start, end) pairs
    ranges: Vec<(u64, u64)>,
}

impl RangeSet {
    pub fn new() -> RangeSet {
        RangeSet { ranges: Vec::new() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, value: u64) -> bool {
        match self.ranges.binary_search_by_key(&value, |&(start, _)| start) {
            Ok(_) => true,
            Err(0) => false,
            Err(idx) => self.ranges[idx - 1].1 >= value,
        }
    }

    /// Inserts a single value. Returns false if it was already present.
    pub fn insert(&mut self, value: u64) -> bool {
        if self.contains(value) {
            return false;
        }
        self.insert_range(value, value);
        true
    }

    /// Inserts the inclusive range, merging with neighbours.
    pub fn insert_range(&mut self, start: u64, end: u64) {
        debug_assert!(start <= end);

        // First range that could merge with the incoming one
        let mut idx = match self
            .ranges
            .binary_search_by_key(&start, |&(range_start, _)| range_start)
        {
            Ok(idx) => idx,
            Err(idx) => idx,
        };

        if idx > 0 && self.ranges[idx - 1].1.saturating_add(1) >= start {
            idx -= 1;
        }

        let mut merged = (start, end);
        let mut removed = 0;

        while idx + removed < self.ranges.len() {
            let (range_start, range_end) = self.ranges[idx + removed];
            if range_start > merged.1.saturating_add(1) {
                break;
            }
            merged.0 = merged.0.min(range_start);
            merged.1 = merged.1.max(range_end);
            removed += 1;
        }

        self.ranges.splice(idx..idx + removed, Some(merged));
    }

    /// The end of the contiguous run starting at `from`, exclusive; `from`
    /// itself when the run is empty.
    pub fn contiguous_end(&self, from: u64) -> u64 {
        for &(start, end) in &self.ranges {
            if start <= from && from <= end.saturating_add(1) {
                return end + 1;
            }
        }
        from
    }

    /// Inclusive `(smallest, largest)` ranges ordered descending by largest.
    pub fn descending(&self) -> Vec<(u64, u64)> {
        self.ranges.iter().rev().cloned().collect()
    }

    pub fn largest(&self) -> Option<u64> {
        self.ranges.last().map(|&(_, end)| end)
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Iterates every contained value, ascending. Test support; the hot paths
    /// work on ranges.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|&(start, end)| start..=end)
    }
}

/// One independent sequence-number domain per encryption level. The send side
/// hands out strictly increasing packet numbers; the receive side tracks what
/// arrived and what still needs acknowledging.
#[derive(Debug)]
pub struct PacketNumberSpace {
    next_pn: u64,
    largest_acked: Option<u64>,
    largest_received: Option<u64>,
    largest_received_time: Option<Instant>,
    received: RangeSet,
    ack_pending: bool,
}

impl PacketNumberSpace {
    pub fn new() -> PacketNumberSpace {
        PacketNumberSpace {
            next_pn: 0,
            largest_acked: None,
            largest_received: None,
            largest_received_time: None,
            received: RangeSet::new(),
            ack_pending: false,
        }
    }

    /// Allocates the next send packet number. Numbers are never reused;
    /// retransmitted frames ride a fresh number.
    #[inline]
    pub fn next(&mut self) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    #[inline]
    pub fn peek_next(&self) -> u64 {
        self.next_pn
    }

    #[inline]
    pub fn largest_acked(&self) -> Option<u64> {
        self.largest_acked
    }

    #[inline]
    pub fn largest_received(&self) -> Option<u64> {
        self.largest_received
    }

    /// The packet number expected next, used to expand truncated numbers.
    #[inline]
    pub fn expected(&self) -> u64 {
        self.largest_received.map_or(0, |largest| largest + 1)
    }

    /// Records a received packet number. Returns false on duplicates, which
    /// must not be processed again.
    pub fn on_received(&mut self, pn: u64, ack_eliciting: bool, now: Instant) -> bool {
        if !self.received.insert(pn) {
            return false;
        }

        if self.largest_received.map_or(true, |largest| pn > largest) {
            self.largest_received = Some(pn);
            self.largest_received_time = Some(now);
        }

        if ack_eliciting {
            self.ack_pending = true;
        }

        true
    }

    /// True when an ack-eliciting packet arrived since the last ACK we built.
    #[inline]
    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// Builds an ACK frame covering everything received so far. The delay
    /// field is the time the largest packet has been waiting, scaled down by
    /// the local ack-delay exponent.
    ///
    /// Building does not clear the pending flag; the caller clears it once
    /// the frame has actually been placed in a packet.
    pub fn build_ack_frame(&self, now: Instant, ack_delay_exponent: u8) -> Option<AckFrame> {
        if self.received.is_empty() {
            return None;
        }

        let delay = match self.largest_received_time {
            Some(received_at) => {
                now.duration_since(received_at).as_micros() as u64 >> ack_delay_exponent
            }
            None => 0,
        };

        AckFrame::from_ranges(&self.received.descending(), delay)
    }

    /// Acknowledgment for everything received is on the wire.
    #[inline]
    pub fn clear_ack_pending(&mut self) {
        self.ack_pending = false;
    }

    /// Applies a peer ACK, advancing the largest-acknowledged watermark. The
    /// watermark never regresses. Returns the acknowledged ranges.
    pub fn on_ack_received(&mut self, frame: &AckFrame) -> TransportResult<Vec<(u64, u64)>> {
        if frame.largest >= self.next_pn {
            return Err(ErrorCode::ProtocolViolation.with("peer acknowledged an unsent packet"));
        }

        let ranges = frame.ranges_inclusive()?;

        if self.largest_acked.map_or(true, |largest| frame.largest > largest) {
            self.largest_acked = Some(frame.largest);
        }

        Ok(ranges)
    }

    /// Forgets all receive state so the peer can restart from packet number
    /// zero after a version negotiation round.
    pub fn reset_receive_state(&mut self) {
        self.largest_received = None;
        self.largest_received_time = None;
        self.received.clear();
        self.ack_pending = false;
    }
}
