use crate::crypto::{Level, LEVEL_COUNT};
use crate::recovery::SentPacket;

/// NewReno over bytes in flight. The send path is gated by
/// `bytes_in_flight < cwnd`; ACK-only packets bypass the gate and are never
/// counted. Recovery periods are delimited per packet-number space by the
/// largest packet number lost when the period began.
#[derive(Debug)]
pub struct NewReno {
    max_datagram_size: u64,
    cwnd: u64,
    ssthresh: u64,
    min_window: u64,
    bytes_in_flight: u64,
    end_of_recovery: [Option<u64>; LEVEL_COUNT],
}

impl NewReno {
    const INITIAL_WINDOW_PACKETS: u64 = 10;
    const MIN_WINDOW_PACKETS: u64 = 2;

    pub fn new(max_datagram_size: u64) -> NewReno {
        NewReno {
            max_datagram_size,
            cwnd: Self::INITIAL_WINDOW_PACKETS * max_datagram_size,
            ssthresh: u64::max_value(),
            min_window: Self::MIN_WINDOW_PACKETS * max_datagram_size,
            bytes_in_flight: 0,
            end_of_recovery: [None; LEVEL_COUNT],
        }
    }

    #[inline]
    pub fn window(&self) -> u64 {
        self.cwnd
    }

    #[inline]
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// True while the window permits another in-flight packet.
    #[inline]
    pub fn can_send(&self) -> bool {
        self.bytes_in_flight < self.cwnd
    }

    pub fn on_packet_sent(&mut self, size: usize, in_flight: bool) {
        if in_flight {
            self.bytes_in_flight += size as u64;
        }
    }

    /// Applies one acknowledged packet: releases its bytes and grows the
    /// window, exponentially in slow start and linearly in avoidance. Packets
    /// from before the current recovery period do not grow the window.
    pub fn on_packet_acked(&mut self, level: Level, packet: &SentPacket) {
        if packet.in_flight {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size as u64);
        }

        if let Some(end) = self.end_of_recovery[level.index()] {
            if packet.pn <= end {
                return;
            }
        }

        let acked = packet.size as u64;
        if self.cwnd < self.ssthresh {
            self.cwnd += acked;
        } else {
            self.cwnd += self.max_datagram_size * acked / self.cwnd;
        }
    }

    /// Applies a batch of lost packets: their in-flight bytes leave the
    /// ledger, and a packet lost past the space's recovery end halves the
    /// window and starts a new period.
    pub fn on_packets_lost(&mut self, level: Level, lost: &[SentPacket]) {
        let mut largest_lost = None;

        for packet in lost {
            if packet.in_flight {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size as u64);
            }
            if largest_lost.map_or(true, |largest| packet.pn > largest) {
                largest_lost = Some(packet.pn);
            }
        }

        let largest_lost = match largest_lost {
            Some(pn) => pn,
            None => return,
        };

        let slot = level.index();
        let new_event = self.end_of_recovery[slot].map_or(true, |end| largest_lost > end);
        if new_event {
            self.cwnd = (self.cwnd / 2).max(self.min_window);
            self.ssthresh = self.cwnd;
            self.end_of_recovery[slot] = Some(largest_lost);
        }
    }

    /// A verified retransmission timeout collapses the window outright.
    pub fn on_rto_verified(&mut self) {
        self.cwnd = self.min_window;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::frame::Frame;
    use std::time::Instant;

    const MDS: u64 = 1460;

    fn packet(pn: u64, size: usize) -> SentPacket {
        SentPacket {
            pn,
            time: Instant::now(),
            size,
            ack_eliciting: true,
            in_flight: true,
            frames: vec![Frame::Ping],
        }
    }

    #[test]
    fn test_initial_and_min_windows() {
        let reno = NewReno::new(MDS);
        assert_eq!(reno.window(), 10 * MDS);
        assert!(reno.can_send());
    }

    #[test]
    fn test_slow_start_grows_by_acked_bytes() {
        let mut reno = NewReno::new(MDS);

        reno.on_packet_sent(1000, true);
        assert_eq!(reno.bytes_in_flight(), 1000);

        reno.on_packet_acked(Level::OneRtt, &packet(0, 1000));
        assert_eq!(reno.window(), 10 * MDS + 1000);
        assert_eq!(reno.bytes_in_flight(), 0);
    }

    #[test]
    fn test_ack_only_packets_bypass_ledger() {
        let mut reno = NewReno::new(MDS);

        reno.on_packet_sent(700, false);
        assert_eq!(reno.bytes_in_flight(), 0);

        let mut acked = packet(0, 700);
        acked.in_flight = false;
        acked.ack_eliciting = false;
        reno.on_packet_acked(Level::OneRtt, &acked);
        assert_eq!(reno.bytes_in_flight(), 0);
    }

    #[test]
    fn test_loss_halves_window_once_per_period() {
        let mut reno = NewReno::new(MDS);
        let before = reno.window();

        for _ in 0..4 {
            reno.on_packet_sent(1000, true);
        }

        reno.on_packets_lost(Level::OneRtt, &[packet(1, 1000), packet(3, 1000)]);
        assert_eq!(reno.window(), before / 2);
        assert_eq!(reno.bytes_in_flight(), 2000);

        // A second loss inside the same period (pn <= 3) does not halve again
        reno.on_packets_lost(Level::OneRtt, &[packet(2, 1000)]);
        assert_eq!(reno.window(), before / 2);

        // A loss past the period boundary does
        reno.on_packets_lost(Level::OneRtt, &[packet(9, 1000)]);
        assert_eq!(reno.window(), before / 4);
    }

    #[test]
    fn test_window_never_grows_on_loss() {
        let mut reno = NewReno::new(MDS);

        for round in 0..20u64 {
            let before = reno.window();
            reno.on_packets_lost(Level::OneRtt, &[packet(round * 10, 1000)]);
            let after = reno.window();

            assert!(after <= std::cmp::max(before / 2, 2 * MDS));
            assert!(after >= 2 * MDS);
        }

        assert_eq!(reno.window(), 2 * MDS);
    }

    #[test]
    fn test_recovery_periods_are_per_space() {
        let mut reno = NewReno::new(MDS);
        let before = reno.window();

        reno.on_packets_lost(Level::Handshake, &[packet(5, 1000)]);
        assert_eq!(reno.window(), before / 2);

        // Same packet number in a different space is a fresh loss event
        reno.on_packets_lost(Level::OneRtt, &[packet(5, 1000)]);
        assert_eq!(reno.window(), before / 4);
    }

    #[test]
    fn test_no_growth_during_recovery() {
        let mut reno = NewReno::new(MDS);

        reno.on_packets_lost(Level::OneRtt, &[packet(10, 1000)]);
        let during = reno.window();

        reno.on_packet_sent(1000, true);
        reno.on_packet_acked(Level::OneRtt, &packet(8, 1000));
        assert_eq!(reno.window(), during);

        reno.on_packet_sent(1000, true);
        reno.on_packet_acked(Level::OneRtt, &packet(11, 1000));
        assert!(reno.window() > during);
    }

    #[test]
    fn test_congestion_avoidance_growth() {
        let mut reno = NewReno::new(MDS);

        // Force avoidance by entering recovery once
        reno.on_packets_lost(Level::OneRtt, &[packet(0, 1000)]);
        let base = reno.window();

        reno.on_packet_sent(base as usize, true);
        reno.on_packet_acked(Level::OneRtt, &packet(1, base as usize));

        // One full window acked grows the window by about one datagram
        assert_eq!(reno.window(), base + MDS * base / base);
    }

    #[test]
    fn test_rto_collapses_to_min_window() {
        let mut reno = NewReno::new(MDS);
        reno.on_rto_verified();
        assert_eq!(reno.window(), 2 * MDS);
    }

    #[test]
    fn test_send_gate() {
        let mut reno = NewReno::new(MDS);

        while reno.can_send() {
            reno.on_packet_sent(MDS as usize, true);
        }
        assert_eq!(reno.bytes_in_flight(), 10 * MDS);

        reno.on_packet_acked(Level::OneRtt, &packet(0, MDS as usize));
        assert!(reno.can_send());
    }
}
