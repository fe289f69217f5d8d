//! Loss detection: the per-space sent-packet ledger, RTT estimation, the
//! packet/time loss thresholds and the probe timeout. Loss events are
//! returned to the connection, never pushed through stored callbacks.

pub mod congestion;

pub use congestion::NewReno;

use crate::crypto::{Level, LEVEL_COUNT};
use crate::wire::frame::Frame;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Everything remembered about a transmitted packet until it is acknowledged
/// or declared lost.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub pn: u64,
    pub time: Instant,
    pub size: usize,
    pub ack_eliciting: bool,
    /// Counts against the congestion window; ACK-only packets do not.
    pub in_flight: bool,
    /// Carried frames, kept for recycling on loss.
    pub frames: Vec<Frame>,
}

/// RFC 6298-style estimator: EWMA with alpha 1/8 for the mean and beta 1/4
/// for the variance.
#[derive(Debug)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Option<Duration>,
    var: Duration,
    min: Duration,
}

impl RttEstimator {
    pub fn new() -> RttEstimator {
        RttEstimator {
            latest: Duration::from_secs(0),
            smoothed: None,
            var: Duration::from_secs(0),
            min: Duration::from_secs(u64::max_value()),
        }
    }

    /// Feeds one sample. The peer's reported ack delay is credited back
    /// unless that would push the sample below the observed minimum.
    pub fn update(&mut self, sample: Duration, ack_delay: Duration) {
        self.latest = sample;
        self.min = self.min.min(sample);

        let adjusted = if sample > self.min + ack_delay {
            sample - ack_delay
        } else {
            sample
        };

        match self.smoothed {
            None => {
                self.smoothed = Some(adjusted);
                self.var = adjusted / 2;
            }
            Some(smoothed) => {
                let deviation = if smoothed > adjusted {
                    smoothed - adjusted
                } else {
                    adjusted - smoothed
                };
                self.var = (self.var * 3 + deviation) / 4;
                self.smoothed = Some((smoothed * 7 + adjusted) / 8);
            }
        }
    }

    #[inline]
    pub fn latest(&self) -> Duration {
        self.latest
    }

    #[inline]
    pub fn smoothed(&self) -> Option<Duration> {
        self.smoothed
    }

    #[inline]
    pub fn var(&self) -> Duration {
        self.var
    }
}

#[derive(Debug)]
struct SpaceLedger {
    sent: BTreeMap<u64, SentPacket>,
    largest_acked: Option<u64>,
    /// Earliest deadline at which a tracked packet crosses the time
    /// threshold.
    loss_time: Option<Instant>,
}

impl SpaceLedger {
    fn new() -> SpaceLedger {
        SpaceLedger {
            sent: BTreeMap::new(),
            largest_acked: None,
            loss_time: None,
        }
    }

    fn last_eliciting_sent(&self) -> Option<Instant> {
        self.sent
            .values()
            .filter(|packet| packet.ack_eliciting)
            .map(|packet| packet.time)
            .max()
    }
}

/// Result of applying one ACK frame.
#[derive(Debug)]
pub struct AckOutcome {
    pub newly_acked: Vec<SentPacket>,
    pub lost: Vec<SentPacket>,
    pub rtt_sample: Option<Duration>,
}

/// What a fired timer asks the connection to do.
#[derive(Debug)]
pub enum TimeoutOutcome {
    /// Declare these packets lost and recycle their frames.
    Lost(Level, Vec<SentPacket>),
    /// Send this many ack-eliciting probes in the space; nothing is lost yet.
    Probe(Level, u32),
    Idle,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimerKind {
    Loss(Level),
    Pto(Level),
}

#[derive(Debug)]
pub struct LossDetection {
    spaces: [SpaceLedger; LEVEL_COUNT],
    pub rtt: RttEstimator,
    pto_count: u32,
    packet_threshold: u64,
    time_threshold: f32,
    initial_rtt: Duration,
    max_ack_delay: Duration,
}

impl LossDetection {
    pub const PROBES_PER_PTO: u32 = 2;

    pub fn new(
        packet_threshold: u64,
        time_threshold: f32,
        initial_rtt: Duration,
        max_ack_delay: Duration,
    ) -> LossDetection {
        LossDetection {
            spaces: [
                SpaceLedger::new(),
                SpaceLedger::new(),
                SpaceLedger::new(),
                SpaceLedger::new(),
            ],
            rtt: RttEstimator::new(),
            pto_count: 0,
            packet_threshold,
            time_threshold,
            initial_rtt,
            max_ack_delay,
        }
    }

    /// The peer's MAX_ACK_DELAY parameter feeds the probe timeout.
    pub fn set_max_ack_delay(&mut self, delay: Duration) {
        self.max_ack_delay = delay;
    }

    pub fn on_packet_sent(&mut self, level: Level, packet: SentPacket) {
        self.spaces[level.index()].sent.insert(packet.pn, packet);
    }

    /// Applies acknowledged ranges. The RTT sample is taken from the largest
    /// newly acked packet, but only when that packet is ack-eliciting and is
    /// the frame's largest.
    pub fn on_ack_received(
        &mut self,
        level: Level,
        frame_largest: u64,
        ranges: &[(u64, u64)],
        ack_delay: Duration,
        now: Instant,
    ) -> AckOutcome {
        let space = &mut self.spaces[level.index()];

        if space
            .largest_acked
            .map_or(true, |largest| frame_largest > largest)
        {
            space.largest_acked = Some(frame_largest);
        }

        let mut newly_acked = Vec::new();
        for &(smallest, largest) in ranges {
            let acked_pns: Vec<u64> = space
                .sent
                .range(smallest..=largest)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in acked_pns {
                newly_acked.push(space.sent.remove(&pn).unwrap());
            }
        }

        let mut rtt_sample = None;
        if let Some(largest_newly) = newly_acked.iter().map(|packet| packet.pn).max() {
            if largest_newly == frame_largest {
                let packet = newly_acked
                    .iter()
                    .find(|packet| packet.pn == largest_newly)
                    .unwrap();
                if packet.ack_eliciting {
                    let sample = now.duration_since(packet.time);
                    self.rtt.update(sample, ack_delay);
                    rtt_sample = Some(sample);
                }
            }
        }

        if !newly_acked.is_empty() {
            self.pto_count = 0;
        }

        let lost = self.detect_lost(level, now);

        AckOutcome {
            newly_acked,
            lost,
            rtt_sample,
        }
    }

    /// Declares lost everything behind the packet threshold or over the time
    /// threshold, and re-arms the space's loss time for the rest.
    pub fn detect_lost(&mut self, level: Level, now: Instant) -> Vec<SentPacket> {
        let threshold = self.loss_delay();
        let packet_threshold = self.packet_threshold;
        let space = &mut self.spaces[level.index()];

        let largest_acked = match space.largest_acked {
            Some(largest) => largest,
            None => return Vec::new(),
        };

        space.loss_time = None;
        let mut lost_pns = Vec::new();

        for (&pn, packet) in space.sent.iter() {
            if pn >= largest_acked {
                break;
            }

            if largest_acked - pn >= packet_threshold {
                lost_pns.push(pn);
                continue;
            }

            let deadline = packet.time + threshold;
            if deadline <= now {
                lost_pns.push(pn);
            } else if space
                .loss_time
                .map_or(true, |current| deadline < current)
            {
                space.loss_time = Some(deadline);
            }
        }

        lost_pns
            .into_iter()
            .map(|pn| space.sent.remove(&pn).unwrap())
            .collect()
    }

    fn loss_delay(&self) -> Duration {
        let rtt = self
            .rtt
            .smoothed()
            .unwrap_or(self.initial_rtt)
            .max(self.rtt.latest());
        rtt.mul_f32(self.time_threshold)
    }

    /// The current probe timeout, doubled for every consecutive expiry.
    pub fn pto_interval(&self) -> Duration {
        let base = match self.rtt.smoothed() {
            Some(smoothed) => smoothed + self.rtt.var() * 4 + self.max_ack_delay,
            None => self.initial_rtt * 2 + self.max_ack_delay,
        };
        base * 2u32.saturating_pow(self.pto_count.min(16))
    }

    /// The next deadline, if any timer should be armed: the earliest loss
    /// time across spaces, else a PTO anchored at the last ack-eliciting
    /// transmission.
    pub fn next_timeout(&self) -> Option<(Instant, TimerKind)> {
        let mut earliest: Option<(Instant, TimerKind)> = None;

        for level in &Level::ALL {
            if let Some(loss_time) = self.spaces[level.index()].loss_time {
                if earliest.map_or(true, |(deadline, _)| loss_time < deadline) {
                    earliest = Some((loss_time, TimerKind::Loss(*level)));
                }
            }
        }

        if earliest.is_some() {
            return earliest;
        }

        let mut pto: Option<(Instant, TimerKind)> = None;
        for level in &Level::ALL {
            if let Some(sent) = self.spaces[level.index()].last_eliciting_sent() {
                let deadline = sent + self.pto_interval();
                if pto.map_or(true, |(current, _)| deadline < current) {
                    pto = Some((deadline, TimerKind::Pto(*level)));
                }
            }
        }

        pto
    }

    /// Handles a fired timer at `now`.
    pub fn on_timeout(&mut self, now: Instant) -> TimeoutOutcome {
        match self.next_timeout() {
            Some((deadline, TimerKind::Loss(level))) if deadline <= now => {
                TimeoutOutcome::Lost(level, self.detect_lost(level, now))
            }
            Some((deadline, TimerKind::Pto(level))) if deadline <= now => {
                self.pto_count += 1;
                TimeoutOutcome::Probe(level, Self::PROBES_PER_PTO)
            }
            _ => TimeoutOutcome::Idle,
        }
    }

    #[inline]
    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    /// True when an ack-eliciting packet is outstanding in the space.
    pub fn has_eliciting_outstanding(&self, level: Level) -> bool {
        self.spaces[level.index()]
            .sent
            .values()
            .any(|packet| packet.ack_eliciting)
    }

    /// Total bytes of tracked in-flight packets; must mirror the congestion
    /// controller's ledger.
    pub fn in_flight_bytes(&self) -> u64 {
        self.spaces
            .iter()
            .flat_map(|space| space.sent.values())
            .filter(|packet| packet.in_flight)
            .map(|packet| packet.size as u64)
            .sum()
    }

    /// Drops a space's ledger outright (handshake keys retired, connection
    /// entering the draining period).
    pub fn discard(&mut self, level: Level) {
        let space = &mut self.spaces[level.index()];
        space.sent.clear();
        space.loss_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(pn: u64, time: Instant, size: usize) -> SentPacket {
        SentPacket {
            pn,
            time,
            size,
            ack_eliciting: true,
            in_flight: true,
            frames: vec![Frame::Ping],
        }
    }

    fn detector() -> LossDetection {
        LossDetection::new(
            3,
            1.125,
            Duration::from_millis(100),
            Duration::from_millis(25),
        )
    }

    #[test]
    fn test_rtt_first_sample_seeds_estimator() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(80), Duration::from_millis(0));

        assert_eq!(rtt.smoothed(), Some(Duration::from_millis(80)));
        assert_eq!(rtt.var(), Duration::from_millis(40));
    }

    #[test]
    fn test_rtt_ewma_weights() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(80), Duration::from_millis(0));
        rtt.update(Duration::from_millis(160), Duration::from_millis(0));

        // smoothed = 7/8 * 80 + 1/8 * 160 = 90
        assert_eq!(rtt.smoothed(), Some(Duration::from_millis(90)));
        // var = 3/4 * 40 + 1/4 * 80 = 50
        assert_eq!(rtt.var(), Duration::from_millis(50));
    }

    #[test]
    fn test_rtt_ack_delay_credited() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(50), Duration::from_millis(0));
        rtt.update(Duration::from_millis(100), Duration::from_millis(20));

        // adjusted = 80, smoothed = 7/8 * 50 + 1/8 * 80 = 53.75
        assert_eq!(rtt.smoothed(), Some(Duration::from_micros(53_750)));
    }

    #[test]
    fn test_packet_threshold_loss() {
        let mut detector = detector();
        let start = Instant::now();

        for pn in 1..=5u64 {
            detector.on_packet_sent(Level::Handshake, sent(pn, start, 100));
        }

        let outcome = detector.on_ack_received(
            Level::Handshake,
            5,
            &[(5, 5)],
            Duration::from_millis(0),
            start + Duration::from_millis(30),
        );

        assert_eq!(outcome.newly_acked.len(), 1);
        assert_eq!(outcome.newly_acked[0].pn, 5);

        // largest_acked - pn >= 3 declares packets 1 and 2 lost
        let lost_pns: Vec<u64> = outcome.lost.iter().map(|packet| packet.pn).collect();
        assert_eq!(lost_pns, vec![1, 2]);

        // Packets 3 and 4 remain pending on the time threshold
        assert!(detector.has_eliciting_outstanding(Level::Handshake));
        let (_, kind) = detector.next_timeout().unwrap();
        assert_eq!(kind, TimerKind::Loss(Level::Handshake));
    }

    #[test]
    fn test_time_threshold_loss() {
        let mut detector = detector();
        let start = Instant::now();

        detector.on_packet_sent(Level::OneRtt, sent(1, start, 100));
        detector.on_packet_sent(Level::OneRtt, sent(2, start + Duration::from_millis(10), 100));

        // Ack only packet 2; packet 1 is within the packet threshold
        let outcome = detector.on_ack_received(
            Level::OneRtt,
            2,
            &[(2, 2)],
            Duration::from_millis(0),
            start + Duration::from_millis(40),
        );
        assert!(outcome.lost.is_empty());

        // Beyond time_threshold * rtt the straggler is lost
        let lost = detector.detect_lost(Level::OneRtt, start + Duration::from_secs(2));
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].pn, 1);
        assert_eq!(detector.in_flight_bytes(), 0);
    }

    #[test]
    fn test_rtt_sample_requires_eliciting_largest() {
        let mut detector = detector();
        let start = Instant::now();

        let mut ack_only = sent(1, start, 50);
        ack_only.ack_eliciting = false;
        ack_only.in_flight = false;
        detector.on_packet_sent(Level::OneRtt, ack_only);

        let outcome = detector.on_ack_received(
            Level::OneRtt,
            1,
            &[(1, 1)],
            Duration::from_millis(0),
            start + Duration::from_millis(30),
        );

        assert_eq!(outcome.rtt_sample, None);
        assert_eq!(detector.rtt.smoothed(), None);
    }

    #[test]
    fn test_pto_doubles_per_expiry() {
        let mut detector = detector();
        let start = Instant::now();

        detector.on_packet_sent(Level::Initial, sent(0, start, 100));

        let base = detector.pto_interval();
        // No RTT sample yet: 2 * initial_rtt + max_ack_delay
        assert_eq!(base, Duration::from_millis(225));

        let (deadline, kind) = detector.next_timeout().unwrap();
        assert_eq!(kind, TimerKind::Pto(Level::Initial));
        assert_eq!(deadline, start + base);

        match detector.on_timeout(deadline) {
            TimeoutOutcome::Probe(Level::Initial, probes) => {
                assert_eq!(probes, LossDetection::PROBES_PER_PTO);
            }
            other => panic!("Unexpected outcome {:?}", other),
        }

        assert_eq!(detector.pto_interval(), base * 2);

        // An ACK resets the backoff
        detector.on_ack_received(
            Level::Initial,
            0,
            &[(0, 0)],
            Duration::from_millis(0),
            start + Duration::from_millis(500),
        );
        assert_eq!(detector.pto_count(), 0);
    }

    #[test]
    fn test_pto_declares_nothing_lost() {
        let mut detector = detector();
        let start = Instant::now();

        detector.on_packet_sent(Level::OneRtt, sent(3, start, 100));

        let (deadline, _) = detector.next_timeout().unwrap();
        match detector.on_timeout(deadline) {
            TimeoutOutcome::Probe(..) => {}
            other => panic!("Unexpected outcome {:?}", other),
        }

        assert!(detector.has_eliciting_outstanding(Level::OneRtt));
        assert_eq!(detector.in_flight_bytes(), 100);
    }

    #[test]
    fn test_spaces_are_independent() {
        let mut detector = detector();
        let start = Instant::now();

        detector.on_packet_sent(Level::Initial, sent(7, start, 100));
        detector.on_packet_sent(Level::OneRtt, sent(7, start, 200));

        let outcome = detector.on_ack_received(
            Level::Initial,
            7,
            &[(7, 7)],
            Duration::from_millis(0),
            start + Duration::from_millis(20),
        );

        assert_eq!(outcome.newly_acked.len(), 1);
        assert!(detector.has_eliciting_outstanding(Level::OneRtt));
        assert!(!detector.has_eliciting_outstanding(Level::Initial));
    }

    #[test]
    fn test_discard_clears_ledger() {
        let mut detector = detector();
        let start = Instant::now();

        detector.on_packet_sent(Level::Initial, sent(0, start, 100));
        detector.discard(Level::Initial);

        assert!(!detector.has_eliciting_outstanding(Level::Initial));
        assert_eq!(detector.in_flight_bytes(), 0);
        assert!(detector.next_timeout().is_none());
    }
}
