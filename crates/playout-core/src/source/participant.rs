//! Long-lived per-sender state
//!
//! A [`PersistentSourceEntry`] is created the first time a sender is heard
//! and survives silence; only an explicit leave or timeout removes it. The
//! live decode state ([`super::Source`]) comes and goes with activity and
//! reads its playout parameters from here.

use std::collections::HashMap;

use crate::channel::ChannelCoderKind;
use crate::codec::CodecId;
use crate::stats::SourceStats;
use crate::time::Timestamp;

/// Maps 32-bit RTP timestamps onto a continuous [`Timestamp`] line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpClock {
    last_rtp: u32,
    last: Timestamp,
}

impl RtpClock {
    pub fn new(rtp_ts: u32, freq: u32) -> Self {
        Self {
            last_rtp: rtp_ts,
            last: Timestamp::new(rtp_ts as u64, freq),
        }
    }

    pub fn freq(&self) -> u32 {
        self.last.freq()
    }

    /// Extend an RTP timestamp, tolerating wrap and reordering
    pub fn extend(&mut self, rtp_ts: u32) -> Timestamp {
        let delta = rtp_ts.wrapping_sub(self.last_rtp) as i32;
        let ts = self.last.add_ticks(delta as i64);
        if delta > 0 {
            self.last_rtp = rtp_ts;
            self.last = ts;
        }
        ts
    }
}

/// Persistent state of one sender
#[derive(Debug, Clone)]
pub struct PersistentSourceEntry {
    pub ssrc: u32,
    pub clock: Option<RtpClock>,

    /// Jitter estimate in ticks of the entry's clock
    pub jitter: f64,
    pub transit: Timestamp,
    /// Slow average of transit since talkspurt start
    pub avg_transit: Timestamp,
    pub last_transit: Timestamp,
    /// Offset from sender time to local playout time
    pub playout: Timestamp,
    /// Buffering the playout offset was computed to provide
    pub desired_delay: Timestamp,
    pub last_gap: Timestamp,

    pub last_seq: Option<u16>,
    pub last_src_ts: Option<Timestamp>,
    pub last_arrival: Option<Timestamp>,
    pub consecutive_late: u32,
    pub force_recompute: bool,

    pub coder: Option<ChannelCoderKind>,
    pub codec: Option<CodecId>,
    pub units_per_packet: usize,

    pub stats: SourceStats,
}

impl PersistentSourceEntry {
    pub fn new(ssrc: u32) -> Self {
        let zero = Timestamp::zero(8000);
        Self {
            ssrc,
            clock: None,
            jitter: 0.0,
            transit: zero,
            avg_transit: zero,
            last_transit: zero,
            playout: zero,
            desired_delay: zero,
            last_gap: zero,
            last_seq: None,
            last_src_ts: None,
            last_arrival: None,
            consecutive_late: 0,
            force_recompute: false,
            coder: None,
            codec: None,
            units_per_packet: 0,
            stats: SourceStats::default(),
        }
    }

    /// Sender timestamp of a packet, on the codec clock
    ///
    /// A change of clock rate restarts the mapping.
    pub fn source_timestamp(&mut self, rtp_ts: u32, freq: u32) -> Timestamp {
        match self.clock.as_mut() {
            Some(clock) if clock.freq() == freq => clock.extend(rtp_ts),
            _ => {
                let clock = RtpClock::new(rtp_ts, freq);
                self.clock = Some(clock);
                Timestamp::new(rtp_ts as u64, freq)
            }
        }
    }

    /// Jitter estimate in milliseconds
    pub fn jitter_ms(&self) -> f64 {
        self.jitter * 1000.0 / self.transit.freq() as f64
    }
}

/// Lookup, creation and removal of persistent sender state
pub trait ParticipantStore {
    fn lookup(&self, ssrc: u32) -> Option<&PersistentSourceEntry>;

    fn lookup_mut(&mut self, ssrc: u32) -> Option<&mut PersistentSourceEntry>;

    /// Existing entry, or a fresh one on first sight
    fn get_or_create(&mut self, ssrc: u32) -> &mut PersistentSourceEntry;

    fn remove(&mut self, ssrc: u32) -> Option<PersistentSourceEntry>;

    fn ssrcs(&self) -> Vec<u32>;
}

/// In-process participant table
#[derive(Debug, Default)]
pub struct MemoryParticipantStore {
    entries: HashMap<u32, PersistentSourceEntry>,
}

impl MemoryParticipantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ParticipantStore for MemoryParticipantStore {
    fn lookup(&self, ssrc: u32) -> Option<&PersistentSourceEntry> {
        self.entries.get(&ssrc)
    }

    fn lookup_mut(&mut self, ssrc: u32) -> Option<&mut PersistentSourceEntry> {
        self.entries.get_mut(&ssrc)
    }

    fn get_or_create(&mut self, ssrc: u32) -> &mut PersistentSourceEntry {
        self.entries
            .entry(ssrc)
            .or_insert_with(|| PersistentSourceEntry::new(ssrc))
    }

    fn remove(&mut self, ssrc: u32) -> Option<PersistentSourceEntry> {
        self.entries.remove(&ssrc)
    }

    fn ssrcs(&self) -> Vec<u32> {
        let mut ssrcs: Vec<u32> = self.entries.keys().copied().collect();
        ssrcs.sort_unstable();
        ssrcs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_clock_survives_wrap_and_reordering() {
        let mut clock = RtpClock::new(u32::MAX - 99, 8000);
        let first = Timestamp::new((u32::MAX - 99) as u64, 8000);

        let a = clock.extend(60);
        assert_eq!(a.signed_delta(&first), 160);

        // A reordered packet from before the wrap does not move the clock.
        let b = clock.extend(60u32.wrapping_sub(320));
        assert_eq!(a.signed_delta(&b), 320);

        let c = clock.extend(220);
        assert_eq!(c.signed_delta(&a), 160);
    }

    #[test]
    fn test_store_lifecycle() {
        let mut store = MemoryParticipantStore::new();
        store.get_or_create(7).last_seq = Some(10);
        assert_eq!(store.get_or_create(7).last_seq, Some(10));
        store.get_or_create(3);
        assert_eq!(store.ssrcs(), vec![3, 7]);
        assert!(store.remove(7).is_some());
        assert!(store.lookup(7).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_clock_restarts_on_rate_change() {
        let mut entry = PersistentSourceEntry::new(1);
        let a = entry.source_timestamp(1000, 8000);
        assert_eq!(a, Timestamp::new(1000, 8000));
        let b = entry.source_timestamp(5000, 16000);
        assert_eq!(b.freq(), 16000);
        assert_eq!(b.ticks(), 5000);
    }
}
