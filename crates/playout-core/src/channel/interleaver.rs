//! Matrix interleaving
//!
//! The sender writes leaves (groups of `units_per_leaf` units) row by row
//! into an n1×n2 matrix and transmits it column by column, one column per
//! packet. Adjacent leaves therefore travel in different packets, and a
//! burst of lost packets turns into isolated single-leaf gaps after
//! de-interleaving, which repair handles far better than a long hole.
//!
//! Two matrices alternate between filling and draining, so every leaf waits
//! exactly one interleave period (n1·n2 leaves) before it is sent.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use super::header::{InterleaverHeader, MAX_INTERLEAVE_DIM};
use super::{put_unit, split_frames, ChannelCodec, ChannelCoderKind, ChannelPacket, DecodedUnit, PacketShape};
use crate::codec::{CodecId, CodecRegistry};
use crate::error::{Error, Result};
use crate::time::Timestamp;
use crate::unit::{CodedUnit, MediaUnit};

pub const DEFAULT_N1: u8 = 4;
pub const DEFAULT_N2: u8 = 4;

/// Lost groups filled with placeholders when decoding rotates past them;
/// units beyond this are left for the source to count as lost
const MAX_PLACEHOLDER_GROUPS: i64 = 8;

type Leaf = Option<Vec<CodedUnit>>;

#[derive(Debug)]
struct TxMatrix {
    base: Timestamp,
    codec: Option<CodecId>,
    slots: Vec<Leaf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    n1: usize,
    n2: usize,
    units_per_leaf: usize,
    codec: CodecId,
    unit_dur: Timestamp,
}

impl Geometry {
    fn leaves(&self) -> usize {
        self.n1 * self.n2
    }

    fn leaf_dur(&self) -> Timestamp {
        self.unit_dur.scale(self.units_per_leaf as u64)
    }

    fn group_dur(&self) -> Timestamp {
        self.leaf_dur().scale(self.leaves() as u64)
    }

    /// Placeholders for every unit of a group that never arrived
    fn placeholders(&self, base: Timestamp) -> impl Iterator<Item = DecodedUnit> + '_ {
        let unit_dur = self.unit_dur;
        (0..self.leaves() * self.units_per_leaf)
            .map(move |i| DecodedUnit::placeholder(base + unit_dur.scale(i as u64)))
    }
}

#[derive(Debug)]
struct RxGroup {
    base: Timestamp,
    geometry: Geometry,
    /// Bit `phase` set once that column arrived
    seen: u8,
    slots: Vec<Leaf>,
}

impl RxGroup {
    fn new(base: Timestamp, geometry: Geometry) -> Self {
        Self {
            base,
            geometry,
            seen: 0,
            slots: vec![None; geometry.leaves()],
        }
    }

    fn is_complete(&self) -> bool {
        self.seen.count_ones() as usize == self.geometry.n2
    }

    /// Every unit in playout order; leaves of missing columns become
    /// placeholders, absent (silent) leaves produce nothing
    fn release(self) -> Vec<DecodedUnit> {
        let g = self.geometry;
        let mut out = Vec::new();
        for (k, leaf) in self.slots.into_iter().enumerate() {
            let leaf_ts = self.base + g.leaf_dur().scale(k as u64);
            let column = k % g.n2;
            match leaf {
                Some(units) => out.extend(
                    units
                        .into_iter()
                        .enumerate()
                        .map(|(j, unit)| DecodedUnit::primary(leaf_ts + g.unit_dur.scale(j as u64), unit)),
                ),
                None if self.seen & (1u8 << column) == 0 => out.extend(
                    (0..g.units_per_leaf).map(|j| DecodedUnit::placeholder(leaf_ts + g.unit_dur.scale(j as u64))),
                ),
                None => {}
            }
        }
        out
    }
}

#[derive(Debug)]
pub struct InterleaverCoder {
    registry: Arc<CodecRegistry>,
    payload_type: u8,
    n1: u8,
    n2: u8,
    units_per_leaf: u8,

    leaf: Vec<Option<CodedUnit>>,
    leaf_ts: Option<Timestamp>,
    fill: Option<TxMatrix>,
    drain: Option<TxMatrix>,
    fill_index: usize,
    leaves_in: u64,
    next_phase: usize,
    marker_pending: bool,

    rx: Option<RxGroup>,
    last_group: Option<(Timestamp, Geometry)>,
    latency: Timestamp,
}

impl InterleaverCoder {
    pub fn new(registry: Arc<CodecRegistry>, payload_type: u8) -> Self {
        Self {
            registry,
            payload_type,
            n1: DEFAULT_N1,
            n2: DEFAULT_N2,
            units_per_leaf: 1,
            leaf: Vec::new(),
            leaf_ts: None,
            fill: None,
            drain: None,
            fill_index: 0,
            leaves_in: 0,
            next_phase: 0,
            marker_pending: true,
            rx: None,
            last_group: None,
            latency: Timestamp::zero(1000),
        }
    }

    pub fn dimensions(&self) -> (u8, u8) {
        (self.n1, self.n2)
    }

    pub fn set_units_per_leaf(&mut self, units: u8) -> Result<()> {
        if units == 0 {
            return Err(Error::Configuration("units per leaf must be positive".into()));
        }
        self.units_per_leaf = units;
        self.reset();
        Ok(())
    }

    fn leaves(&self) -> usize {
        self.n1 as usize * self.n2 as usize
    }

    fn place_leaf(&mut self, leaf: Leaf, ts: Timestamp) -> Result<Vec<ChannelPacket>> {
        let leaves = self.leaves();
        let matrix = self.fill.get_or_insert_with(|| TxMatrix {
            base: ts,
            codec: None,
            slots: Vec::with_capacity(leaves),
        });

        let leaf = match (leaf, matrix.codec) {
            (Some(units), Some(codec)) if units[0].codec != codec => {
                debug!("Leaf codec {} differs from group codec {}, sending as gap", units[0].codec, codec);
                None
            }
            (Some(units), None) => {
                matrix.codec = Some(units[0].codec);
                Some(units)
            }
            (leaf, _) => leaf,
        };
        matrix.slots.push(leaf);
        self.fill_index += 1;
        self.leaves_in += 1;

        let mut out = Vec::new();
        if self.leaves_in % self.n1 as u64 == 0 {
            out.extend(self.emit_column()?);
        }
        if self.fill_index == leaves {
            self.drain = self.fill.take();
            self.fill_index = 0;
            self.next_phase = 0;
        }
        Ok(out)
    }

    fn emit_column(&mut self) -> Result<Option<ChannelPacket>> {
        let (n1, n2) = (self.n1 as usize, self.n2 as usize);
        let drain = match self.drain.as_ref() {
            Some(drain) if self.next_phase < n2 => drain,
            _ => return Ok(None),
        };
        let phase = self.next_phase;
        self.next_phase += 1;

        let codec = match drain.codec {
            Some(codec) => codec,
            None => {
                self.marker_pending = true;
                return Ok(None);
            }
        };
        let mut presence = 0u8;
        let mut body = BytesMut::new();
        for row in 0..n1 {
            if let Some(Some(units)) = drain.slots.get(row * n2 + phase) {
                presence |= InterleaverHeader::row_bit(row);
                units.iter().for_each(|u| put_unit(&mut body, u));
            }
        }
        if presence == 0 {
            self.marker_pending = true;
            return Ok(None);
        }

        let info = self.registry.require(codec)?;
        let leaf_dur = info.frame_duration().scale(self.units_per_leaf as u64);
        let ts = drain.base + leaf_dur.scale(phase as u64);

        let mut payload = BytesMut::with_capacity(InterleaverHeader::SIZE + body.len());
        InterleaverHeader {
            payload_type: info.payload_type,
            units_per_leaf: self.units_per_leaf,
            n1: self.n1,
            n2: self.n2,
            phase: phase as u8,
            presence,
        }
        .serialize(&mut payload)?;
        payload.extend_from_slice(&body);

        self.latency = leaf_dur.scale(self.leaves() as u64);
        let packet = ChannelPacket::new(ts, self.marker_pending, self.payload_type, payload.freeze());
        self.marker_pending = false;
        trace!("Interleaved column {} at {} (rows {:#04x})", phase, ts, presence);
        Ok(Some(packet))
    }

    fn parse(&self, packet: &ChannelPacket) -> Result<(InterleaverHeader, Geometry, bytes::Bytes)> {
        let mut payload = packet.payload();
        let header = InterleaverHeader::parse(&mut payload)?;
        let codec = self
            .registry
            .by_payload_type(header.payload_type)
            .ok_or(Error::UnknownPayloadType(header.payload_type))?;
        let info = self.registry.require(codec)?;
        let expected = header.present_rows() * header.units_per_leaf as usize * info.wire_frame_len();
        if payload.remaining() != expected {
            return Err(Error::ProtocolViolation(format!(
                "interleaved column carries {} bytes, expected {}",
                payload.remaining(),
                expected
            )));
        }
        let geometry = Geometry {
            n1: header.n1 as usize,
            n2: header.n2 as usize,
            units_per_leaf: header.units_per_leaf as usize,
            codec,
            unit_dur: info.frame_duration(),
        };
        Ok((header, geometry, payload))
    }

    /// Units of a column from a group already released: play what arrived
    fn stray_column(base: Timestamp, g: &Geometry, phase: usize, leaves: Vec<Leaf>) -> Vec<DecodedUnit> {
        let mut out = Vec::new();
        for (row, leaf) in leaves.into_iter().enumerate() {
            if let Some(units) = leaf {
                let leaf_ts = base + g.leaf_dur().scale((row * g.n2 + phase) as u64);
                out.extend(
                    units
                        .into_iter()
                        .enumerate()
                        .map(|(j, unit)| DecodedUnit::primary(leaf_ts + g.unit_dur.scale(j as u64), unit)),
                );
            }
        }
        out
    }
}

impl ChannelCodec for InterleaverCoder {
    fn kind(&self) -> ChannelCoderKind {
        ChannelCoderKind::Interleaver
    }

    fn encode(&mut self, ts: Timestamp, unit: &MediaUnit) -> Result<Vec<ChannelPacket>> {
        if self.leaf.is_empty() {
            self.leaf_ts = Some(ts);
        }
        self.leaf.push(unit.coded_reps().next().cloned());
        if self.leaf.len() < self.units_per_leaf as usize {
            return Ok(Vec::new());
        }

        let leaf_ts = self.leaf_ts.take().unwrap_or(ts);
        // A leaf is sent only when every unit in it is coded with one codec.
        let leaf: Leaf = self.leaf.drain(..).collect::<Option<Vec<_>>>().filter(|units| {
            units.iter().all(|u| u.codec == units[0].codec)
        });
        self.place_leaf(leaf, leaf_ts)
    }

    fn decode(&mut self, packet: &ChannelPacket) -> Result<Vec<DecodedUnit>> {
        let (header, geometry, mut body) = self.parse(packet)?;
        let phase = header.phase as usize;
        let base = packet.ts - geometry.leaf_dur().scale(phase as u64);

        let leaf_len = geometry.units_per_leaf * self.registry.require(geometry.codec)?.wire_frame_len();
        let mut leaves = Vec::with_capacity(geometry.n1);
        for row in 0..geometry.n1 {
            if header.is_present(row) {
                let block = body.split_to(leaf_len);
                leaves.push(Some(split_frames(&self.registry, geometry.codec, &block)?));
            } else {
                leaves.push(None);
            }
        }
        self.latency = geometry.group_dur();

        let mut out = Vec::new();
        if let Some(current) = self.rx.take() {
            if current.base == base && current.geometry == geometry {
                self.rx = Some(current);
            } else if base.is_after(&current.base) {
                trace!("Releasing incomplete group at {}", current.base);
                out.extend(current.release());
            } else {
                self.rx = Some(current);
                out.extend(Self::stray_column(base, &geometry, phase, leaves));
                return Ok(out);
            }
        }

        if self.rx.is_none() {
            if let Some((last_base, last_geometry)) = self.last_group {
                if !base.is_after(&last_base) {
                    trace!("Column {} of released group at {}", phase, base);
                    out.extend(Self::stray_column(base, &geometry, phase, leaves));
                    return Ok(out);
                }
                if last_geometry == geometry && !packet.marker {
                    let group_ticks = geometry.group_dur().convert(base.freq()).ticks().max(1) as i64;
                    let skipped = base.signed_delta(&last_base) / group_ticks - 1;
                    if skipped > 0 {
                        debug!("Rotating past {} lost interleaver groups", skipped);
                        for i in 1..=skipped.min(MAX_PLACEHOLDER_GROUPS) {
                            let missing = last_base + geometry.group_dur().scale(i as u64);
                            out.extend(geometry.placeholders(missing));
                        }
                    }
                }
            }
            self.rx = Some(RxGroup::new(base, geometry));
            self.last_group = Some((base, geometry));
        }

        if let Some(group) = self.rx.as_mut() {
            group.seen |= 1u8 << phase;
            for (row, leaf) in leaves.into_iter().enumerate() {
                group.slots[row * geometry.n2 + phase] = leaf;
            }
            if group.is_complete() {
                if let Some(group) = self.rx.take() {
                    out.extend(group.release());
                }
            }
        }
        Ok(out)
    }

    fn flush(&mut self, now: Timestamp) -> Vec<DecodedUnit> {
        match self.rx.take() {
            Some(group) if !group.base.is_after(&now) => {
                trace!("Group at {} reached its deadline", group.base);
                group.release()
            }
            pending => {
                self.rx = pending;
                Vec::new()
            }
        }
    }

    fn describe(&self, packet: &ChannelPacket) -> Result<PacketShape> {
        let (header, geometry, _) = self.parse(packet)?;
        Ok(PacketShape {
            codec: geometry.codec,
            units: header.present_rows() * geometry.units_per_leaf,
            latency: geometry.group_dur(),
        })
    }

    fn reset(&mut self) {
        self.leaf.clear();
        self.leaf_ts = None;
        self.fill = None;
        self.drain = None;
        self.fill_index = 0;
        self.leaves_in = 0;
        self.next_phase = 0;
        self.marker_pending = true;
        self.rx = None;
        self.last_group = None;
    }

    fn set_parameters(&mut self, params: &str) -> Result<()> {
        let dims: Vec<u8> = params
            .trim()
            .split('/')
            .map(|s| s.trim().parse::<u8>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::Configuration(format!("invalid interleaver parameters '{}'", params)))?;
        let (n1, n2) = match dims[..] {
            [n1, n2] => (n1, n2),
            _ => {
                return Err(Error::Configuration(format!(
                    "interleaver parameters must be n1/n2, got '{}'",
                    params
                )))
            }
        };
        for dim in [n1, n2] {
            if !(1..=MAX_INTERLEAVE_DIM).contains(&dim) {
                return Err(Error::Configuration(format!(
                    "interleaver dimension {} outside 1..={}",
                    dim, MAX_INTERLEAVE_DIM
                )));
            }
        }
        debug!("Interleaver set to {}x{}", n1, n2);
        self.n1 = n1;
        self.n2 = n2;
        self.reset();
        Ok(())
    }

    fn parameters(&self) -> String {
        format!("{}/{}", self.n1, self.n2)
    }

    fn latency(&self) -> Timestamp {
        self.latency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn coder(params: &str) -> (InterleaverCoder, CodecId) {
        let registry = Arc::new(CodecRegistry::with_defaults());
        let l16 = registry.by_name("L16-8K-MONO").unwrap();
        let mut coder = InterleaverCoder::new(registry, 122);
        coder.set_parameters(params).unwrap();
        (coder, l16)
    }

    fn ts(n: u64) -> Timestamp {
        Timestamp::new(n * 160, 8000)
    }

    fn encode_run(coder: &mut InterleaverCoder, codec: CodecId, voiced: u64, silent: u64) -> Vec<ChannelPacket> {
        let mut packets = Vec::new();
        for n in 0..voiced + silent {
            let unit = if n < voiced {
                MediaUnit::coded(CodedUnit::new(codec, Bytes::from(vec![n as u8; 320])))
            } else {
                MediaUnit::placeholder()
            };
            packets.extend(coder.encode(ts(n), &unit).unwrap());
        }
        packets
    }

    #[test]
    fn test_columns_carry_strided_units() {
        let (mut tx, l16) = coder("4/4");
        let packets = encode_run(&mut tx, l16, 16, 16);
        assert_eq!(packets.len(), 4);
        assert!(packets[0].marker);
        assert_eq!(packets[1].ts, ts(1));

        let mut payload = packets[1].payload();
        let header = InterleaverHeader::parse(&mut payload).unwrap();
        assert_eq!((header.n1, header.n2, header.phase, header.presence), (4, 4, 1, 0xf0));
        // Column 1 holds units 1, 5, 9 and 13.
        let firsts: Vec<u8> = (0..4).map(|row| payload[row * 320]).collect();
        assert_eq!(firsts, vec![1, 5, 9, 13]);
        assert_eq!(tx.latency(), ts(16));
    }

    #[test]
    fn test_round_trip_in_order() {
        let (mut tx, l16) = coder("4/4");
        let packets = encode_run(&mut tx, l16, 16, 16);
        let (mut rx, _) = coder("4/4");
        let mut out = Vec::new();
        for p in &packets {
            out.extend(rx.decode(p).unwrap());
        }
        assert_eq!(out.len(), 16);
        for (n, unit) in out.iter().enumerate() {
            assert_eq!(unit.ts, ts(n as u64));
            assert_eq!(unit.unit.as_ref().unwrap().data[0], n as u8);
        }
    }

    #[test]
    fn test_lost_group_rotates_to_placeholders() {
        let (mut tx, l16) = coder("4/4");
        let packets = encode_run(&mut tx, l16, 48, 16);
        assert_eq!(packets.len(), 12);
        let (mut rx, _) = coder("4/4");
        let mut out = Vec::new();
        for p in packets.iter().filter(|p| p.ts.is_before(&ts(16)) || !p.ts.is_before(&ts(32))) {
            out.extend(rx.decode(p).unwrap());
        }
        assert_eq!(out.len(), 48);
        for (n, unit) in out.iter().enumerate() {
            assert_eq!(unit.ts, ts(n as u64));
            assert_eq!(unit.is_placeholder(), (16..32).contains(&n));
        }
    }

    #[test]
    fn test_long_loss_run_still_yields_placeholders() {
        let (mut tx, l16) = coder("4/4");
        let packets = encode_run(&mut tx, l16, 128, 16);
        assert_eq!(packets.len(), 32);
        let (mut rx, _) = coder("4/4");
        let mut out = Vec::new();
        // Only groups 0 and 7 get through.
        for p in packets.iter().filter(|p| p.ts.is_before(&ts(16)) || !p.ts.is_before(&ts(112))) {
            out.extend(rx.decode(p).unwrap());
        }
        assert_eq!(out.len(), 128);
        for (n, unit) in out.iter().enumerate() {
            assert_eq!(unit.ts, ts(n as u64));
            assert_eq!(unit.is_placeholder(), (16..112).contains(&n), "unit {}", n);
        }
    }

    #[test]
    fn test_placeholders_capped_after_very_long_gap() {
        let (mut tx, l16) = coder("2/2");
        let packets = encode_run(&mut tx, l16, 80, 8);
        let (mut rx, _) = coder("2/2");
        let mut out = Vec::new();
        // Groups 1..=18 lost: more than the placeholder cap.
        for p in packets.iter().filter(|p| p.ts.is_before(&ts(4)) || !p.ts.is_before(&ts(76))) {
            out.extend(rx.decode(p).unwrap());
        }
        let placeholders = out.iter().filter(|u| u.is_placeholder()).count();
        assert_eq!(placeholders, MAX_PLACEHOLDER_GROUPS as usize * 4);
        assert_eq!(out.iter().filter(|u| !u.is_placeholder()).count(), 8);
        assert!(out.iter().filter(|u| u.is_placeholder()).all(|u| u.ts.is_before(&ts(4 + 32))));
    }

    #[test]
    fn test_flush_releases_at_deadline() {
        let (mut tx, l16) = coder("4/4");
        let packets = encode_run(&mut tx, l16, 16, 16);
        let (mut rx, _) = coder("4/4");
        for p in packets.iter().filter(|p| p.ts != ts(1)) {
            assert!(rx.decode(p).unwrap().is_empty());
        }
        let out = rx.flush(ts(0));
        assert_eq!(out.len(), 16);
        let missing: Vec<usize> = out
            .iter()
            .enumerate()
            .filter(|(_, u)| u.is_placeholder())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(missing, vec![1, 5, 9, 13]);
        for (n, unit) in out.iter().enumerate() {
            assert_eq!(unit.ts, ts(n as u64));
        }
        assert!(rx.flush(ts(100)).is_empty());
    }

    #[test]
    fn test_sparse_group_skips_silent_leaves() {
        let (mut tx, l16) = coder("2/2");
        // Three voiced units then silence: leaf 3 is absent.
        let packets = encode_run(&mut tx, l16, 3, 9);
        assert_eq!(packets.len(), 2);
        let (mut rx, _) = coder("2/2");
        let mut out = Vec::new();
        for p in &packets {
            out.extend(rx.decode(p).unwrap());
        }
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|u| !u.is_placeholder()));
    }

    #[test]
    fn test_bad_dimensions_rejected() {
        let (mut c, _) = coder("4/4");
        for bad in ["9/2", "0/4", "4", "4/4/4", "a/b"] {
            assert!(matches!(c.set_parameters(bad), Err(Error::Configuration(_))), "accepted {}", bad);
        }
        assert_eq!(c.parameters(), "4/4");
        assert_eq!(c.dimensions(), (4, 4));
    }
}
