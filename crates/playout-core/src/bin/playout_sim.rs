//! Playout pipeline simulator
//!
//! Synthesises one or more talkers (sine tones), sends them through a
//! channel coder over a simulated network with loss, jitter and clock skew,
//! and runs the receive pipeline on the result. Prints per-source statistics
//! as JSON.
//!
//! ```text
//! playout_sim --coder redundancy --loss 0.1 --jitter-ms 15
//! playout_sim --coder interleaver --params 4/4 --loss 0.05 --skew-percent 1
//! RUST_LOG=voxmesh_playout_core=debug playout_sim --sources 3 --mix
//! ```

use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use voxmesh_playout_core::channel::{ChannelCodec, ChannelCoder, ChannelCoderKind};
use voxmesh_playout_core::codec::CodecRegistry;
use voxmesh_playout_core::mixer::{Mixer, RecordingMixer, SummingMixer};
use voxmesh_playout_core::render::StereoPanner;
use voxmesh_playout_core::unit::MediaUnit;
use voxmesh_playout_core::{AudioFrame, Error, PipelineConfig, Result, RtpPacketInfo, SourceManager, SourceStats, Timestamp};

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive-side playout pipeline simulator", long_about = None)]
struct Args {
    /// Primary codec name
    #[arg(long, default_value = "L16-8K-MONO")]
    codec: String,

    /// Channel coder: vanilla, redundancy or interleaver
    #[arg(long, default_value = "vanilla")]
    coder: String,

    /// Channel coder parameter string (defaults depend on the coder)
    #[arg(long)]
    params: Option<String>,

    /// Number of simultaneous talkers
    #[arg(long, default_value_t = 1)]
    sources: u32,

    /// Talkspurt length in seconds
    #[arg(long, default_value_t = 10.0)]
    seconds: f64,

    /// Packet loss probability
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

    /// Maximum extra network delay in milliseconds
    #[arg(long, default_value_t = 0)]
    jitter_ms: u32,

    /// Sender clock error in percent (positive: sender runs fast)
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    skew_percent: f64,

    /// Base one-way network delay in milliseconds
    #[arg(long, default_value_t = 20)]
    delay_ms: u32,

    /// Service tick in milliseconds
    #[arg(long, default_value_t = 10)]
    tick_ms: u32,

    /// Pipeline configuration (JSON)
    #[arg(long)]
    config: Option<String>,

    /// Mix and pan all sources instead of recording them
    #[arg(long)]
    mix: bool,

    /// Random seed
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

/// A packet on its way to the receiver
struct InFlight {
    info: RtpPacketInfo,
    payload: Bytes,
}

#[derive(Serialize)]
struct SourceReport {
    ssrc: String,
    sent: u64,
    dropped: u64,
    stats: SourceStats,
    repair_ratio: f64,
}

#[derive(Serialize)]
struct Report {
    codec: String,
    coder: String,
    params: String,
    sources: Vec<SourceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mixed_mean_amplitude: Option<f64>,
}

fn default_params(kind: ChannelCoderKind, codec: &str) -> String {
    match kind {
        ChannelCoderKind::Vanilla => "1".to_string(),
        ChannelCoderKind::Redundancy => {
            let secondary = codec.to_ascii_uppercase().replacen("L16", "L8", 1);
            format!("{}/0/{}/2", codec, secondary)
        }
        ChannelCoderKind::Interleaver => "4/4".to_string(),
    }
}

/// Encode one talker and push its packets through the simulated network
fn simulate_talker(
    args: &Args,
    registry: &Arc<CodecRegistry>,
    config: &PipelineConfig,
    kind: ChannelCoderKind,
    params: &str,
    ssrc: u32,
    tone_hz: f64,
    rng: &mut SmallRng,
) -> Result<(Vec<InFlight>, u64, u64)> {
    let primary = registry
        .by_name(&args.codec)
        .ok_or_else(|| Error::Configuration(format!("unknown codec '{}'", args.codec)))?;
    let info = registry.require(primary)?.clone();
    let mut coder = ChannelCoder::with_parameters(kind, registry.clone(), config.payload_types, params)?;

    // Redundancy needs every layer's encoding of each unit.
    let mut encoders = vec![(primary, registry.encoder(primary)?)];
    if kind == ChannelCoderKind::Redundancy {
        for field in params.split('/').step_by(2).skip(1) {
            if let Some(id) = registry.by_name(field) {
                encoders.push((id, registry.encoder(id)?));
            }
        }
    }

    let rate = info.format.sample_rate;
    let channels = info.format.channels as usize;
    let spf = info.samples_per_frame;
    let frames = (args.seconds * 1000.0 / info.frame_duration().as_millis().max(1) as f64) as u64;
    // Flush whatever the coder still holds with a few silent units.
    let tail = 64;
    let clock = 1.0 + args.skew_percent / 100.0;
    let rtp_base: u32 = rng.gen();
    let mut seq: u16 = rng.gen();

    let mut out = Vec::new();
    let (mut sent, mut dropped) = (0, 0);
    for n in 0..frames + tail {
        let ts = Timestamp::new(n * spf as u64, rate);
        let unit = if n < frames {
            let samples = (0..spf)
                .flat_map(|i| {
                    let t = (n as usize * spf + i) as f64 / rate as f64;
                    let s = ((t * tone_hz * 2.0 * std::f64::consts::PI).sin() * 8000.0) as i16;
                    std::iter::repeat(s).take(channels)
                })
                .collect();
            let frame = AudioFrame::new(samples, info.format);
            let mut unit = MediaUnit::placeholder();
            for (i, (_, encoder)) in encoders.iter_mut().enumerate() {
                let coded = encoder.encode(&frame)?;
                if i == 0 {
                    unit.add_primary(coded);
                } else {
                    unit.add_redundant(coded);
                }
            }
            unit
        } else {
            MediaUnit::placeholder()
        };

        // Sent once the frame is complete, on the sender's clock.
        let sent_at = ((n + 1) * spf as u64) as f64 / clock;
        for packet in coder.encode(ts, &unit)? {
            sent += 1;
            seq = seq.wrapping_add(1);
            if rng.gen_bool(args.loss.clamp(0.0, 1.0)) {
                dropped += 1;
                continue;
            }
            let jitter = if args.jitter_ms > 0 {
                rng.gen_range(0..=args.jitter_ms as u64 * rate as u64 / 1000)
            } else {
                0
            };
            let delay = args.delay_ms as u64 * rate as u64 / 1000;
            let arrival = Timestamp::new(sent_at.round() as u64 + delay + jitter, rate);
            let pt = packet
                .payload_type()
                .ok_or_else(|| Error::ProtocolViolation("empty packet".into()))?;
            let rtp_ts = rtp_base.wrapping_add(packet.ts.ticks() as u32);
            let rtp = RtpPacketInfo::new(ssrc, seq, rtp_ts, pt, arrival).with_marker(packet.marker);
            out.push(InFlight {
                info: rtp,
                payload: packet.payload(),
            });
        }
    }
    debug!("Talker {:#010x}: {} packets sent, {} dropped", ssrc, sent, dropped);
    Ok((out, sent, dropped))
}

fn run(args: Args) -> Result<Report> {
    let config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| Error::Configuration(format!("cannot read {}: {}", path, e)))?;
            PipelineConfig::from_json(&json)?
        }
        None => PipelineConfig::default(),
    };
    let registry = Arc::new(CodecRegistry::with_defaults());
    let kind: ChannelCoderKind = args.coder.parse()?;
    let params = args.params.clone().unwrap_or_else(|| default_params(kind, &args.codec));
    let mut rng = SmallRng::seed_from_u64(args.seed);

    let mut network = Vec::new();
    let mut counts = Vec::new();
    for i in 0..args.sources.max(1) {
        let ssrc = 0x5000_0000 + i;
        let tone = 220.0 * (i + 1) as f64;
        let (packets, sent, dropped) =
            simulate_talker(&args, &registry, &config, kind, &params, ssrc, tone, &mut rng)?;
        network.extend(packets);
        counts.push((ssrc, sent, dropped));
    }
    network.sort_by(|a, b| a.info.arrival.cmp(&b.info.arrival));
    info!("Simulating {} packets from {} sources", network.len(), counts.len());

    let output_rate = config.output_format.sample_rate;
    let step = Timestamp::from_millis(args.tick_ms.max(1) as u64, output_rate);
    let horizon = network
        .last()
        .map(|p| p.info.arrival.convert(output_rate).ticks())
        .unwrap_or(0)
        + Timestamp::from_millis(2000, output_rate).ticks();

    let mut manager = SourceManager::new(config.clone(), registry)?;
    let mut recorder = RecordingMixer::new();
    let mut summer = SummingMixer::new(config.output_format, Timestamp::zero(output_rate));
    let mut amplitude = (0.0, 0u64);
    let mut pending = network.into_iter().peekable();

    let mut start = Timestamp::zero(output_rate);
    while start.ticks() < horizon {
        let end = start + step;
        while let Some(packet) = pending.next_if(|p| !p.info.arrival.is_after(&end)) {
            let ssrc = packet.info.ssrc;
            let first = manager.source(ssrc).is_none();
            manager.enqueue(packet.info, packet.payload)?;
            if first && args.mix {
                let count = args.sources.max(1);
                let azimuth = if count == 1 {
                    0.0
                } else {
                    (ssrc - 0x5000_0000) as f32 / (count - 1) as f32 * 2.0 - 1.0
                };
                manager.set_spatializer(ssrc, Box::new(StereoPanner::new(azimuth, 1.0)))?;
            }
        }
        let mixer: &mut dyn Mixer = if args.mix { &mut summer } else { &mut recorder };
        manager.tick(start, end, mixer);
        if args.mix {
            let frame = summer.read(step.ticks() as usize);
            amplitude.0 += frame.mean_amplitude();
            amplitude.1 += 1;
        }
        start = end;
    }

    let sources = counts
        .into_iter()
        .filter_map(|(ssrc, sent, dropped)| {
            manager.stats(ssrc).map(|stats| SourceReport {
                ssrc: format!("{:#010x}", ssrc),
                sent,
                dropped,
                repair_ratio: stats.repair_ratio(),
                stats: stats.clone(),
            })
        })
        .collect();
    Ok(Report {
        codec: args.codec.clone(),
        coder: kind.to_string(),
        params,
        sources,
        mixed_mean_amplitude: args.mix.then(|| amplitude.0 / amplitude.1.max(1) as f64),
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let report = run(args)?;
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| Error::Configuration(format!("cannot serialise report: {}", e)))?;
    println!("{}", json);
    Ok(())
}
