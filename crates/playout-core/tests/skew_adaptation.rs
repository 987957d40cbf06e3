//! Clock skew between sender and receiver over a long talkspurt

mod common;

use std::sync::Arc;

use common::*;
use voxmesh_playout_core::channel::ChannelCoderKind;
use voxmesh_playout_core::codec::CodecRegistry;
use voxmesh_playout_core::mixer::RecordingMixer;
use voxmesh_playout_core::playout::PlayoutDelayEstimator;
use voxmesh_playout_core::{PipelineConfig, SourceManager, SourceStats};

const SSRC: u32 = 0x5cee_0001;
const UNITS: u64 = 500;

/// Ten seconds of speech from a sender whose clock runs at `clock` times
/// the receiver's, on a fixed 10 ms path
fn run(clock: f64) -> (SourceManager, RecordingMixer) {
    let mut talker = Talker::new(SSRC, ChannelCoderKind::Vanilla, "1", &["L16-8K-MONO"]);
    let deliveries: Vec<Delivery> = talker
        .talk(UNITS, 4)
        .iter()
        .map(|s| {
            let sent_at = ((s.emitted_by + 1) * FRAME) as f64 / clock;
            Delivery::new(SSRC, s, sent_at.round() as u64 + 80)
        })
        .collect();

    let mut manager = SourceManager::new(PipelineConfig::default(), Arc::new(CodecRegistry::with_defaults())).unwrap();
    let mut mixer = RecordingMixer::new();
    drive(&mut manager, &mut mixer, deliveries, (UNITS + 40) * FRAME);
    (manager, mixer)
}

fn assert_clean_playback(stats: &SourceStats) {
    assert_eq!(stats.units_played, UNITS);
    assert_eq!(stats.units_lost, 0);
    assert_eq!(stats.units_repaired, 0);
    assert_eq!(stats.talkspurts, 1);
}

#[test]
fn test_fast_sender_has_samples_dropped() {
    let (manager, mixer) = run(1.01);
    let stats = manager.stats(SSRC).unwrap();
    assert_clean_playback(stats);

    assert!(stats.skew_fast_corrections > 0);
    assert_eq!(stats.skew_slow_corrections, 0);
    assert_eq!(stats.samples_inserted, 0);
    // The sender gets about 790 samples ahead over the run; corrections
    // trail the average transit by a few units.
    assert!((500..=900).contains(&stats.samples_dropped), "dropped {}", stats.samples_dropped);

    let units = played(&mixer, SSRC);
    assert_contiguous(&units);
    assert!(units.iter().any(|u| u.frame.samples_per_channel() < FRAME as usize));

    let entry = manager.entry(SSRC).unwrap();
    assert!(PlayoutDelayEstimator::discrepancy(entry).abs() <= 80);
}

#[test]
fn test_slow_sender_has_samples_inserted() {
    let (manager, mixer) = run(0.99);
    let stats = manager.stats(SSRC).unwrap();
    assert_clean_playback(stats);

    assert!(stats.skew_slow_corrections > 0);
    assert_eq!(stats.skew_fast_corrections, 0);
    assert_eq!(stats.samples_dropped, 0);
    assert!((500..=900).contains(&stats.samples_inserted), "inserted {}", stats.samples_inserted);

    let units = played(&mixer, SSRC);
    assert_contiguous(&units);
    assert!(units.iter().any(|u| u.frame.samples_per_channel() > FRAME as usize));

    let entry = manager.entry(SSRC).unwrap();
    assert!(PlayoutDelayEstimator::discrepancy(entry).abs() <= 80);
}

#[test]
fn test_matched_clocks_are_left_alone() {
    let (manager, mixer) = run(1.0);
    let stats = manager.stats(SSRC).unwrap();
    assert_clean_playback(stats);

    assert_eq!(stats.skew_fast_corrections, 0);
    assert_eq!(stats.skew_slow_corrections, 0);
    assert_eq!(stats.samples_dropped + stats.samples_inserted, 0);

    let units = played(&mixer, SSRC);
    assert_contiguous(&units);
    assert!(units.iter().all(|u| u.frame.samples_per_channel() == FRAME as usize));
}
