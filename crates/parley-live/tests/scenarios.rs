//! End-to-end playback and capture scenarios against an in-memory peer and a
//! manual clock. No audio hardware required.

mod support;

use parley_live::{ServerEvent, SessionOutcome, SessionState};
use support::{harness, init_tracing, pcm_silence, test_config};

const EPS: f64 = 1e-9;

#[tokio::test]
async fn chunks_arriving_together_play_back_to_back() {
    init_tracing();
    let mut h = harness(test_config(), 5.0);
    h.open().await;

    for _ in 0..3 {
        h.deliver_audio(1.0).await;
    }

    let starts = h.output.start_times();
    assert_eq!(starts.len(), 3);
    for (got, want) in starts.iter().zip([5.0, 6.0, 7.0]) {
        assert!((got - want).abs() < EPS, "start {} != {}", got, want);
    }
    assert_eq!(h.session.state(), SessionState::Streaming);
    assert_eq!(h.session.report().chunks_scheduled, 3);
}

#[tokio::test]
async fn late_chunk_starts_on_arrival() {
    init_tracing();
    let mut h = harness(test_config(), 0.0);
    h.open().await;

    h.deliver_audio(1.0).await;
    h.clock.advance(2.0);
    h.deliver_audio(1.0).await;

    let starts = h.output.start_times();
    assert!((starts[0] - 0.0).abs() < EPS);
    assert!((starts[1] - 2.0).abs() < EPS, "expected arrival time, got {}", starts[1]);
}

#[tokio::test]
async fn interruption_silences_everything_queued() {
    init_tracing();
    let mut h = harness(test_config(), 10.0);
    h.open().await;

    h.deliver_audio(1.0).await;
    h.deliver_audio(1.0).await;
    h.clock.advance(0.4);

    let states = h.session.subscribe();
    assert!(h.peer.interrupt());
    assert!(h.session.process_next().await.unwrap());

    let played: Vec<_> = h.output.started().iter().map(|s| s.id).collect();
    assert_eq!(h.output.stopped(), played);
    assert_eq!(h.session.scheduler().pending_len(), 0);
    assert!((h.session.scheduler().next_start_time() - 10.4).abs() < EPS);
    assert_eq!(h.session.state(), SessionState::Streaming);
    assert_eq!(h.session.report().interruptions, 1);
    assert!(states.has_changed().unwrap());

    // Capture is unaffected by a barge-in.
    assert!(h.session.is_capturing());
    assert!(h.mic.is_held());

    // New audio after the interruption starts from the reset point.
    h.deliver_audio(0.5).await;
    assert!((h.output.start_times()[2] - 10.4).abs() < EPS);
}

#[tokio::test]
async fn stalled_consumer_overruns_and_releases_the_mic() {
    init_tracing();
    let config = test_config();
    let frame_size = config.frame_size;
    let bound = config.max_buffered_frames;
    let mut h = harness(config, 0.0);
    h.open().await;
    assert!(h.mic.is_held());

    // Nobody drains frames while the device keeps producing.
    h.mic.feed(&vec![0.1; frame_size * (bound + 2)]);
    assert!(!h.session.process_next().await.unwrap());

    assert_eq!(h.session.state(), SessionState::Failed);
    assert!(!h.mic.is_held());
    assert!(h.peer.shutdown_requested());
    match &h.session.report().outcome {
        Some(SessionOutcome::Failed(cause)) => assert!(cause.contains("overrun"), "{}", cause),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn captured_frames_are_sent_in_order() {
    init_tracing();
    let config = test_config();
    let frame_size = config.frame_size;
    let mut h = harness(config, 0.0);
    h.open().await;

    let samples: Vec<f32> = (0..frame_size * 3).map(|i| (i / frame_size) as f32 * 0.25).collect();
    h.mic.feed(&samples);
    for _ in 0..3 {
        assert!(h.session.process_next().await.unwrap());
    }

    let chunks = h.peer.drain_chunks();
    assert_eq!(chunks.len(), 3);
    for (n, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.mime.to_string(), "audio/pcm;rate=16000");
        assert_eq!(chunk.bytes.len(), frame_size * 2);
        let first = i16::from_le_bytes([chunk.bytes[0], chunk.bytes[1]]);
        assert_eq!(first, (n as f32 * 0.25 * 32768.0) as i16);
    }
    assert_eq!(h.session.report().frames_sent, 3);
}

#[tokio::test]
async fn bad_chunk_is_dropped_and_session_continues() {
    init_tracing();
    let mut h = harness(test_config(), 0.0);
    h.open().await;

    // Wrong rate, then an odd-length payload.
    assert!(h.peer.audio(pcm_silence(0.5), "audio/pcm;rate=24000"));
    assert!(h.session.process_next().await.unwrap());
    assert!(h.peer.emit(ServerEvent::AudioChunk {
        bytes: vec![0, 0, 0],
        mime: support::mime(),
    }));
    assert!(h.session.process_next().await.unwrap());

    assert_eq!(h.session.report().decode_errors, 2);
    assert!(h.output.started().is_empty());

    h.deliver_audio(0.5).await;
    assert_eq!(h.output.started().len(), 1);
    assert_eq!(h.session.state(), SessionState::Streaming);
}

#[tokio::test]
async fn finished_items_leave_the_queue() {
    init_tracing();
    let mut h = harness(test_config(), 0.0);
    h.open().await;
    h.deliver_audio(1.0).await;
    h.deliver_audio(1.0).await;

    let first = h.output.started()[0].id;
    h.output.finish(first);
    assert_eq!(h.session.scheduler().pending_len(), 1);
}
