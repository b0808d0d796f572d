//! Audio integration tests for `stream-request-audio`.
//!
//! These tests validate:
//! - stream-ready fires once enough audio is buffered, before the request completes
//! - decoded samples do not depend on how the body was chunked
//! - clips are unloaded when the request fails or is cancelled
//!
//! Bodies are raw PCM16 generated by the fixture; transports are scripted.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rstest::rstest;

use stream_request::EngineSettings;
use stream_request_audio::{AudioRequestExt, ClipFormat, ClipSettings, decode_pcm16};

mod fixture;

use fixture::{MockTransportFactory, Route, engine, is_not_silence, pcm16_sine, run_to_idle};

fn mono_8k(threshold: Duration) -> ClipSettings {
    ClipSettings::new()
        .with_format(ClipFormat::new(8_000, 1))
        .with_ready_threshold(threshold)
}

#[test]
fn stream_ready_fires_before_completion() {
    setup::init_tracing();
    let factory = MockTransportFactory::new();
    let engine = engine(&factory, EngineSettings::new());
    let pcm = pcm16_sine(440.0, 0.5, 8_000, 1);

    let remote = factory.remote("https://example.com/voice.raw");
    remote.set_content_length(pcm.len() as u64);

    // 50 ms @ 8 kHz mono = 400 samples = 800 bytes.
    let (request, clip) =
        engine.get_audio_clip("https://example.com/voice.raw", &mono_8k(Duration::from_millis(50)));
    assert_eq!(clip.name(), "voice.raw");

    let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    request.on_stream_ready({
        let order = Arc::clone(&order);
        move || order.lock().push("ready")
    });
    engine.send(&request, {
        let order = Arc::clone(&order);
        move |r| {
            assert!(r.is_ok());
            order.lock().push("complete");
        }
    });

    engine.tick();
    remote.push(&pcm[..501]);
    engine.tick();
    assert!(!request.is_stream_ready());
    assert_eq!(clip.total_samples(), Some(pcm.len() as u64 / 2));

    remote.push(&pcm[501..1_201]);
    engine.tick();
    assert!(request.is_stream_ready());
    assert!(clip.is_ready());
    assert!(!request.is_complete());
    // Playback can start from what is already there.
    assert!(clip.len() >= 400);

    remote.push(&pcm[1_201..]);
    remote.finish(200);
    run_to_idle(&engine, 10);

    assert_eq!(*order.lock(), vec!["ready", "complete"]);
    assert_eq!(clip.samples_from(0), decode_pcm16(&pcm));
    assert!(clip.is_fully_buffered());
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(7)]
#[case(64)]
#[case(1_001)]
fn samples_independent_of_chunking(#[case] chunk_size: usize) {
    let factory = MockTransportFactory::new();
    let engine = engine(&factory, EngineSettings::new());
    let pcm = pcm16_sine(220.0, 0.05, 8_000, 2);
    factory.route("https://example.com/tone.raw", Route::ok(&pcm, chunk_size));

    let (request, clip) =
        engine.get_audio_clip("https://example.com/tone.raw", &ClipSettings::default());
    let completions = Arc::new(AtomicUsize::new(0));
    engine.send(&request, {
        let completions = Arc::clone(&completions);
        move |r| {
            assert!(r.is_ok());
            completions.fetch_add(1, Ordering::SeqCst);
        }
    });
    run_to_idle(&engine, pcm.len() + 10);

    assert_eq!(completions.load(Ordering::SeqCst), 1);
    let samples = clip.samples_from(0);
    assert_eq!(samples, decode_pcm16(&pcm));
    assert!(is_not_silence(&samples));
}

#[test]
fn unknown_length_becomes_ready_at_transport_done() {
    let factory = MockTransportFactory::new();
    let engine = engine(&factory, EngineSettings::new());
    // Odd length: the trailing byte has no partner and is dropped.
    let mut pcm = pcm16_sine(330.0, 0.01, 8_000, 1);
    pcm.push(0x7F);
    factory.route(
        "https://example.com/short.raw",
        Route::ok(&pcm, 33).without_content_length(),
    );

    let (request, clip) =
        engine.get_audio_clip("https://example.com/short.raw", &mono_8k(Duration::from_secs(1)));
    let ready = Arc::new(AtomicUsize::new(0));
    request.on_stream_ready({
        let ready = Arc::clone(&ready);
        move || {
            ready.fetch_add(1, Ordering::SeqCst);
        }
    });
    engine.send(&request, |r| assert!(r.is_ok()));
    run_to_idle(&engine, 100);

    assert_eq!(ready.load(Ordering::SeqCst), 1);
    assert_eq!(clip.total_samples(), Some((pcm.len() / 2) as u64));
    assert_eq!(clip.samples_from(0), decode_pcm16(&pcm));
}

#[test]
fn lying_content_length_still_completes_once() {
    let factory = MockTransportFactory::new();
    let engine = engine(&factory, EngineSettings::new());
    let pcm = pcm16_sine(440.0, 0.05, 8_000, 1);

    let remote = factory.remote("https://example.com/liar.raw");
    remote.set_content_length(u64::MAX - 1);

    let (request, clip) =
        engine.get_audio_clip("https://example.com/liar.raw", &mono_8k(Duration::from_millis(10)));
    let completions = Arc::new(AtomicUsize::new(0));
    engine.send(&request, {
        let completions = Arc::clone(&completions);
        move |r| {
            assert!(r.is_ok());
            completions.fetch_add(1, Ordering::SeqCst);
        }
    });

    engine.tick();
    remote.push(&pcm);
    remote.finish(200);
    run_to_idle(&engine, 10);

    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(clip.total_samples(), Some(u64::MAX / 2));
    assert!(request.is_stream_ready());
    assert_eq!(clip.samples_from(0), decode_pcm16(&pcm));
}

#[test]
fn clip_is_unloaded_on_cancel() {
    let factory = MockTransportFactory::new();
    let engine = engine(&factory, EngineSettings::new());
    let remote = factory.remote("https://example.com/long.raw");
    remote.set_content_length(1_000_000);

    let (request, clip) = engine.get_audio_clip("https://example.com/long.raw", &mono_8k(Duration::ZERO));
    engine.send(&request, |r| assert!(r.unwrap_err().is_cancelled()));
    engine.tick();
    remote.push(vec![0x10; 4_000]);
    engine.tick();
    assert_eq!(clip.len(), 2_000);

    request.cancel();
    assert!(clip.is_unloaded());
    assert!(clip.is_empty());
    assert!(!clip.add_samples(&[0.5]));
}

#[test]
fn clip_is_unloaded_on_transport_error() {
    let factory = MockTransportFactory::new();
    let engine = engine(&factory, EngineSettings::new());
    factory.route(
        "https://example.com/broken.raw",
        Route::ok(vec![0x01; 600], 100).with_error("connection reset"),
    );

    let (request, clip) =
        engine.get_audio_clip("https://example.com/broken.raw", &mono_8k(Duration::ZERO));
    let error = Arc::new(Mutex::new(String::new()));
    engine.send(&request, {
        let error = Arc::clone(&error);
        move |r| *error.lock() = r.unwrap_err().to_string()
    });
    run_to_idle(&engine, 20);

    assert_eq!(*error.lock(), "connection reset");
    assert!(clip.is_unloaded());
}
