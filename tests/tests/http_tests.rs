//! End-to-end tests for the `reqwest` transport against a local `axum` fixture server.
//!
//! All tests use a local in-process server (no external network).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stream_request::{Engine, EngineSettings, RequestError};
use stream_request_audio::{AudioRequestExt, ClipFormat, ClipSettings, decode_pcm16};

mod fixture;

use fixture::{FixtureServer, scratch_dir};

fn http_engine() -> Engine {
    setup::init_tracing();
    Engine::http(
        EngineSettings::new()
            .with_max_active_requests(4)
            .with_poll_interval(Duration::from_millis(2))
            .with_request_timeout(Some(Duration::from_secs(10))),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_text_and_json() {
    let server = FixtureServer::start().await;
    let engine = http_engine();

    let text = engine.get_text(&server.url("/hello"));
    assert_eq!(engine.send_async(&text).await.unwrap(), FixtureServer::HELLO);
    assert_eq!(text.response_code(), 200);

    #[derive(Debug, Deserialize)]
    struct Config {
        name: String,
        version: u32,
    }
    let config = engine.get_json::<Config>(&server.url("/config.json"));
    let config = engine.send_async(&config).await.unwrap();
    assert_eq!(config.name, "fixture");
    assert_eq!(config.version, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_json_round_trips_body() {
    let server = FixtureServer::start().await;
    let engine = http_engine();

    #[derive(Debug, Serialize)]
    struct Score<'a> {
        player: &'a str,
        points: u64,
    }
    let request = engine
        .post_json::<_, Value>(
            &server.url("/echo"),
            &Score {
                player: "ada",
                points: 1_200,
            },
        )
        .unwrap();
    let echoed = engine.send_async(&request).await.unwrap();
    assert_eq!(echoed["player"], "ada");
    assert_eq!(echoed["points"], 1_200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_status_is_annotated_from_body() {
    let server = FixtureServer::start().await;
    let engine = http_engine();

    let request = engine.get_text(&server.url("/missing"));
    match engine.send_async(&request).await {
        Err(RequestError::Transport { code, message }) => {
            assert_eq!(code, 404);
            assert_eq!(message, "HTTP 404 Not Found: no such resource");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(request.response_code(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_exists_uses_head() {
    let server = FixtureServer::start().await;
    let engine = http_engine();

    assert!(engine.file_exists(&server.url("/hello")).await);
    assert!(!engine.file_exists(&server.url("/nope")).await);
    // Connection refused on a closed port.
    assert!(!engine.file_exists("http://127.0.0.1:1/unreachable").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_file_and_read_it_back_through_the_transport() {
    let server = FixtureServer::start().await;
    let engine = http_engine();
    let dir = scratch_dir("http-download");
    let dest = dir.join("tone.raw");

    let path = engine
        .download_file(&server.url("/tone.raw"), &dest)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), FixtureServer::tone());

    // Local paths go through the same transport.
    let local = engine.get_bytes(&dest.to_string_lossy());
    let bytes = engine.send_async(&local).await.unwrap();
    assert_eq!(bytes.as_ref(), FixtureServer::tone().as_slice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn audio_clip_streams_over_http() {
    let server = FixtureServer::start().await;
    let engine = http_engine();

    let settings = ClipSettings::new()
        .with_format(ClipFormat::new(8_000, 1))
        .with_ready_threshold(Duration::from_millis(100));
    let (request, clip) = engine.get_audio_clip(&server.url("/tone.raw"), &settings);
    let completed = engine.send_async(&request).await.unwrap();

    assert!(request.is_stream_ready());
    assert_eq!(completed.len(), clip.len());
    assert_eq!(clip.samples_from(0), decode_pcm16(&FixtureServer::tone()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_drives_http_requests() {
    let server = FixtureServer::start().await;
    let engine = http_engine();

    let requests: Vec<_> = (0..6)
        .map(|_| {
            let request = engine.get_text(&server.url("/hello"));
            engine.send(&request, |r| assert_eq!(r.unwrap(), FixtureServer::HELLO));
            request
        })
        .collect();

    tokio::time::timeout(
        Duration::from_secs(10),
        engine.scheduler().run(Duration::from_millis(2)),
    )
    .await
    .expect("scheduler did not drain");

    assert!(requests.iter().all(|r| r.is_complete()));
    assert_eq!(engine.admission().active(), 0);
}
