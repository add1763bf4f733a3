//! Integration test: the channel over a real inference thread.

#![allow(clippy::unwrap_used)]

use verdant_diagnosis::StaticCatalog;
use verdant_io::{
    Analyzer, Channel, ChannelConfig, ChannelError, ChannelStatus, ThreadContextFactory, Tier,
    TokioTimer, VerdantConfig,
};
use verdant_pipeline::{RawImage, decode::encode_png, rgba_from_raw};
use verdant_store::{ResultStore, SaveOutcome, SqliteStore, StoreConfig};
use verdant_worker::ModelSource;

const MODEL_JSON: &str = r#"{
    "labels": ["healthy", "early_blight"],
    "grid": 1,
    "weights": [[-6.0, 12.0, -6.0], [8.0, -4.0, -6.0]],
    "bias": [0.0, 0.0]
}"#;

fn channel(model: &str) -> Channel<ThreadContextFactory, TokioTimer> {
    Channel::new(
        ThreadContextFactory::default(),
        TokioTimer,
        ModelSource::Inline(model.to_owned()),
        ChannelConfig::default(),
    )
}

fn solid(rgb: [u8; 3], size: u32) -> verdant_pipeline::RgbaImage {
    rgba_from_raw(size, size, [rgb[0], rgb[1], rgb[2], 255].repeat((size * size) as usize)).unwrap()
}

#[tokio::test]
async fn classifies_on_a_background_thread() {
    let channel = channel(MODEL_JSON);
    assert_eq!(channel.status().await, ChannelStatus::Idle);
    channel.init().await.unwrap();
    assert_eq!(channel.status().await, ChannelStatus::Ready);

    let green = channel.classify(&solid([40, 180, 40], 16)).await.unwrap();
    assert_eq!(green.disease_identifier(), "healthy");
    let brown = channel.classify(&solid([150, 90, 40], 16)).await.unwrap();
    assert_eq!(brown.disease_identifier(), "early_blight");
    assert_eq!(channel.pending(), 0);
}

#[tokio::test]
async fn concurrent_requests_resolve_independently() {
    let channel = channel(MODEL_JSON);
    channel.init().await.unwrap();
    let green = solid([40, 180, 40], 16);
    let brown = solid([150, 90, 40], 16);

    let (a, b) = futures::join!(channel.classify(&green), channel.classify(&brown));
    assert_eq!(a.unwrap().disease_identifier(), "healthy");
    assert_eq!(b.unwrap().disease_identifier(), "early_blight");
}

#[tokio::test]
async fn bad_model_fails_init_and_gives_up() {
    let channel = channel("{ not a model");
    for _ in 0..3 {
        assert!(matches!(channel.init().await, Err(ChannelError::Inference(_))));
    }
    assert_eq!(channel.status().await, ChannelStatus::Unavailable);
    assert!(matches!(
        channel.init().await,
        Err(ChannelError::Unavailable { attempts: 3 })
    ));
}

#[tokio::test]
async fn restart_and_shutdown() {
    let channel = channel(MODEL_JSON);
    channel.init().await.unwrap();
    channel.restart().await.unwrap();
    assert!(channel.classify(&solid([40, 180, 40], 8)).await.is_ok());

    channel.shutdown().await;
    assert!(matches!(
        channel.classify(&solid([40, 180, 40], 8)).await,
        Err(ChannelError::NotReady)
    ));
}

#[tokio::test]
async fn analysis_uses_the_worker_tier_and_sqlite_history() {
    let config = VerdantConfig::from_json(&format!(
        r#"{{"model": {{"Inline": {}}}, "stub_seed": 7}}"#,
        serde_json::to_string(MODEL_JSON).unwrap()
    ))
    .unwrap();
    let channel = config.channel(ThreadContextFactory::default(), TokioTimer);
    let analyzer = Analyzer::new(
        config.orchestrator(channel),
        ResultStore::connected(SqliteStore::open_in_memory().unwrap(), StoreConfig::default()),
        StaticCatalog::embedded().unwrap(),
    );

    let raw = RawImage::new(encode_png(&solid([40, 180, 40], 64)).unwrap(), "image/png");
    let analysis = analyzer.analyze(&raw, "blob:preview").await.unwrap();

    assert_eq!(analysis.tier, Tier::Worker);
    assert_eq!(analysis.saved, SaveOutcome::Saved);
    assert!(analysis.record.is_healthy);
    assert_eq!(analyzer.store().list().await, vec![analysis.record]);
}
