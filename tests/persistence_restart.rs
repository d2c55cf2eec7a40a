//! Decisions survive a restart through the file-backed store.

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use network_protector::config::ProtectorConfig;
use network_protector::security::Classification;
use network_protector::{bootstrap, SourceIdentity};

mod common;
use common::{get, post_json, router, send, test_config, CLIENT, OPERATOR};

fn durable_config(dir: &std::path::Path) -> ProtectorConfig {
    let mut config = test_config();
    config.persistence.enabled = true;
    config.persistence.connection = dir.display().to_string();
    config
}

#[tokio::test]
async fn test_blocks_and_threats_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = durable_config(dir.path());

    {
        let protector = bootstrap(&config).await.unwrap();
        let app = router(&config, protector.gate.clone());

        let (status, _) = send(&app, CLIENT, get("/files/%2e%2e%2fsecret")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(
            &app,
            OPERATOR,
            post_json("/protection/block/203.0.113.9", json!({ "reason": "manual" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        assert!(protector.gate.persistence().settle(Duration::from_secs(5)).await);
        drop(app);
        tokio::task::spawn_blocking(move || protector.shutdown()).await.unwrap();
    }

    let protector = bootstrap(&config).await.unwrap();
    let registry = protector.gate.registry();
    assert_eq!(
        registry.classify(&SourceIdentity::parse("198.51.100.20").unwrap()),
        Classification::Blocked
    );
    assert_eq!(
        registry.classify(&SourceIdentity::parse("203.0.113.9").unwrap()),
        Classification::Blocked
    );
    assert_eq!(protector.gate.detector().event_count(), 1);

    // hydrated state is enforced from the first request
    let app = router(&config, protector.gate.clone());
    let (status, body) = send(&app, CLIENT, get("/health")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "blocked");
}

#[tokio::test]
async fn test_unblock_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let config = durable_config(dir.path());
    let a = SourceIdentity::parse("203.0.113.10").unwrap();

    {
        let protector = bootstrap(&config).await.unwrap();
        let registry = protector.gate.registry();
        registry
            .block(&a, "abuse", network_protector::security::AccessSource::Manual)
            .unwrap();
        registry.unblock(&a).unwrap();
        assert!(protector.gate.persistence().settle(Duration::from_secs(5)).await);
        tokio::task::spawn_blocking(move || protector.shutdown()).await.unwrap();
    }

    let protector = bootstrap(&config).await.unwrap();
    assert_eq!(protector.gate.registry().classify(&a), Classification::Allowed);
    assert_eq!(protector.gate.stats().persistence.mode, "durable");
}
