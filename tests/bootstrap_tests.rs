use bytes::Bytes;
use futures::FutureExt;
use intentsync::{
    Config, Services, SyncError,
    db::{NewInteraction, interactions},
    registry::ModelMetadata,
};
use std::path::Path;

fn local_config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.basic.data_dir = dir.to_path_buf();
    cfg.validate().expect("local config is valid");
    cfg
}

#[tokio::test]
async fn local_backend_persists_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = local_config(dir.path());

    let services = Services::start(&cfg).await.unwrap();
    assert!(services.credentials.is_none());
    services
        .database
        .execute(|conn| {
            async move {
                interactions::record_interaction(
                    conn,
                    NewInteraction {
                        session_id: "s-1".to_string(),
                        text: "where is my invoice".to_string(),
                        predicted_intent: "billing".to_string(),
                        confidence: 0.87,
                        model_version: None,
                        feedback: None,
                    },
                )
                .await
                .map_err(SyncError::from)
            }
            .boxed()
        })
        .await
        .unwrap();
    let base = services
        .registry
        .register(Bytes::from_static(b"base model"), ModelMetadata::base())
        .await
        .unwrap();
    services.shutdown().await.unwrap();

    assert!(dir.path().join("remote").join("intentsync.db").exists());
    assert!(dir.path().join("remote").join("models").join("index.json").exists());

    let services = Services::start(&cfg).await.unwrap();
    let rows = services
        .database
        .execute(|conn| {
            async move {
                interactions::count_interactions(conn)
                    .await
                    .map_err(SyncError::from)
            }
            .boxed()
        })
        .await
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(
        services.registry.get_latest().await.unwrap().version(),
        &base
    );
    services.shutdown().await.unwrap();
}

#[tokio::test]
async fn remote_backend_without_app_credentials_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = local_config(dir.path());
    cfg.storage.backend = intentsync::config::BackendKind::Dropbox;
    assert!(matches!(cfg.validate(), Err(SyncError::Config(_))));
}
