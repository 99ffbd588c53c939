//! Spawns the real server binary and drives it through the client
//! library: process lifecycle, readiness handshake, and RPC against a
//! live in-memory engine (no GDX reader extension loaded).

use gdxview::client::GdxViewerClient;
use gdxview::config::ServerOptions;
use gdxview::server::protocol::ErrorCode;

fn server_binary() -> &'static str {
    env!("CARGO_BIN_EXE_gdxview")
}

#[tokio::test]
async fn spawn_ready_ping_dispose() {
    let client = GdxViewerClient::launch(server_binary(), &ServerOptions::default())
        .await
        .expect("server failed to launch");

    assert!(client.ping().await.unwrap());
    client.dispose().await;
}

#[tokio::test]
async fn remote_sources_rejected_end_to_end() {
    let client = GdxViewerClient::launch(server_binary(), &ServerOptions::default())
        .await
        .unwrap();

    let err = client
        .open_document("d1", "https://example.invalid/y.gdx", false)
        .await
        .unwrap_err();
    assert_eq!(err.rpc_code(), Some(ErrorCode::InvalidInput));
    assert!(err
        .to_string()
        .starts_with("Remote source loading is disabled"));

    client.dispose().await;
}

#[tokio::test]
async fn engine_errors_propagate_as_transient() {
    let client = GdxViewerClient::launch(server_binary(), &ServerOptions::default())
        .await
        .unwrap();

    // Without the GDX reader extension the catalog function does not
    // exist; the engine error surfaces verbatim as a transient error.
    let err = client
        .open_document("d1", "/tmp/nonexistent.gdx", false)
        .await
        .unwrap_err();
    assert_eq!(err.rpc_code(), Some(ErrorCode::TransientEngine));

    client.dispose().await;
}

#[tokio::test]
async fn persistent_storage_files_are_removed_on_dispose() {
    let storage = tempfile::tempdir().unwrap();
    let options = ServerOptions {
        global_storage_path: Some(storage.path().to_path_buf()),
        ..ServerOptions::default()
    };

    let client = GdxViewerClient::launch(server_binary(), &options)
        .await
        .unwrap();
    assert!(client.ping().await.unwrap());

    let has_db = || {
        std::fs::read_dir(storage.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().ends_with(".duckdb"))
    };
    assert!(has_db(), "expected a database file while running");

    client.dispose().await;
    assert!(!has_db(), "database file should be gone after dispose");
}
