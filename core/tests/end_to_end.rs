use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use models::{
    BasicAuthConfig, Config, DirectoryConfig, OutboundAuth, OutboundConfig, ReconcileScanConfig,
    ServerConfig, ShadowConfig, StabilityConfig, TlsConfig, WatchConfig, WatchMode,
};
use tokio_util::sync::CancellationToken;
use xferd::Service;

#[derive(Default)]
struct Received {
    files: Mutex<Vec<(String, Vec<u8>)>>,
}

async fn receive(State(state): State<Arc<Received>>, mut multipart: Multipart) -> StatusCode {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            let name = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.unwrap_or_default().to_vec();
            state.files.lock().unwrap().push((name, bytes));
        }
    }
    StatusCode::OK
}

async fn spawn_upstream() -> (SocketAddr, Arc<Received>) {
    let state = Arc::new(Received::default());
    let app = Router::new()
        .route("/ingest", post(receive))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn service_config(
    root: &Path,
    upstream: SocketAddr,
    mode: WatchMode,
    shadow_enabled: bool,
) -> Config {
    Config {
        server: ServerConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
            temp_dir: root.join("tmp"),
            tls: TlsConfig::default(),
            basic_auth: BasicAuthConfig::default(),
        },
        directories: vec![DirectoryConfig {
            name: "invoices".to_string(),
            watch_path: root.join("watch"),
            ingest_path: None,
            recursive: true,
            ignore: vec![],
            watch: WatchConfig {
                mode,
                startup_reconcile_scan: Some(false),
                reconcile_scan: ReconcileScanConfig {
                    enabled: true,
                    interval_seconds: 1,
                },
            },
            stability: StabilityConfig {
                confirmation_interval_ms: 50,
                required_stable_checks: 2,
                max_wait_ms: 2000,
            },
            shadow: ShadowConfig {
                enabled: shadow_enabled,
                path: root.join("shadow"),
                retention_hours: 24,
            },
            outbound: OutboundConfig {
                url: format!("http://{upstream}/ingest"),
                auth: OutboundAuth::None,
            },
        }],
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread")]
async fn renamed_file_is_uploaded_archived_and_deleted() {
    let (upstream, received) = spawn_upstream().await;
    let root = tempfile::tempdir().unwrap();
    let watch = root.path().join("watch");
    let staging = root.path().join("staging");
    std::fs::create_dir_all(&watch).unwrap();
    std::fs::create_dir_all(&staging).unwrap();

    let cfg = service_config(root.path(), upstream, WatchMode::HybridUltraLowLatency, true);
    let service = Service::new(cfg).unwrap();
    let token = CancellationToken::new();
    let run = tokio::spawn(service.run_with_token(token.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;

    std::fs::write(staging.join("x"), b"hello").unwrap();
    std::fs::rename(staging.join("x"), watch.join("a.txt")).unwrap();

    assert!(
        wait_until(|| !watch.join("a.txt").exists(), Duration::from_secs(10)).await,
        "source was not deleted"
    );
    assert_eq!(
        received.files.lock().unwrap().as_slice(),
        &[("a.txt".to_string(), b"hello".to_vec())]
    );

    let shadow_entries: Vec<String> = std::fs::read_dir(root.path().join("shadow"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(shadow_entries.len(), 1);
    assert!(shadow_entries[0].ends_with("-a.txt"), "{shadow_entries:?}");

    token.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn recursive_binding_picks_up_nested_files() {
    let (upstream, received) = spawn_upstream().await;
    let root = tempfile::tempdir().unwrap();
    let watch = root.path().join("watch");
    let staging = root.path().join("staging");
    std::fs::create_dir_all(watch.join("x/y")).unwrap();
    std::fs::create_dir_all(&staging).unwrap();

    let cfg = service_config(root.path(), upstream, WatchMode::HybridUltraLowLatency, false);
    let service = Service::new(cfg).unwrap();
    let token = CancellationToken::new();
    let run = tokio::spawn(service.run_with_token(token.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;

    for (name, target) in [
        ("a.txt", watch.join("a.txt")),
        ("b.txt", watch.join("x/b.txt")),
        ("c.txt", watch.join("x/y/c.txt")),
    ] {
        std::fs::write(staging.join(name), name.as_bytes()).unwrap();
        std::fs::rename(staging.join(name), target).unwrap();
    }

    assert!(
        wait_until(
            || received.files.lock().unwrap().len() == 3,
            Duration::from_secs(10)
        )
        .await,
        "expected three uploads, got {:?}",
        received.files.lock().unwrap().len()
    );

    let mut names: Vec<String> = received
        .files
        .lock()
        .unwrap()
        .iter()
        .map(|(n, _)| n.clone())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);

    token.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn polling_only_mode_relies_on_the_scan() {
    let (upstream, received) = spawn_upstream().await;
    let root = tempfile::tempdir().unwrap();
    let watch = root.path().join("watch");
    std::fs::create_dir_all(&watch).unwrap();

    let cfg = service_config(root.path(), upstream, WatchMode::PollingOnly, false);
    let service = Service::new(cfg).unwrap();
    let token = CancellationToken::new();
    let run = tokio::spawn(service.run_with_token(token.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;

    // The file appears out-of-band; only the reconciliation ticker sees it.
    std::fs::write(watch.join("report.csv"), b"rows").unwrap();

    assert!(
        wait_until(|| !watch.join("report.csv").exists(), Duration::from_secs(10)).await,
        "source was not deleted"
    );
    assert_eq!(
        received.files.lock().unwrap().as_slice(),
        &[("report.csv".to_string(), b"rows".to_vec())]
    );

    token.cancel();
    run.await.unwrap().unwrap();
}
