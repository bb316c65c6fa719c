use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, FromRequest, Multipart, Path as UrlPath, Query, Request, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use http_body_util::BodyExt;
use models::{DirectoryConfig, ServerConfig};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

mod auth;
pub mod sanitize;

use sanitize::{contained_path, sanitize_filename, sanitize_subdir, submitted_basename};

/// Ceiling on draining one upload body; very large transfers over slow links
/// are expected.
const BODY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct AppState {
    pub server: ServerConfig,
    pub directories: HashMap<String, DirectoryConfig>,
}

/// HTTP ingest server. Accepted files become visible in a binding's ingest
/// directory only through an atomic rename from the scratch area, so the
/// watcher never observes a partial upload.
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    /// Failing to create the scratch directory is fatal to the launcher.
    pub fn new(cfg: ServerConfig, directories: &[DirectoryConfig]) -> Result<Self> {
        std::fs::create_dir_all(&cfg.temp_dir).with_context(|| {
            format!("failed to create temp directory {}", cfg.temp_dir.display())
        })?;

        let directories = directories
            .iter()
            .map(|d| (d.name.clone(), d.clone()))
            .collect();

        Ok(Self {
            state: Arc::new(AppState {
                server: cfg,
                directories,
            }),
        })
    }

    pub fn router(&self) -> Router {
        router(Arc::clone(&self.state))
    }

    /// Serve until the token is cancelled, then shut down within the grace
    /// window.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.state.server.address, self.state.server.port)
            .parse()
            .context("invalid listen address")?;

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let handle = Handle::new();
        {
            let handle = handle.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });
        }

        if self.state.server.tls.enabled {
            info!("starting HTTPS ingress server on {addr}");
            let tls = RustlsConfig::from_pem_file(
                &self.state.server.tls.cert_file,
                &self.state.server.tls.key_file,
            )
            .await
            .context("failed to load TLS certificate")?;
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app)
                .await
                .context("ingress server failed")?;
        } else {
            info!("starting HTTP ingress server on {addr}");
            axum_server::bind(addr)
                .handle(handle)
                .serve(app)
                .await
                .context("ingress server failed")?;
        }
        Ok(())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let uploads = Router::new()
        .route("/upload/{name}", post(upload_root))
        .route("/upload/{name}/{*subdir}", post(upload_subdir))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_basic_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(uploads)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn upload_root(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    UrlPath(name): UrlPath<String>,
    req: Request,
) -> Response {
    handle_upload(state, remote, name, None, req).await
}

async fn upload_subdir(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    UrlPath((name, subdir)): UrlPath<(String, String)>,
    req: Request,
) -> Response {
    handle_upload(state, remote, name, Some(subdir), req).await
}

/// One URL shape, two body formats: `multipart/form-data` carries the file
/// in a form field; anything else is treated as a raw byte stream with the
/// filename in `?filename=` or `X-Filename`.
async fn handle_upload(
    state: Arc<AppState>,
    remote: SocketAddr,
    name: String,
    subdir: Option<String>,
    req: Request,
) -> Response {
    let Some(dir_cfg) = state.directories.get(&name).cloned() else {
        return plain(StatusCode::NOT_FOUND, "Unknown directory");
    };

    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false);

    if is_multipart {
        multipart_upload(state, remote, dir_cfg, subdir, req).await
    } else {
        streaming_upload(state, remote, dir_cfg, subdir, req).await
    }
}

async fn multipart_upload(
    state: Arc<AppState>,
    remote: SocketAddr,
    dir_cfg: DirectoryConfig,
    subdir: Option<String>,
    req: Request,
) -> Response {
    let mut multipart = match Multipart::from_request(req, &()).await {
        Ok(m) => m,
        Err(e) => return plain(StatusCode::BAD_REQUEST, format!("Failed to parse form: {e}")),
    };

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return plain(StatusCode::BAD_REQUEST, "Failed to get file: no file field"),
            Err(e) => return plain(StatusCode::BAD_REQUEST, format!("Failed to parse form: {e}")),
        };
        if field.name() != Some("file") {
            continue;
        }

        let Some(raw_name) = field.file_name().map(str::to_owned).filter(|n| !n.is_empty())
        else {
            return plain(StatusCode::BAD_REQUEST, "Filename is required");
        };

        let prepared = match prepare_target(remote, &dir_cfg, subdir.as_deref(), &raw_name) {
            Ok(prepared) => prepared,
            Err(resp) => return resp,
        };

        let mut field = field;
        return finalize_upload(&state, &dir_cfg, prepared, |scratch| async move {
            let mut scratch = scratch;
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))?
            {
                scratch.write_all(&chunk).await?;
            }
            Ok(scratch)
        })
        .await;
    }
}

async fn streaming_upload(
    state: Arc<AppState>,
    remote: SocketAddr,
    dir_cfg: DirectoryConfig,
    subdir: Option<String>,
    req: Request,
) -> Response {
    let query_name = Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .ok()
        .and_then(|q| q.0.get("filename").cloned());
    let header_name = req
        .headers()
        .get("x-filename")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let Some(raw_name) = query_name.or(header_name).filter(|n| !n.is_empty()) else {
        return plain(StatusCode::BAD_REQUEST, "Filename required");
    };

    let prepared = match prepare_target(remote, &dir_cfg, subdir.as_deref(), &raw_name) {
        Ok(prepared) => prepared,
        Err(resp) => return resp,
    };

    let mut body = req.into_body();
    finalize_upload(&state, &dir_cfg, prepared, |scratch| async move {
        let mut scratch = scratch;
        while let Some(frame) = body
            .frame()
            .await
            .transpose()
            .map_err(|e| std::io::Error::other(e.to_string()))?
        {
            if let Some(data) = frame.data_ref() {
                scratch.write_all(data).await?;
            }
        }
        Ok(scratch)
    })
    .await
}

struct PreparedTarget {
    filename: String,
    final_path: PathBuf,
}

/// Sanitize the submitted name and subdirectory and pin the destination
/// inside the binding's ingest root.
fn prepare_target(
    remote: SocketAddr,
    dir_cfg: &DirectoryConfig,
    subdir: Option<&str>,
    raw_name: &str,
) -> Result<PreparedTarget, Response> {
    let filename = match sanitize_filename(submitted_basename(raw_name)) {
        Ok(filename) => filename,
        Err(e) => {
            warn!("rejected unsafe filename from {remote}: {raw_name}");
            return Err(plain(
                StatusCode::BAD_REQUEST,
                format!("Invalid filename: {e}"),
            ));
        }
    };

    let relative = match subdir {
        Some(subdir) => match sanitize_subdir(subdir) {
            Ok(dir) => dir.join(&filename),
            Err(e) => {
                warn!("rejected unsafe subdirectory from {remote}: {subdir}");
                return Err(plain(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid subdirectory path: {e}"),
                ));
            }
        },
        None => PathBuf::from(&filename),
    };

    let final_path = match contained_path(dir_cfg.ingest_path(), &relative) {
        Ok(path) => path,
        Err(e) => {
            warn!(
                "rejected path escape attempt from {remote}: {}",
                relative.display()
            );
            return Err(plain(StatusCode::BAD_REQUEST, format!("Invalid path: {e}")));
        }
    };

    Ok(PreparedTarget {
        filename,
        final_path,
    })
}

/// Create the target's parents, drain the body into a `.partial` scratch
/// file, fsync, then atomically rename into place. The scratch file never
/// survives a failure.
async fn finalize_upload<F, Fut>(
    state: &AppState,
    dir_cfg: &DirectoryConfig,
    prepared: PreparedTarget,
    drain: F,
) -> Response
where
    F: FnOnce(tokio::fs::File) -> Fut,
    Fut: std::future::Future<Output = std::io::Result<tokio::fs::File>>,
{
    let PreparedTarget {
        filename,
        final_path,
    } = prepared;

    if let Some(parent) = final_path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            error!("directory creation failed for {filename}: {e}");
            return plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to create directory: {e}"),
            );
        }
    }

    let scratch_path = state.server.temp_dir.join(format!("{filename}.partial"));
    let written = tokio::time::timeout(BODY_TIMEOUT, async {
        let scratch = tokio::fs::File::create(&scratch_path).await?;
        let scratch = drain(scratch).await?;
        scratch.sync_all().await?;
        Ok::<(), std::io::Error>(())
    })
    .await;

    let write_err = match written {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some("upload timed out".to_string()),
    };
    if let Some(e) = write_err {
        let _ = tokio::fs::remove_file(&scratch_path).await;
        error!("upload failed for {filename}: {e}");
        return plain(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to write file: {e}"),
        );
    }

    // Atomic rename into the ingest directory; scratch and target share a
    // filesystem, a cross-device rename fails here instead of degrading to
    // a copy.
    if let Err(e) = tokio::fs::rename(&scratch_path, &final_path).await {
        let _ = tokio::fs::remove_file(&scratch_path).await;
        error!("rename failed for {filename}: {e}");
        return plain(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to finalize file: {e}"),
        );
    }

    info!("upload complete: {} -> {}", filename, dir_cfg.name);
    plain(StatusCode::OK, format!("Upload successful: {filename}\n"))
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}
