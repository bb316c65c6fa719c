use std::path::Path;
use std::time::Duration;

use models::{OutboundAuth, OutboundConfig};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, StatusCode};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Files larger than this are streamed instead of buffered in memory.
pub const STREAMING_THRESHOLD: u64 = 100 * 1024 * 1024;

/// 1 initial attempt + 3 retries.
const MAX_ATTEMPTS: u32 = 4;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Per-request ceiling; large files over slow links need headroom.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum UploadError {
    /// 4xx: the endpoint rejected the request permanently, do not retry.
    #[error("client error (no retry): {status} - {body}")]
    ClientStatus { status: StatusCode, body: String },
    /// 5xx: the endpoint is unhealthy, worth retrying.
    #[error("server error: {status} - {body}")]
    ServerStatus { status: StatusCode, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upload cancelled")]
    Cancelled,
    #[error("failed to read source file: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::ServerStatus { .. } | UploadError::Transport(_)
        )
    }
}

/// Sends one file per request to the configured outbound endpoint as a
/// multipart POST with a single part named `file`.
pub struct Uploader {
    cfg: OutboundConfig,
    client: Client,
}

impl Uploader {
    pub fn new(cfg: OutboundConfig) -> Result<Self, UploadError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { cfg, client })
    }

    /// Upload with retry: backoff starts at one second and doubles between
    /// attempts. Every attempt re-reads the source file.
    pub async fn upload(
        &self,
        path: &Path,
        streaming: bool,
        token: &CancellationToken,
    ) -> Result<(), UploadError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.attempt(path, streaming, token).await {
                Ok(status) => {
                    info!("upload successful: {} (status: {})", path.display(), status);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    info!(
                        "upload retry {}/{} for {}: {e}",
                        attempt,
                        MAX_ATTEMPTS - 1,
                        path.display()
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        path: &Path,
        streaming: bool,
        token: &CancellationToken,
    ) -> Result<StatusCode, UploadError> {
        let form = if streaming {
            self.streaming_form(path).await?
        } else {
            self.buffered_form(path).await?
        };
        let req = apply_auth(self.client.post(&self.cfg.url).multipart(form), &self.cfg.auth);

        let resp = tokio::select! {
            _ = token.cancelled() => return Err(UploadError::Cancelled),
            r = req.send() => r?,
        };

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(status)
        } else if status.is_client_error() {
            Err(UploadError::ClientStatus { status, body })
        } else {
            Err(UploadError::ServerStatus { status, body })
        }
    }

    async fn buffered_form(&self, path: &Path) -> Result<Form, UploadError> {
        let data = tokio::fs::read(path).await?;
        let part = Part::bytes(data)
            .file_name(basename(path))
            .mime_str("application/octet-stream")?;
        Ok(Form::new().part("file", part))
    }

    async fn streaming_form(&self, path: &Path) -> Result<Form, UploadError> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let body = Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, len)
            .file_name(basename(path))
            .mime_str("application/octet-stream")?;
        Ok(Form::new().part("file", part))
    }
}

fn apply_auth(req: RequestBuilder, auth: &OutboundAuth) -> RequestBuilder {
    match auth {
        OutboundAuth::None => req,
        OutboundAuth::Basic { username, password } => req.basic_auth(username, Some(password)),
        OutboundAuth::Bearer { token } => req.bearer_auth(token),
        OutboundAuth::Token { token } => {
            req.header(reqwest::header::AUTHORIZATION, format!("Token {token}"))
        }
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_status_class() {
        let server = UploadError::ServerStatus {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: String::new(),
        };
        let client = UploadError::ClientStatus {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(!UploadError::Cancelled.is_retryable());
    }

    #[test]
    fn basename_falls_back_for_bare_roots() {
        assert_eq!(basename(Path::new("/data/in/a.txt")), "a.txt");
        assert_eq!(basename(Path::new("/")), "upload");
    }
}
