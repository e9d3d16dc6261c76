//! HTTP pull transport.
//!
//! Every node serves its data directory as static files under `/data/`;
//! peers fetch whole relation files by URL. The server is stateless, and
//! each endpoint owns its own router so a master and a worker can share a
//! process on different ports.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::error;

/// Serve `data_root` under `/data/` on `addr`. Returns the serving task
/// and the bound address.
pub async fn serve_files(addr: SocketAddr, data_root: &Path) -> Result<(JoinHandle<()>, SocketAddr)> {
    let app = Router::new().nest_service("/data", ServeDir::new(data_root.to_path_buf()));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding file server to {addr}"))?;
    let local_addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(addr = %local_addr, error = %err, "file server exited");
        }
    });
    Ok((server, local_addr))
}

/// Download `url` into the file at `path`.
pub async fn fetch(url: &str, path: &Path) -> Result<()> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("requesting {url}"))?;
    if !response.status().is_success() {
        bail!("GET {url} returned {}", response.status());
    }
    let body = response
        .bytes()
        .await
        .with_context(|| format!("reading body of {url}"))?;
    tokio::fs::write(path, &body)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
