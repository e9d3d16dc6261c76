//! Master control flow: split the input, serve shards and RPCs, wait for
//! the finish signal, and tear down.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use tokio::sync::mpsc;
use tonic::transport::Server;
use tracing::{error, info};

use crate::coordinator::{Coordinator, MapReduceService, MergeTarget, Tasks, FINAL_OUTPUT};
use crate::relation;
use crate::task;
use crate::transport;

pub struct MasterConfig {
    /// Host name workers use to reach this master's file server.
    pub host: String,
    /// Port the task RPC server listens on.
    pub rpc_port: u16,
    /// Port the HTTP file server listens on; also scopes the temp dir.
    pub http_port: u16,
    /// Number of map tasks.
    pub m: u32,
    /// Number of reduce tasks.
    pub r: u32,
    /// Input pair relation.
    pub input: PathBuf,
    /// Directory served as `/data/`.
    pub data_root: PathBuf,
    /// How long to keep answering `ShutdownRequest` after the final merge,
    /// so workers can collect their release.
    pub grace: Duration,
}

/// Run a whole job; returns the path of the merged result relation.
pub async fn run_master(config: MasterConfig) -> Result<PathBuf> {
    ensure!(config.m >= 1, "at least one map task is required");
    ensure!(config.r >= 1, "at least one reduce task is required");

    let temp = config.data_root.join(task::temp_dir(config.http_port));
    fs::create_dir_all(&temp)
        .with_context(|| format!("creating temp directory {}", temp.display()))?;
    let final_path = config.data_root.join(FINAL_OUTPUT);
    if final_path.exists() {
        fs::remove_file(&final_path).context("removing previous final output")?;
    }

    let shards = relation::split(&config.input, &temp, config.m, task::map_source_file)
        .with_context(|| format!("splitting {}", config.input.display()))?;
    info!(m = config.m, r = config.r, shards = shards.len(), "input relation split");

    let (fin_tx, mut fin_rx) = mpsc::channel(1);
    let tasks = Tasks::new(config.m, config.r, &config.host, config.http_port);
    let target = MergeTarget {
        data_root: config.data_root.clone(),
        http_port: config.http_port,
    };
    let coordinator = Coordinator::spawn(tasks, target, fin_tx);

    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let (file_server, _) = transport::serve_files(http_addr, &config.data_root).await?;

    let rpc_addr = SocketAddr::from(([0, 0, 0, 0], config.rpc_port));
    let service = MapReduceService::new(coordinator, config.m, config.r);
    let rpc_server = tokio::spawn(async move {
        if let Err(err) = Server::builder()
            .add_service(service.into_server())
            .serve(rpc_addr)
            .await
        {
            error!(addr = %rpc_addr, error = %err, "rpc server exited");
        }
    });
    info!(
        rpc = %format!("{}:{}", config.host, config.rpc_port),
        files = %format!("{}:{}", config.host, config.http_port),
        "master online"
    );

    // One sentinel arrives once the final merge is done. The grace sleep
    // gives workers time to collect ok=true on their next shutdown poll.
    let _ = fin_rx.recv().await;
    tokio::time::sleep(config.grace).await;

    file_server.abort();
    rpc_server.abort();
    fs::remove_dir_all(&temp)
        .with_context(|| format!("removing temp directory {}", temp.display()))?;
    info!("map reduce finished, shutting down");
    Ok(final_path)
}
