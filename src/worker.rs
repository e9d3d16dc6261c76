//! Worker control loop: serve the local data directory, poll the master
//! for tasks, run them one at a time, and exit once the master grants
//! shutdown.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::sleep;
use tracing::{error, info};

use crate::rpc::{self, map_reduce_client::MapReduceClient};
use crate::task::{self, MapTask, ReduceTask};
use crate::transport;
use crate::Workload;

pub struct WorkerConfig {
    /// gRPC endpoint of the master, e.g. `http://localhost:50051`.
    pub master: String,
    /// Host name peers use to reach this worker's file server.
    pub advertise: String,
    /// Port the HTTP file server listens on; also scopes the temp dir.
    pub http_port: u16,
    /// Directory served as `/data/`.
    pub data_root: PathBuf,
    /// The user transforms to run.
    pub workload: Workload,
}

/// Poll the master until it grants shutdown. At most one task runs at a
/// time.
pub async fn run_worker(config: WorkerConfig) -> Result<()> {
    let temp = config.data_root.join(task::temp_dir(config.http_port));
    fs::create_dir_all(&temp)
        .with_context(|| format!("creating temp directory {}", temp.display()))?;

    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let (file_server, _) = transport::serve_files(http_addr, &config.data_root).await?;
    info!(
        files = %format!("{}:{}", config.advertise, config.http_port),
        master = %config.master,
        "worker online"
    );

    let mut client = MapReduceClient::connect(config.master.clone())
        .await
        .with_context(|| format!("dialing master at {}", config.master))?;
    client.ping(rpc::Empty {}).await?;

    // The dedupe flag keeps the waiting log to one line per idle stretch.
    let mut previously_slept = false;
    loop {
        let reply = client.get_task(rpc::Empty {}).await?.into_inner();
        match (reply.got_a_task, reply.is_map, reply.map_task, reply.reduce_task) {
            (true, true, Some(msg), _) => {
                previously_slept = false;
                let map_task = MapTask::from(msg);
                info!(task = map_task.n, "map task received");
                run_map_task(&mut client, &config, &temp, map_task).await?;
            }
            (true, false, _, Some(msg)) => {
                previously_slept = false;
                let reduce_task = ReduceTask::from(msg);
                info!(task = reduce_task.n, "reduce task received");
                run_reduce_task(&mut client, &config, &temp, reduce_task).await?;
            }
            _ => {
                if !previously_slept {
                    info!("no task available, waiting on master");
                }
                previously_slept = true;
                sleep(Duration::from_secs(1)).await;
            }
        }

        let shutdown = client.shutdown_request(rpc::Empty {}).await?.into_inner();
        if shutdown.ok {
            break;
        }
    }

    file_server.abort();
    fs::remove_dir_all(&temp)
        .with_context(|| format!("removing temp directory {}", temp.display()))?;
    info!("shutting down");
    Ok(())
}

async fn run_map_task(
    client: &mut MapReduceClient<tonic::transport::Channel>,
    config: &WorkerConfig,
    temp: &std::path::Path,
    map_task: MapTask,
) -> Result<()> {
    match map_task.process(temp, &config.workload).await {
        Ok(_) => {
            client
                .notify_map_finished(rpc::Notification {
                    task_n: map_task.n,
                    address: config.advertise.clone(),
                    port: u32::from(config.http_port),
                })
                .await?;
        }
        Err(err) => {
            error!(task = map_task.n, error = %err, "map task failed");
            client
                .notify_task_failed(rpc::FailureNotification {
                    task_n: map_task.n,
                    is_map: true,
                    error: err.to_string(),
                })
                .await?;
        }
    }
    Ok(())
}

async fn run_reduce_task(
    client: &mut MapReduceClient<tonic::transport::Channel>,
    config: &WorkerConfig,
    temp: &std::path::Path,
    reduce_task: ReduceTask,
) -> Result<()> {
    match reduce_task.process(temp, &config.workload).await {
        Ok(_) => {
            client
                .notify_reduce_finished(rpc::Notification {
                    task_n: reduce_task.n,
                    address: config.advertise.clone(),
                    port: u32::from(config.http_port),
                })
                .await?;
        }
        Err(err) => {
            error!(task = reduce_task.n, error = %err, "reduce task failed");
            client
                .notify_task_failed(rpc::FailureNotification {
                    task_n: reduce_task.n,
                    is_map: false,
                    error: err.to_string(),
                })
                .await?;
        }
    }
    Ok(())
}
