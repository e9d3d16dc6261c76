use anyhow::Result;
use clap::Parser;
use mrdb::cmd::worker::Args;
use mrdb::worker::{run_worker, WorkerConfig};
use mrdb::workload;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = WorkerConfig {
        master: format!("http://{}", args.join),
        advertise: args.advertise,
        http_port: args.port,
        data_root: args.data_root,
        workload: workload::named(&args.workload)?,
    };
    run_worker(config).await
}
