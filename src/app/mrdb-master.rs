use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mrdb::cmd::master::Args;
use mrdb::master::{run_master, MasterConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = MasterConfig {
        host: args.host,
        rpc_port: args.port,
        http_port: args.http_port,
        m: args.map_tasks,
        r: args.reduce_tasks,
        input: args.input,
        data_root: args.data_root,
        grace: Duration::from_secs(3),
    };
    let final_path = run_master(config).await?;
    println!("final output written to {}", final_path.display());
    Ok(())
}
