use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Number of map tasks
    #[clap(short = 'm', long)]
    pub map_tasks: u32,
    /// Number of reduce tasks
    #[clap(short = 'r', long)]
    pub reduce_tasks: u32,
    /// Port the task RPC server listens on
    #[clap(short = 'P', long, default_value_t = 50051)]
    pub port: u16,
    /// Port the HTTP file server listens on
    #[clap(long, default_value_t = 3410)]
    pub http_port: u16,
    /// Host name workers use to reach this master's file server
    #[clap(long, default_value = "localhost")]
    pub host: String,
    /// Input pair relation
    #[clap(short, long, default_value = "data/austen.db")]
    pub input: PathBuf,
    /// Directory served as /data/
    #[clap(long, default_value = "data")]
    pub data_root: PathBuf,
}
