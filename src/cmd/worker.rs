use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Connect to a master at the given address, e.g. localhost:50051
    #[clap(short, long)]
    pub join: String,
    /// Port this worker's HTTP file server listens on
    #[clap(short, long, default_value_t = 3411)]
    pub port: u16,
    /// Host name peers use to reach this worker's file server
    #[clap(long, default_value = "127.0.0.1")]
    pub advertise: String,
    /// Directory served as /data/
    #[clap(long, default_value = "data")]
    pub data_root: PathBuf,
    /// Named workload to run
    #[clap(short, long, default_value = "wc")]
    pub workload: String,
}
