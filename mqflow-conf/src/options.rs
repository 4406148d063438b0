use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Upper bound for the outbound in-flight window of every connection
    #[structopt(name = "max-inflight-window", long)]
    pub max_inflight_window: Option<u16>,

    /// Number of connections closed concurrently per shutdown batch
    #[structopt(name = "shutdown-partition-size", long)]
    pub shutdown_partition_size: Option<usize>,
}
