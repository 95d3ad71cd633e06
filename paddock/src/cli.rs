use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "paddock")]
#[command(bin_name = "paddock")]
pub struct Cli {
    #[command(subcommand)]
    pub commands: Commands,
}

impl Cli {
    pub fn version(&self) -> bool {
        matches!(self.commands, Commands::Version)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulated fleet of agents contending for one lease.
    Run {
        #[arg(long, env, default_value = "fleet")]
        namespace: String,

        #[arg(long, env, default_value = "leader")]
        name: String,

        /// Number of agents contending for the lease.
        #[arg(long = "holders", short = 'n', default_value = "3")]
        holders: usize,

        /// Lease duration, seconds.
        #[arg(long = "duration", default_value = "30")]
        duration_secs: u64,

        /// Expiry sweep interval, seconds.
        #[arg(long = "reap-interval", default_value = "60")]
        reap_interval_secs: u64,
    },
    Version,
}
