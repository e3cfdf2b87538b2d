use clap::{Parser, Subcommand};

use crate::config::daemon::{CleanupArgs, DaemonArgs};

#[derive(Parser)]
#[command(about, long_about = None, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin daemon
    Daemon(Box<DaemonArgs>),
    /// Tear down leaked devices and stale descriptor files
    Cleanup(CleanupArgs),
}
