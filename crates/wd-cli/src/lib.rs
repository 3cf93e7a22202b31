//! Workdock CLI library.

pub mod bootstrap;
pub mod connect;
pub mod list;
pub mod login;
pub mod remove;
pub mod start;
pub mod stop;
pub mod target;

// Re-export CLI types for testing
pub use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wd")]
#[command(about = "Reproducible containerized dev workspaces")]
#[command(version, author, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start (or create) a workspace and open its ports
    Start(start::StartArgs),
    /// Stop a workspace's containers, keeping its state
    Stop(target::TargetArgs),
    /// Destroy a workspace's containers and forget it
    Remove(remove::RemoveArgs),
    /// Re-attach tunnels to a running workspace
    Connect(connect::ConnectArgs),
    /// List known workspaces
    List(list::ListArgs),
    /// Authenticate against a control plane
    Login(login::LoginArgs),
}
