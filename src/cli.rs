use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    about = "Drive tmux-hosted coding agents from chat",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hook server, pane scanner, and tunnel
    Serve {
        /// Override the configured hook port
        #[arg(long)]
        port: Option<u16>,

        /// Skip the public tunnel for this run
        #[arg(long)]
        no_tunnel: bool,
    },

    /// Show the effective configuration
    Config {
        /// Emit JSON instead of the human-readable form
        #[arg(long)]
        json: bool,
    },

    /// List known agent sessions
    Sessions,
}
