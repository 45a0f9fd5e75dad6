//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// huddle - multi-room TCP chat
#[derive(Debug, Parser)]
#[command(name = "huddle")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, env = "HUDDLE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the chat server
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides the config file)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Chat from this terminal
    Chat {
        /// Name to log in with
        #[arg(long, short)]
        name: String,

        /// Server address
        #[arg(long, short, default_value = "127.0.0.1:8080")]
        server: String,
    },
}
