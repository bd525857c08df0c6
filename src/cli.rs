use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a chat relay server, accepting TCP connections.
    Serve(ServeArgs),
    /// Connect to a server and exchange chat messages.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname attached to outgoing chat messages.
    #[arg(long)]
    pub nickname: String,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,

    /// Connect timeout in milliseconds; 0 waits indefinitely.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: i64,
}
