//! Entry point for `kcp-tunnel`.
//!
//! Parses CLI arguments and hands off to [`kcp_tunnel::client::Client`];
//! `main` owns only process setup (logging, argument parsing).  The
//! runtime is single-threaded: every task in the client cooperates on one
//! scheduler thread.

use anyhow::Result;
use clap::Parser;

use kcp_tunnel::client::Client;
use kcp_tunnel::config::Config;

/// Multiplex local TCP connections over one reliable-UDP conversation.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Upstream server host name or address.
    #[arg(short = 's', long)]
    server: String,
    /// Upstream server UDP port.
    #[arg(short = 'p', long)]
    server_port: u16,
    /// Local IP to listen on for TCP connections.
    #[arg(short = 'l', long, default_value = "127.0.0.1")]
    listen_ip: String,
    /// Local TCP port to listen on.
    #[arg(short = 'P', long)]
    listen_port: u16,
    /// TCP read timeout in seconds; 0 disables it.
    #[arg(long, default_value_t = 0)]
    read_timeout: u32,
    /// TCP write timeout in seconds; 0 disables it.
    #[arg(long, default_value_t = 0)]
    write_timeout: u32,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = Config {
        upstream_host: cli.server,
        upstream_port: cli.server_port,
        listen_ip: cli.listen_ip,
        listen_port: cli.listen_port,
        tcp_read_timeout: cli.read_timeout,
        tcp_write_timeout: cli.write_timeout,
    };

    let client = Client::setup(&config).await?;
    client.run().await
}
