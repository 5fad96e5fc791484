//! tftpd - standalone TFTP server executable
//!
//! Serves read requests out of one directory and stores write requests
//! into another. Runs with defaults when given no arguments.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use tftp::{ServerConfig, TransferConfig};

const DEFAULT_BIND: &str = "0.0.0.0:4970"; // unprivileged port; redirect or run as root for :69
const DEFAULT_READ_ROOT: &str = "./read";
const DEFAULT_WRITE_ROOT: &str = "./write";

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP server (RFC 1350) with separate read and write directories",
    example = "Serve the defaults (./read and ./write on port 4970):\n  {command_name}",
    example = "Custom roots on the standard port:\n  {command_name} --bind 0.0.0.0:69 --read-root /srv/tftp --write-root /srv/incoming",
    example = "Faster retransmission clock, overwriting allowed:\n  {command_name} --timeout-secs 1 --overwrite"
)]
struct CliConfig {
    #[argh(
        option,
        short = 'b',
        description = "address to listen on for requests",
        default = "DEFAULT_BIND.to_string()"
    )]
    bind: String,

    #[argh(
        option,
        short = 'r',
        description = "directory served to read requests",
        default = "PathBuf::from(DEFAULT_READ_ROOT)"
    )]
    read_root: PathBuf,

    #[argh(
        option,
        short = 'w',
        description = "directory write requests are stored into",
        default = "PathBuf::from(DEFAULT_WRITE_ROOT)"
    )]
    write_root: PathBuf,

    #[argh(switch, description = "let write requests overwrite existing files")]
    overwrite: bool,

    #[argh(
        option,
        description = "seconds to wait for the peer before retransmitting",
        default = "3"
    )]
    timeout_secs: u64,

    #[argh(option, description = "maximum concurrent transfers", default = "64")]
    max_transfers: usize,
}

impl CliConfig {
    fn into_server_config(self) -> ServerConfig {
        ServerConfig {
            bind_address: self.bind,
            read_root: self.read_root,
            write_root: self.write_root,
            max_transfers: self.max_transfers,
            transfer: TransferConfig {
                timeout: Duration::from_secs(self.timeout_secs),
                overwrite: self.overwrite,
                ..Default::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli_config: CliConfig = argh::from_env();
    tftp::run(cli_config.into_server_config()).await
}
