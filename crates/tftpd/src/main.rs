//! tftpd - Main executable
//!
//! Read-only TFTP server for a single directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use argh::FromArgs;
use tftp::{DEFAULT_BIND, TftpServer, TftpServerConfig, Timeouts};
use tftpd::FsReadHandler;
use tracing_subscriber::EnvFilter;

const DEFAULT_ROOT: &str = "./tftp_root";

#[derive(FromArgs, Debug)]
#[argh(
    description = "Read-only TFTP server",
    example = "Serve /srv/tftp on the standard port:\n  {command_name} --root /srv/tftp",
    example = "Unprivileged port with slower retransmission:\n  {command_name} --bind 0.0.0.0:6969 --retransmit-ms 2000"
)]
struct CliConfig {
    #[argh(
        option,
        short = 'b',
        description = "address to listen on",
        default = "DEFAULT_BIND.to_string()"
    )]
    bind: String,

    #[argh(
        option,
        short = 'r',
        description = "directory to serve files from",
        default = "PathBuf::from(DEFAULT_ROOT)"
    )]
    root: PathBuf,

    #[argh(
        option,
        description = "milliseconds to wait for an ack before resending",
        default = "1000"
    )]
    retransmit_ms: u64,

    #[argh(
        option,
        description = "milliseconds without progress before a transfer is abandoned (default: 4x retransmit-ms)"
    )]
    request_timeout_ms: Option<u64>,
}

impl CliConfig {
    fn into_server_config(self) -> Result<(TftpServerConfig, PathBuf)> {
        if self.retransmit_ms == 0 {
            return Err(anyhow!("--retransmit-ms must be greater than zero"));
        }

        let mut timeouts = Timeouts::new(Duration::from_millis(self.retransmit_ms));
        if let Some(ms) = self.request_timeout_ms {
            if ms < self.retransmit_ms {
                return Err(anyhow!(
                    "--request-timeout-ms ({}) must not be shorter than --retransmit-ms ({})",
                    ms,
                    self.retransmit_ms
                ));
            }
            timeouts.request = Duration::from_millis(ms);
        }

        let config = TftpServerConfig {
            bind_address: self.bind,
            timeouts,
        };
        Ok((config, self.root))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli_config: CliConfig = argh::from_env();
    let (config, root) = cli_config.into_server_config()?;
    let handler = FsReadHandler::new(&root)?;

    tracing::info!(
        "Serving {} on {} (retransmit {:?}, give up after {:?})",
        handler.root().display(),
        config.bind_address,
        config.timeouts.retransmission,
        config.timeouts.request
    );

    TftpServer::new(config, handler).run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliConfig, argh::EarlyExit> {
        CliConfig::from_args(&["tftpd"], args)
    }

    #[test]
    fn test_cli_defaults() {
        let (config, root) = parse(&[]).unwrap().into_server_config().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:69");
        assert_eq!(config.timeouts, Timeouts::default());
        assert_eq!(root, PathBuf::from(DEFAULT_ROOT));
    }

    #[test]
    fn test_cli_timeouts() {
        let cli = parse(&["-b", "127.0.0.1:6969", "--retransmit-ms", "250"]).unwrap();
        let (config, _) = cli.into_server_config().unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:6969");
        assert_eq!(config.timeouts.retransmission, Duration::from_millis(250));
        assert_eq!(config.timeouts.request, Duration::from_secs(1));

        let cli = parse(&["--retransmit-ms", "250", "--request-timeout-ms", "3000"]).unwrap();
        let (config, _) = cli.into_server_config().unwrap();
        assert_eq!(config.timeouts.request, Duration::from_secs(3));
    }

    #[test]
    fn test_cli_rejects_bad_timeouts() {
        assert!(parse(&["--retransmit-ms", "0"]).unwrap().into_server_config().is_err());
        let cli = parse(&["--retransmit-ms", "500", "--request-timeout-ms", "100"]).unwrap();
        assert!(cli.into_server_config().is_err());
        assert!(parse(&["--retransmit-ms", "soon"]).is_err());
    }
}
