//! Command-line interface for c3-hub.

use crate::config::{
    ServerConfig, DEFAULT_LISTEN, DEFAULT_OFFLINE_TIMEOUT_MS, DEFAULT_SHUTDOWN_TIMEOUT_MS,
};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;

/// Command-and-control hub for remote agents.
#[derive(Debug, Parser)]
#[command(name = "c3-hub", version, about)]
pub struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the hub.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "C3_LISTEN", default_value = DEFAULT_LISTEN)]
        listen: SocketAddr,

        /// How long a delete waits for the agent to go offline.
        #[arg(
            long,
            env = "C3_OFFLINE_TIMEOUT_MS",
            default_value_t = DEFAULT_OFFLINE_TIMEOUT_MS,
            value_name = "MILLIS"
        )]
        offline_timeout_ms: u64,

        /// Upper bound on the shutdown sequence.
        #[arg(
            long,
            env = "C3_SHUTDOWN_TIMEOUT_MS",
            default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_MS,
            value_name = "MILLIS"
        )]
        shutdown_timeout_ms: u64,
    },

    /// Connect as an observer and print events (JSON lines).
    Watch {
        /// Hub WebSocket URL.
        #[arg(long, env = "C3_URL", default_value = "ws://127.0.0.1:8080")]
        url: String,

        /// Only show events for these client IDs (comma-separated, or pass multiple times).
        #[arg(long, short, value_delimiter = ',')]
        filter: Vec<String>,

        /// Print shell output as plain text instead of JSON.
        #[arg(long)]
        clean: bool,
    },
}

impl Command {
    /// Server configuration for `serve`.
    #[must_use]
    pub fn server_config(&self) -> Option<ServerConfig> {
        match self {
            Self::Serve {
                listen,
                offline_timeout_ms,
                shutdown_timeout_ms,
            } => Some(ServerConfig {
                listen: *listen,
                offline_timeout: Duration::from_millis(*offline_timeout_ms),
                shutdown_timeout: Duration::from_millis(*shutdown_timeout_ms),
            }),
            Self::Watch { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["c3-hub", "serve"]).expect("parse");
        let config = cli.command.server_config().expect("serve config");
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.offline_timeout, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from([
            "c3-hub",
            "-v",
            "serve",
            "--listen",
            "127.0.0.1:9000",
            "--offline-timeout-ms",
            "500",
        ])
        .expect("parse");
        assert!(cli.verbose);
        let config = cli.command.server_config().expect("serve config");
        assert_eq!(config.listen, "127.0.0.1:9000".parse::<SocketAddr>().expect("addr"));
        assert_eq!(config.offline_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_watch_filter_list() {
        let cli = Cli::try_parse_from(["c3-hub", "watch", "-f", "alpha,beta", "--clean"])
            .expect("parse");
        match cli.command {
            Command::Watch { filter, clean, .. } => {
                assert_eq!(filter, vec!["alpha", "beta"]);
                assert!(clean);
            }
            Command::Serve { .. } => panic!("expected watch"),
        }
        assert!(Cli::try_parse_from(["c3-hub", "watch"])
            .expect("parse")
            .command
            .server_config()
            .is_none());
    }

    #[test]
    fn test_bad_listen_address() {
        assert!(Cli::try_parse_from(["c3-hub", "serve", "--listen", "nope"]).is_err());
    }
}
