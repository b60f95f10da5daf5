//! TCP Relay Server - Entry Point
//!
//! Parses the listening port, sets up logging and runs the chat manager
//! until a client asks for shutdown.

use std::fs::File;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::{CommandFactory, Parser};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tcp_relay::config::{parse_port, AcceptMode, Config, DEFAULT_BIND_IP, MAX_COUNT_CLIENT};
use tcp_relay::ChatManager;

#[derive(Parser, Debug)]
#[command(name = "tcp_relay")]
#[command(about = "Relays every message a client sends to all other clients", long_about = None)]
struct Args {
    /// Port number to listen on
    #[arg(value_parser = parse_port)]
    port: u16,

    /// IP address to bind to
    #[arg(long, default_value_t = DEFAULT_BIND_IP)]
    bind: IpAddr,

    /// Maximum number of simultaneously connected clients
    #[arg(long, default_value_t = MAX_COUNT_CLIENT)]
    max_clients: usize,

    /// How the accept loop waits for new clients
    #[arg(long, value_enum, default_value_t = AcceptMode::Reactor)]
    accept_mode: AcceptMode,

    /// Write the log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(log_file: Option<&PathBuf>) -> std::io::Result<()> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=tcp_relay=trace
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tcp_relay=info"));
    match log_file {
        Some(path) => {
            let file = File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("run_server");

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => {
            // --help / --version
            e.print()?;
            return Ok(());
        }
        Err(e) => {
            eprint!("{}", e);
            println!("Invalid parameters. Please enter the port number");
            println!("{}", Args::command().render_usage());
            return Ok(());
        }
    };

    if let Err(e) = init_logging(args.log_file.as_ref()) {
        eprintln!("Cannot open log file: {}", e);
        return Ok(());
    }

    let config = Config {
        bind_ip: args.bind,
        port: args.port,
        max_clients: args.max_clients,
        accept_mode: args.accept_mode,
        ..Config::default()
    };

    // the process exits successfully even when the server cannot start
    let manager = match ChatManager::bind(config) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to start server: {}", e);
            return Ok(());
        }
    };

    match manager.run() {
        Ok(()) => info!("Relay server shut down"),
        Err(e) => error!("Server stopped: {}", e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_error_keeps_reason() {
        let err = Args::try_parse_from(["tcp_relay", "0"]).unwrap_err();
        assert!(err.use_stderr());
        assert!(err.to_string().contains("0 is not a usable port"));
    }

    #[test]
    fn test_missing_port_is_rejected() {
        assert!(Args::try_parse_from(["tcp_relay"]).is_err());
    }

    #[test]
    fn test_defaults_from_command_line() {
        let args = Args::try_parse_from(["tcp_relay", "9000"]).unwrap();
        assert_eq!(args.port, 9000);
        assert_eq!(args.bind, DEFAULT_BIND_IP);
        assert_eq!(args.max_clients, MAX_COUNT_CLIENT);
        assert_eq!(args.accept_mode, AcceptMode::Reactor);
        assert!(args.log_file.is_none());
    }

    #[test]
    fn test_unwritable_log_file_is_an_error() {
        // fails before any subscriber is installed
        let path = PathBuf::from("/nonexistent-dir/tcp_relay.log");
        assert!(init_logging(Some(&path)).is_err());
    }
}
