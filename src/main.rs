//! Entry point for the `rudp` demo.
//!
//! Parses CLI arguments and dispatches into either **server** (echo) or
//! **client** mode.  All protocol work is delegated to the library;
//! `main.rs` owns only process setup (logging, argument parsing).

use std::net::SocketAddr;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rudp::{ConnError, Connector, Peer};

/// Reliable, ordered datagrams over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections and echo every message back.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
    },
    /// Connect, send a few messages and print the echoes.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Messages to send.
        #[arg(short, long, default_value_t = 10)]
        count: u32,
        /// Message text; the index is appended.
        #[arg(short, long, default_value = "Hello world")]
        message: String,
    },
}

fn main() -> ExitCode {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let result = match Cli::parse().mode {
        Mode::Server { bind } => serve(bind),
        Mode::Client {
            server,
            count,
            message,
        } => run_client(server, count, &message),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn serve(bind: SocketAddr) -> Result<(), ConnError> {
    let connector = Connector::bind(bind)?;
    log::info!("Echo server on {}", connector.local_addr());
    loop {
        let peer = connector.accept()?;
        thread::spawn(move || echo(peer));
    }
}

fn echo(peer: Peer) {
    let remote = peer.remote_addr();
    log::info!("Serving {remote}");
    loop {
        match peer.consume() {
            Ok(msg) => {
                if let Err(e) = peer.send(&msg) {
                    log::warn!("Echo to {remote} failed: {e}");
                    return;
                }
            }
            Err(e) => {
                log::info!("{remote} gone: {e}");
                return;
            }
        }
    }
}

fn run_client(server: SocketAddr, count: u32, message: &str) -> Result<(), ConnError> {
    let bind: SocketAddr = if server.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let connector = Connector::bind(bind)?;
    let peer = connector.connect(server, None)?;
    log::info!("Connected to {server} from {}", connector.local_addr());

    for i in 0..count {
        let text = format!("{message} {i}!");
        loop {
            match peer.send(text.as_bytes()) {
                Err(ConnError::SendBufferFull) => thread::sleep(Duration::from_millis(10)),
                other => break other?,
            }
        }
    }
    for _ in 0..count {
        match peer.try_consume(Duration::from_secs(5))? {
            Some(echo) => println!("{}", String::from_utf8_lossy(&echo)),
            None => {
                log::warn!("Timed out waiting for echoes");
                break;
            }
        }
    }
    peer.close();
    Ok(())
}
