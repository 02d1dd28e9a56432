//! memlock-mcp: governed long-term memory as a Model Context Protocol server.
//!
//! Exposes the two policy-gated tools (`store_memory`, `retrieve_memory`)
//! over JSON-RPC 2.0 on stdio, backed by a `memlock-core` SQLite store.

mod protocol;
mod server;
mod tools;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use memlock_core::facade::MemoryFacade;
use memlock_core::Storage;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use crate::protocol::stdio::StdioTransport;
use crate::server::McpServer;

struct Args {
    data_dir: Option<PathBuf>,
    settings_file: Option<PathBuf>,
}

/// Parses command-line arguments. Exits the process for `--help`/`--version`.
fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let mut data_dir: Option<PathBuf> = None;
    let mut settings_file: Option<PathBuf> = None;
    let mut i = 1;

    while i < argv.len() {
        match argv[i].as_str() {
            "--help" | "-h" => {
                println!("memlock-mcp {}", env!("CARGO_PKG_VERSION"));
                println!();
                println!("Governed long-term memory store, exposed as an MCP server over stdio.");
                println!();
                println!("USAGE:");
                println!("    memlock-mcp [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help                  Print help information");
                println!("    -V, --version                Print version information");
                println!("    --data-dir <PATH>           Custom data directory for the SQLite store");
                println!("    --settings-file <PATH>      JSON file of settings defaults");
                println!();
                println!("ENVIRONMENT:");
                println!("    RUST_LOG                     Log level filter (e.g. debug, info, warn, error)");
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("memlock-mcp {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--data-dir" => {
                i += 1;
                data_dir = Some(require_path_arg(&argv, i, "--data-dir"));
            }
            arg if arg.starts_with("--data-dir=") => {
                data_dir = Some(PathBuf::from(require_inline_arg(arg, "--data-dir")));
            }
            "--settings-file" => {
                i += 1;
                settings_file = Some(require_path_arg(&argv, i, "--settings-file"));
            }
            arg if arg.starts_with("--settings-file=") => {
                settings_file = Some(PathBuf::from(require_inline_arg(arg, "--settings-file")));
            }
            arg => {
                eprintln!("error: unknown argument '{arg}'");
                eprintln!("Try 'memlock-mcp --help' for more information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    Args {
        data_dir,
        settings_file,
    }
}

fn require_path_arg(argv: &[String], index: usize, flag: &str) -> PathBuf {
    match argv.get(index) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("error: {flag} requires a path argument");
            std::process::exit(1);
        }
    }
}

fn require_inline_arg(arg: &str, flag: &str) -> String {
    let path = arg.strip_prefix(flag).and_then(|s| s.strip_prefix('='));
    match path {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => {
            eprintln!("error: {flag} requires a path argument");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "memlock-mcp starting");

    let storage = match Storage::new(args.data_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to initialize storage");
            std::process::exit(1);
        }
    };

    let facade = Arc::new(MemoryFacade::new(storage, args.settings_file));
    let server = McpServer::new(facade);
    let transport = StdioTransport::new();

    info!("starting MCP server on stdio");
    if let Err(e) = transport.run(server).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("memlock-mcp shutting down");
}
