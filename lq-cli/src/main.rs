//! lq: CLI binary for the lumeq cluster.
//!
//! Modes:
//! - `lq <directory>`    serve the regular files under a directory
//! - `lq --client`       run as a compute node
//!
//! Service discovery is an external collaborator; until one is wired in,
//! workers take the server host from `--server` (default: localhost).

use std::env;
use std::path::PathBuf;
use std::process;

use lq_core::{COMMUNICATION_PORT, WORK_PORT};
use lq_server::{ServeError, Server, ServerOptions};
use lq_worker::Worker;

fn print_usage() {
    eprintln!(
        r#"lq - distributed image lightness equalisation

USAGE:
    lq <directory> [--log FILE]
    lq --client [--persist] [--server HOST]

MODES:
    <directory>         Serve: equalise every regular file under the
                        directory, writing <name>.tiff files to the
                        current working directory
    --client            Run as a compute node

OPTIONS:
    --persist           Keep the worker alive across server dismissals
    --server HOST       Server host for the worker (default: localhost)
    --log FILE          Append NDJSON run events to FILE
    -h, --help          Print this help message
    -V, --version       Print version
"#
    );
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        process::exit(1);
    }

    let mut client = false;
    let mut persist = false;
    let mut server_host = "localhost".to_string();
    let mut log_path: Option<PathBuf> = None;
    let mut directory: Option<PathBuf> = None;

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_usage();
                return;
            }
            "--version" | "-V" => {
                println!("lq {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            "--client" => {
                client = true;
                i += 1;
            }
            "--persist" => {
                persist = true;
                i += 1;
            }
            "--server" => {
                if i + 1 >= args.len() {
                    eprintln!("Missing value for --server");
                    process::exit(1);
                }
                server_host = args[i + 1].clone();
                i += 2;
            }
            "--log" => {
                if i + 1 >= args.len() {
                    eprintln!("Missing value for --log");
                    process::exit(1);
                }
                log_path = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown option: {other}");
                eprintln!("Run `lq --help` for usage.");
                process::exit(1);
            }
            path => {
                if directory.is_some() {
                    eprintln!("Only one input directory is supported");
                    process::exit(1);
                }
                directory = Some(PathBuf::from(path));
                i += 1;
            }
        }
    }

    if client {
        run_worker(&server_host, persist);
        return;
    }

    let Some(directory) = directory else {
        print_usage();
        process::exit(1);
    };

    run_server(&directory, log_path);
}

fn run_worker(server_host: &str, persist: bool) {
    eprintln!("Running as client{}", if persist { " (persistent)" } else { "" });

    let worker = Worker::new();
    worker.add_server(server_host, server_host, WORK_PORT, COMMUNICATION_PORT);
    worker.run_jobs(persist);
}

fn run_server(directory: &PathBuf, log_path: Option<PathBuf>) {
    let options = ServerOptions {
        log_path,
        ..ServerOptions::default()
    };

    let mut server = match Server::bind(options) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("lq: {e}");
            process::exit(2);
        }
    };

    match server.serve(directory) {
        Ok(summary) => {
            println!(
                "Equalised {} image(s); wrote {} output file(s)",
                summary.images,
                summary.outputs.len()
            );
        }
        Err(e @ ServeError::Match(_)) => {
            // A NaN in a histogram comparison has no recovery path.
            eprintln!("lq: fatal: {e}");
            process::exit(3);
        }
        Err(e) => {
            // An unreadable input directory is startup-fatal the same way
            // a failed bind is.
            eprintln!("lq: {e}");
            process::exit(2);
        }
    }
}
