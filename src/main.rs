//! The spillway binary: argument parsing, signal wiring, and the run
//! loop. Runs in the foreground; process supervision is someone else's
//! job.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use spillway::config::Config;
use spillway::server::{Server, LOOP_TIMEOUT};

/// An HTTP streaming relay: ingest live streams, fan them out to many
/// listeners.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration document.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on; overrides the configuration.
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,
}

fn bind_address(args: &Args, config: &Config) -> Result<SocketAddr, String> {
    let bind = args
        .bind
        .clone()
        .or_else(|| config.bind.clone())
        .unwrap_or_else(|| "0.0.0.0:8000".to_owned());
    bind.to_socket_addrs()
        .map_err(|err| format!("cannot resolve bind address {bind}: {err}"))?
        .next()
        .ok_or_else(|| format!("cannot resolve bind address {bind}"))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                log::error!("{err}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    let addr = match bind_address(&args, &config) {
        Ok(addr) => addr,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::new(addr, config) {
        Ok(server) => server,
        Err(err) => {
            log::error!("cannot start server: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Signals latch flags that are checked between loop ticks, so they
    // never interrupt a handler mid-callback.
    let stop = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    let graceful = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        if let Err(err) = signal_hook::flag::register(signal, stop.clone()) {
            log::error!("cannot register signal handler: {err}");
            return ExitCode::FAILURE;
        }
    }
    let _ = signal_hook::flag::register(signal_hook::consts::SIGHUP, reload.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGUSR1, graceful.clone());

    while !server.finished() {
        if stop.swap(false, Ordering::Relaxed) {
            server.stop();
            break;
        }
        if graceful.swap(false, Ordering::Relaxed) {
            server.graceful_stop();
        }
        if reload.swap(false, Ordering::Relaxed) {
            match &args.config {
                Some(path) => match Config::load(path) {
                    Ok(config) => {
                        if let Err(err) = server.reconfigure(config) {
                            log::error!("reconfiguration failed: {err}");
                        }
                    }
                    Err(err) => log::error!("cannot reload configuration: {err}"),
                },
                None => log::warn!("no configuration file to reload"),
            }
        }

        if let Err(err) = server.run_once(LOOP_TIMEOUT) {
            log::error!("event loop error: {err}");
            return ExitCode::FAILURE;
        }
    }

    log::info!("bye");
    ExitCode::SUCCESS
}
