//! benchvisor: operator console and coordinator.
//!
//! Reads operator input line by line from stdin:
//! - `end`            broadcast `end` on every bench command topic
//! - `cancel`         abandon the current handshake
//! - `status`         print the registry and live tests
//! - anything else    a scan fed to the reservation handshake; `reset`,
//!                    the bench, then `reset` again releases a stale bench
//!
//! SIGINT/SIGTERM stop every test task (benches stay occupied) and exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use benchvisor::{
    BusClient, Config, LogWriter, RESET_COMMAND, Reservation, ScanOutcome, Subscribe, Supervisor,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Battery test bench coordinator
#[derive(Parser, Debug)]
#[command(name = "benchvisor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file (defaults apply when omitted)
    #[arg(short, long, env = "BENCHVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. `info`, `benchvisor=debug`)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

#[cfg(feature = "mqtt")]
fn make_bus(cfg: &Config) -> Arc<dyn BusClient> {
    Arc::new(benchvisor::MqttBus::connect(
        &cfg.mqtt,
        cfg.bus_capacity_clamped(),
    ))
}

#[cfg(not(feature = "mqtt"))]
fn make_bus(cfg: &Config) -> Arc<dyn BusClient> {
    tracing::warn!("built without the `mqtt` feature; bench topics stay in-process");
    Arc::new(benchvisor::LocalBus::new(cfg.bus_capacity_clamped()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let cfg = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
    let sup = Supervisor::builder(cfg.clone())
        .with_subscribers(subs)
        .with_bus(make_bus(&cfg))
        .build()
        .context("failed to start supervisor")?;

    let console = tokio::spawn(operator_console(Arc::clone(&sup)));
    let result = sup.run().await;
    console.abort();
    result.context("shutdown incomplete")?;
    Ok(())
}

async fn operator_console(sup: Arc<Supervisor>) {
    let mut reservation = sup.reservation();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("scan a bench to start ({})", reservation.expecting());

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("operator input closed");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "reading operator input failed");
                return;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        handle_line(&sup, &mut reservation, input).await;
    }
}

async fn handle_line(sup: &Supervisor, reservation: &mut Reservation, input: &str) {
    let lower = input.to_lowercase();
    if lower == "end" {
        match sup.broadcast_end().await {
            Ok(()) => println!("end sent to every bench"),
            Err(e) => println!("end broadcast failed: {e}"),
        }
        return;
    }
    if lower == "cancel" {
        reservation.cancel();
        println!("handshake cancelled; scan a bench");
        return;
    }
    if lower == "status" {
        print_status(sup).await;
        return;
    }
    match reservation.process_scan(input).await {
        Ok(ScanOutcome::AwaitSerial { bench }) => {
            println!("{} ({:?}): scan the battery serial", bench.name, bench.status);
        }
        Ok(ScanOutcome::AwaitConfirm { bench, serial }) => {
            println!("{serial}: scan {bench} again to confirm");
        }
        Ok(ScanOutcome::Claimed(state)) => {
            println!(
                "{} claimed for {}",
                state.name,
                state.pending_serial.as_deref().unwrap_or("-")
            );
        }
        Ok(ScanOutcome::AwaitResetBench) => println!("scan the bench to reset"),
        Ok(ScanOutcome::AwaitResetConfirm { bench }) => {
            println!("scan {RESET_COMMAND} again to reset {bench}");
        }
        Ok(ScanOutcome::Reset(state)) => println!("{} reset ({:?})", state.name, state.status),
        Err(e) => println!("rejected: {e}; scan a bench"),
    }
}

async fn print_status(sup: &Supervisor) {
    match sup.benches() {
        Ok(table) => {
            for bench in &table.benches {
                println!(
                    "{:<10} {:<10} {:<16} step {}",
                    bench.name,
                    format!("{:?}", bench.status).to_lowercase(),
                    bench.pending_serial.as_deref().unwrap_or("-"),
                    bench.current_step.map(|s| s.code().to_string()).unwrap_or_else(|| "-".into()),
                );
            }
        }
        Err(e) => println!("registry unavailable: {e}"),
    }
    for (bench, serial) in sup.live_tests().await {
        println!("live: {bench} {serial}");
    }
}
