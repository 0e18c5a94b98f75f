use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use capture_replay::capture;
use capture_replay::console;
use capture_replay::pcap_import::{self, PayloadFilter, TransportFilter};
use capture_replay::server::{self, ReplayServer, ServeConfig};
use capture_replay::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "capture-replay")]
#[command(about = "Replay captured packet streams to TCP clients with original timing")]
#[command(version)]
struct Args {
    /// Verbose logging (default: false)
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve a capture to every client that connects
    Serve {
        /// Path to the capture file
        #[arg(short, long)]
        file: String,

        /// Interface IP to bind to
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// TCP port to listen on
        #[arg(short, long, default_value_t = server::DEFAULT_PORT)]
        port: u16,

        /// Start playing immediately at this speed multiplier
        #[arg(short, long)]
        speed: Option<u32>,

        /// Start playing at this speed when the first client becomes ready
        #[arg(long)]
        autostart: Option<u32>,

        /// Status report interval in seconds (0 = off)
        #[arg(long, default_value = "5")]
        status_interval: u64,

        /// Socket send buffer size in bytes for each client
        #[arg(long)]
        send_buffer: Option<usize>,

        /// Do not read playback commands from stdin
        #[arg(long)]
        no_console: bool,
    },
    /// Convert a libpcap file into a replay capture
    Convert {
        /// Input PCAP file path
        #[arg(short, long)]
        input: String,

        /// Output capture file path
        #[arg(short, long)]
        output: String,

        /// Transport protocol to extract payloads from
        #[arg(long, value_enum, default_value_t = TransportFilter::Any)]
        protocol: TransportFilter,

        /// Keep only segments sent from this port
        #[arg(long)]
        src_port: Option<u16>,

        /// Keep only segments sent to this port
        #[arg(long)]
        dst_port: Option<u16>,
    },
    /// Print a summary of a capture file
    Inspect {
        /// Path to the capture file
        #[arg(short, long)]
        file: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Commands::Serve {
            file,
            bind,
            port,
            speed,
            autostart,
            status_interval,
            send_buffer,
            no_console,
        } => {
            let config = ServeConfig {
                addr: SocketAddr::new(bind, port),
                autostart_speed: autostart,
                send_buffer_size: send_buffer,
                ..ServeConfig::default()
            };
            serve(&file, config, speed, status_interval, !no_console).await?;
        }
        Commands::Convert {
            input,
            output,
            protocol,
            src_port,
            dst_port,
        } => {
            info!("Converting PCAP {} -> {}", input, output);
            let reader = BufReader::new(
                File::open(&input).with_context(|| format!("Failed to open PCAP file: {}", input))?,
            );
            let filter = PayloadFilter {
                transport: protocol,
                src_port,
                dst_port,
            };
            let (packets, summary) = pcap_import::import(reader, &filter)
                .with_context(|| format!("Failed to read PCAP file: {}", input))?;
            capture::write_capture_file(&output, &packets)
                .with_context(|| format!("Failed to write capture file: {}", output))?;

            info!("Conversion summary:");
            info!("  Frames read: {}", summary.frames);
            info!("  Packets kept: {}", summary.kept);
            info!("  Frames skipped: {}", summary.skipped);
            info!("  Duration: {:.3} seconds", summary.duration_ms as f64 / 1000.0);
        }
        Commands::Inspect { file } => {
            let store = capture::load_file(&file)
                .with_context(|| format!("Failed to load capture file: {}", file))?;
            log_summary(&file, &store);
        }
    }

    Ok(())
}

async fn serve(
    file: &str,
    config: ServeConfig,
    speed: Option<u32>,
    status_interval: u64,
    with_console: bool,
) -> Result<()> {
    info!("Starting capture replay server");
    let store = capture::load_file(file)
        .with_context(|| format!("Failed to load capture file: {}", file))?;
    log_summary(file, &store);

    let scheduler = Arc::new(Scheduler::new(store));
    let server = ReplayServer::bind(config.clone(), scheduler.clone())
        .with_context(|| format!("Failed to listen on {}", config.addr))?;

    if let Some(speed) = speed {
        scheduler.start(speed);
    } else if config.autostart_speed.is_none() && !with_console {
        warn!("No --speed, --autostart or console: playback will never start");
    }

    let reporter = (status_interval > 0).then(|| {
        tokio::spawn(server::report_status(
            scheduler.clone(),
            server.stats(),
            server.clients(),
            Duration::from_secs(status_interval),
        ))
    });

    let console_task = async {
        if with_console {
            info!("Console ready: play [speed], pause, status, clients, quit");
            console::run(scheduler.clone(), server.clients()).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = server.run() => result.context("Replay server stopped")?,
        () = console_task => info!("Console quit requested, shutting down..."),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
        }
    }

    if let Some(reporter) = reporter {
        reporter.abort();
    }

    let status = scheduler.status();
    let counters = server.stats().snapshot();
    info!("======= REPLAY SUMMARY =======");
    info!("Packets revealed: {}/{} ({:.2}%)", status.cursor, status.len, status.progress_percent());
    info!("Virtual clock: {} ms", status.virtual_clock_ms);
    info!("Connections: {}", counters.connections_accepted);
    info!("Packets sent: {}", counters.packets_sent);
    info!("Bytes sent: {} ({:.2} MB)", counters.bytes_sent, counters.bytes_sent as f64 / (1024.0 * 1024.0));
    info!("Client faults: {}", counters.faults);
    info!("==============================");
    Ok(())
}

fn log_summary(file: &str, store: &capture::PacketStore) {
    let summary = store.summary();
    info!("Capture summary for {}:", file);
    info!("  Packets: {}", summary.packets);
    info!("  Payload bytes: {}", summary.bytes);
    info!("  Sent on connect: {} packets at time zero", summary.leading_zero_packets);
    info!("  Duration: {:.3} seconds", summary.duration_ms as f64 / 1000.0);
    if let (Some(first), Some(last)) = (summary.first_timestamp_ms, summary.last_timestamp_ms) {
        info!("  Timestamps: {} ms - {} ms", first, last);
    }
}
