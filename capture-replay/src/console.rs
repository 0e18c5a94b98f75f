//! Line-oriented playback control on stdin.

use dashmap::DashMap;
use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::scheduler::Scheduler;

const LINE_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Play(u32),
    Pause,
    Status,
    Clients,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| "empty command".to_string())?;
        let arg = words.next();
        if let Some(extra) = words.next() {
            return Err(format!("unexpected argument '{}'", extra));
        }

        match (verb.to_ascii_lowercase().as_str(), arg) {
            ("play" | "start", None) => Ok(ConsoleCommand::Play(1)),
            ("play" | "start", Some(speed)) => speed
                .trim_end_matches('x')
                .parse()
                .map(ConsoleCommand::Play)
                .map_err(|_| format!("invalid speed '{}'", speed)),
            ("pause", None) => Ok(ConsoleCommand::Pause),
            ("status", None) => Ok(ConsoleCommand::Status),
            ("clients", None) => Ok(ConsoleCommand::Clients),
            ("quit" | "exit", None) => Ok(ConsoleCommand::Quit),
            (other, _) => Err(format!(
                "unknown command '{}' (play [speed], pause, status, clients, quit)",
                other
            )),
        }
    }
}

/// Apply one command. Returns false once the operator asked to quit.
pub fn execute(
    command: ConsoleCommand,
    scheduler: &Scheduler,
    clients: &DashMap<u64, SocketAddr>,
) -> bool {
    match command {
        ConsoleCommand::Play(speed) => scheduler.start(speed),
        ConsoleCommand::Pause => scheduler.pause(),
        ConsoleCommand::Status => {
            let status = scheduler.status();
            info!(
                "{:?}: packet {}/{} ({:.1}%), virtual clock {} ms, speed {}x",
                status.state,
                status.cursor,
                status.len,
                status.progress_percent(),
                status.virtual_clock_ms,
                status.speed
            );
        }
        ConsoleCommand::Clients => {
            let mut peers: Vec<(u64, SocketAddr)> =
                clients.iter().map(|entry| (*entry.key(), *entry.value())).collect();
            peers.sort();
            info!("{} connected clients: {:?}", peers.len(), peers);
        }
        ConsoleCommand::Quit => return false,
    }
    true
}

/// Read commands from stdin until `quit` or end of input.
pub async fn run(scheduler: Arc<Scheduler>, clients: Arc<DashMap<u64, SocketAddr>>) {
    serve_lines(stdin_lines(), &scheduler, &clients).await;
}

/// Stdin lines, read on a detached thread. A blocking stdin read cannot be
/// cancelled, so it must not belong to the runtime's blocking pool or
/// shutdown would wait for the next line.
fn stdin_lines() -> mpsc::Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel(LINE_QUEUE);
    let spawned = thread::Builder::new()
        .name("console-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let failed = line.is_err();
                if tx.blocking_send(line).is_err() || failed {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to start console reader: {}", e);
    }
    rx
}

async fn serve_lines(
    mut lines: mpsc::Receiver<io::Result<String>>,
    scheduler: &Scheduler,
    clients: &DashMap<u64, SocketAddr>,
) {
    loop {
        let line = match lines.recv().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!("Console read failed: {}", e);
                return;
            }
            None => {
                info!("Console input closed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<ConsoleCommand>() {
            Ok(command) => {
                if !execute(command, scheduler, clients) {
                    return;
                }
            }
            Err(e) => warn!("{}", e),
        }
    }
}
