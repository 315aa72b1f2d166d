//! duktolan - headless LAN file and text sharing.
//!
//! ## Testing with multiple instances on one machine
//!
//! Give each instance its own ports and receive directory:
//! ```bash
//! # Terminal 1
//! duktolan --udp-port 4644 --tcp-port 4644 --receive-dir /tmp/d1 listen
//!
//! # Terminal 2
//! duktolan --udp-port 4645 --tcp-port 4645 --receive-dir /tmp/d2 listen
//!
//! # Terminal 3
//! duktolan send 127.0.0.1 --port 4645 ./notes.txt
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use duktolan::net::{Engine, EngineCallbacks, EngineConfig, HelloTarget};

/// duktolan - share files and text with Dukto peers on the local network
#[derive(Parser, Debug)]
#[command(name = "duktolan")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Discovery (UDP) port
    #[arg(long, global = true)]
    udp_port: Option<u16>,

    /// Transfer (TCP) port
    #[arg(long, global = true)]
    tcp_port: Option<u16>,

    /// Directory received files are written to
    #[arg(long, global = true)]
    receive_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Announce this machine and receive transfers until interrupted
    Listen {
        /// Accept every transfer without asking
        #[arg(long)]
        accept: bool,
    },

    /// Broadcast a hello and list the peers that answer
    Peers {
        /// Seconds to wait for answers
        #[arg(short, long, default_value_t = 2)]
        wait: u64,
    },

    /// Send files or directories to a peer
    Send {
        /// Peer address or hostname
        host: String,
        /// Peer transfer port (0 for the default)
        #[arg(short, long, default_value_t = 0)]
        port: u16,
        /// Files and directories to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Send a text snippet to a peer
    Text {
        /// Peer address or hostname
        host: String,
        /// Peer transfer port (0 for the default)
        #[arg(short, long, default_value_t = 0)]
        port: u16,
        /// Text to send
        text: String,
    },
}

/// Events forwarded from engine callbacks to the command loop.
#[derive(Debug)]
enum CliEvent {
    Request(String),
    Finished,
    Failed(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = EngineConfig::from_env();
    if let Some(dir) = cli.receive_dir {
        config.receive_dir = dir;
    }
    let ports = (cli.udp_port, cli.tcp_port);

    match cli.command {
        Commands::Listen { accept } => {
            apply_ports(&mut config, ports, None);
            listen(config, accept).await
        }
        Commands::Peers { wait } => {
            apply_ports(&mut config, ports, Some(0));
            peers(config, Duration::from_secs(wait)).await
        }
        Commands::Send { host, port, paths } => {
            apply_ports(&mut config, ports, Some(0));
            send(config, |engine| engine.send_file(&host, paths, port)).await
        }
        Commands::Text { host, port, text } => {
            apply_ports(&mut config, ports, Some(0));
            send(config, |engine| engine.send_text(&host, text, port)).await
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("duktolan={level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Applies CLI port overrides. One-shot commands default to ephemeral
/// ports so they can run next to a listening instance.
fn apply_ports(config: &mut EngineConfig, ports: (Option<u16>, Option<u16>), fallback: Option<u16>) {
    let (udp_port, tcp_port) = ports;
    if let Some(port) = udp_port.or(fallback) {
        config.udp_port = port;
    }
    if let Some(port) = tcp_port.or(fallback) {
        config.tcp_port = port;
    }
}

/// Callbacks that print activity and forward decisions to `tx`.
fn console_callbacks(tx: mpsc::UnboundedSender<CliEvent>) -> EngineCallbacks {
    let request_tx = tx.clone();
    let finished_tx = tx.clone();
    let text_tx = tx.clone();
    let sent_tx = tx.clone();

    EngineCallbacks::new()
        .on_peer_added(|peer| println!("+ {peer}"))
        .on_peer_removed(|peer| println!("- {peer}"))
        .on_receive_request(move |sender| {
            let _ = request_tx.send(CliEvent::Request(sender.to_string()));
        })
        .on_receive_start(|sender| println!("Receiving from {sender}"))
        .on_send_start(|dest| println!("Sending to {dest}"))
        .on_transfer_progress(|total, done| {
            let percent = if total == 0 { 100 } else { done * 100 / total };
            debug!(total, done, percent, "Progress");
        })
        .on_receive_complete(move |created, total| {
            for path in created {
                println!("Received {}", path.display());
            }
            println!("{total} bytes received");
            let _ = finished_tx.send(CliEvent::Finished);
        })
        .on_receive_text(move |text, _| {
            println!("Text received:\n{text}");
            let _ = text_tx.send(CliEvent::Finished);
        })
        .on_send_complete(move |payload| {
            if payload.is_text() {
                println!("Text sent");
            } else {
                println!("Sent {} item(s)", payload.paths().len());
            }
            let _ = sent_tx.send(CliEvent::Finished);
        })
        .on_error(move |message| {
            eprintln!("{message}");
            let _ = tx.send(CliEvent::Failed(message.to_string()));
        })
}

async fn listen(config: EngineConfig, accept: bool) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = Engine::with_config(config, console_callbacks(tx));
    engine.initialize().await?;
    engine.say_hello(HelloTarget::Broadcast, None).await?;

    let receive_dir = engine.config().receive_dir;
    info!(dir = %receive_dir.display(), "Listening for transfers, press Ctrl-C to stop");
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            event = rx.recv() => match event {
                Some(CliEvent::Request(sender)) => {
                    let approve = if accept {
                        true
                    } else {
                        println!("Accept transfer from {sender}? [y/N]");
                        match confirm(&mut stdin, tokio::signal::ctrl_c()).await? {
                            Some(approve) => approve,
                            None => break,
                        }
                    };
                    if approve {
                        engine.approve_transfer();
                    } else {
                        engine.reject_transfer();
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// Reads a yes/no answer. Returns `None` if `interrupt` completes first.
async fn confirm<R, I>(lines: &mut Lines<R>, interrupt: I) -> Result<Option<bool>>
where
    R: AsyncBufRead + Unpin,
    I: Future,
{
    tokio::select! {
        _ = interrupt => Ok(None),
        answer = lines.next_line() => {
            let answer = answer.context("failed to read answer")?;
            Ok(Some(matches!(
                answer.as_deref().map(str::trim),
                Some("y" | "Y" | "yes")
            )))
        }
    }
}

async fn peers(config: EngineConfig, wait: Duration) -> Result<()> {
    let engine = Engine::with_config(config, EngineCallbacks::new());
    engine.initialize().await?;
    engine.say_hello(HelloTarget::Broadcast, None).await?;
    tokio::time::sleep(wait).await;

    let peers = engine.peers();
    if peers.is_empty() {
        println!("No peers found");
    }
    for peer in &peers {
        println!("{peer}");
    }

    engine.shutdown().await;
    Ok(())
}

async fn send<F, E>(config: EngineConfig, start: F) -> Result<()>
where
    F: FnOnce(&Engine) -> Result<tokio::task::JoinHandle<()>, E>,
    E: std::error::Error + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = Engine::with_config(config, console_callbacks(tx));
    engine.initialize().await?;

    let session = start(&engine)?;
    session.await.context("send task panicked")?;
    engine.shutdown().await;

    match rx.try_recv() {
        Ok(CliEvent::Failed(message)) => bail!(message),
        _ => Ok(()),
    }
}
