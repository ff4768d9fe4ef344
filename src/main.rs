//! Hush - serverless chat for the local network.
//!
//! Type a line and press enter to send it to everyone on the network.
//! `/peers` prints the status line, `/quit` (or Ctrl-D / Ctrl-C) exits.
//!
//! ## Testing with multiple instances on one machine
//!
//! Instances on one machine find each other like any other peers. To keep a
//! test group apart from real users, give it its own topic:
//! ```bash
//! # Terminal 1
//! HUSH_TOPIC=test-room cargo run
//!
//! # Terminal 2
//! HUSH_TOPIC=test-room cargo run
//! ```

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hush::app::{default_username, ChatState};
use hush::chat::{bootstrap, ChatMessage, ChatSession, PeerCountMonitor};
use hush::config::NetConfig;
use hush::net::wifi::wifi_ssid;

/// How often the "connecting" indicator is refreshed while bootstrapping.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    init_logging();

    let username = prompt_username().context("failed to read username")?;
    let runtime = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
    runtime.block_on(run(username))
}

/// Asks for a display name, falling back to a generated one.
fn prompt_username() -> Result<String> {
    let fallback = default_username();
    print!("Username [{fallback}]: ");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let name = line.trim();
    Ok(if name.is_empty() {
        fallback
    } else {
        name.to_string()
    })
}

async fn run(username: String) -> Result<()> {
    let config = NetConfig::from_env();
    let state = ChatState::new(&username);
    let cancel = CancellationToken::new();

    let ctrl_c_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Failed to listen for Ctrl-C");
                        return;
                    }
                    info!("Ctrl-C received, shutting down");
                    cancel.cancel();
                }
            }
        })
    };

    let ssid_task = {
        let state = state.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(wifi_ssid).await {
                Ok(ssid) => state.set_ssid(ssid),
                Err(e) => debug!(error = %e, "SSID lookup task failed"),
            }
        })
    };

    let Some(mut session) = wait_until_ready(&state, &config, &cancel).await? else {
        ctrl_c_task.abort();
        return Ok(());
    };
    let _ = ssid_task.await;
    println!("{}", state.status_line());

    let messages = session
        .listen_for_messages(cancel.clone())
        .context("failed to start message stream")?;
    let session = Arc::new(session);

    let receive_task = spawn_receive_task(state.clone(), messages);
    let peer_task = spawn_peer_task(state.clone(), &session, &config, &cancel);

    input_loop(&state, &session, &cancel).await;

    cancel.cancel();
    session.shutdown().await;
    for task in [receive_task, peer_task, ctrl_c_task] {
        let _ = task.await;
    }

    info!("Goodbye");
    Ok(())
}

/// Bootstraps the chat stack while showing a connecting indicator.
///
/// Returns `None` if cancelled before the outcome arrived.
async fn wait_until_ready(
    state: &ChatState,
    config: &NetConfig,
    cancel: &CancellationToken,
) -> Result<Option<ChatSession>> {
    let outcome = bootstrap(config.clone()).wait();
    tokio::pin!(outcome);

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Ok(None),

            result = &mut outcome => {
                return match result {
                    Ok(session) => {
                        state.set_ready();
                        Ok(Some(session))
                    }
                    Err(e) => {
                        state.set_failed(&e);
                        eprintln!("\r{}", state.status_line());
                        Err(e).context("could not join the local chat")
                    }
                };
            }

            _ = heartbeat.tick() => {
                eprint!("\r{} ", state.status_line());
            }
        }
    }
}

/// Prints and records every inbound message until the stream closes.
fn spawn_receive_task(
    state: ChatState,
    mut messages: tokio::sync::mpsc::Receiver<ChatMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Receive task started");
        while let Some(msg) = messages.recv().await {
            println!("{}", render(&msg));
            state.push_message(msg);
        }
        info!("Message stream closed");
    })
}

/// Keeps the peer count in the shared state current.
fn spawn_peer_task(
    state: ChatState,
    session: &Arc<ChatSession>,
    config: &NetConfig,
    cancel: &CancellationToken,
) -> JoinHandle<()> {
    let mut counts =
        PeerCountMonitor::spawn(Arc::clone(session), config.peer_poll_interval, cancel.clone());

    tokio::spawn(async move {
        while counts.changed().await.is_ok() {
            let count = *counts.borrow_and_update();
            state.set_peer_count(count);
            eprintln!("{}", state.status_line());
        }
    })
}

/// Reads lines from stdin and publishes them until EOF, `/quit` or cancellation.
async fn input_loop(state: &ChatState, session: &ChatSession, cancel: &CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from stdin");
                break;
            }
        };

        let text = line.trim();
        match text {
            "" => continue,
            "/quit" => break,
            "/peers" => {
                println!("{}", state.status_line());
                continue;
            }
            _ => {}
        }

        let own = state.push_own(text);
        if let Err(e) = session.publish(own.sender(), own.content()).await {
            warn!(error = %e, "Failed to send message");
            eprintln!("(not sent: {e})");
        }
    }
}

fn render(msg: &ChatMessage) -> String {
    format!("<{}> {}", msg.sender(), msg.content())
}

/// Initialize logging with tracing.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hush=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}
