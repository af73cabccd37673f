use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lanline_core::config::DEFAULT_RELAY_URL;
use lanline_core::media::SampleDevices;
use lanline_core::rtc::RtcConnector;
use lanline_core::signaling::SignalingClient;
use lanline_core::{
    telemetry, CallConfig, CallHandle, CallNotice, CallSnapshot, CallState, RelayConfig,
    RemoteEndpoint, SessionDeps,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lanline")]
#[command(about = "Direct audio/video calls between endpoints on the same network")]
struct Cli {
    /// Relay URL (e.g., ws://192.168.1.5:8080)
    #[arg(long, env = "LANLINE_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    relay: String,

    /// Identity to register as (ignored by relays that require a token)
    #[arg(long, env = "LANLINE_USER_ID")]
    user: Option<String>,

    /// Display name shown to the people you call
    #[arg(long, env = "LANLINE_NAME")]
    name: Option<String>,

    /// Signed identity token for relays that require one
    #[arg(long, env = "LANLINE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call another endpoint
    Dial {
        /// Identity to call
        to: String,

        /// Send and request video as well as audio
        #[arg(long)]
        video: bool,
    },
    /// Wait for incoming calls
    Listen {
        /// Answer incoming calls without prompting
        #[arg(long)]
        auto_accept: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(cli.log_file.as_deref()).context("failed to initialise logging")?;

    let mut relay = RelayConfig::new(&cli.relay)?;
    relay.user_id = cli.user.clone();
    relay.name = cli.name.clone();
    relay.token = cli.token.clone();
    if relay.user_id.is_none() && relay.token.is_none() {
        anyhow::bail!("either --user or --token is required to register with the relay");
    }

    let mut call_config = CallConfig::from_env();
    if cli.name.is_some() {
        call_config.display_name = cli.name.clone();
    }

    let (signaling, inbound) = SignalingClient::connect(&relay)
        .await
        .with_context(|| format!("could not reach relay at {}", relay.url))?;
    let signaling = Arc::new(signaling);
    info!(endpoint = %signaling.endpoint(), "connected to relay");
    println!("registered as {}", signaling.endpoint());

    let connector = RtcConnector::new().context("failed to set up the media engine")?;
    let handle = CallHandle::spawn(
        call_config,
        SessionDeps {
            devices: Arc::new(SampleDevices),
            connector: Arc::new(connector),
            signaler: signaling.clone(),
        },
    );
    handle.attach_inbound(inbound);

    let outcome = match cli.command {
        Command::Dial { to, video } => {
            // Subscribe first: a failed ring can resolve before dial returns.
            let snapshots = handle.subscribe();
            let notices = handle.notices();
            handle
                .dial(RemoteEndpoint::new(to.as_str()), video)
                .await
                .with_context(|| format!("could not call {to}"))?;
            println!("calling {to}... (h to hang up)");
            run_console(&handle, snapshots, notices, false, true).await
        }
        Command::Listen { auto_accept } => {
            println!("waiting for calls (Ctrl-C to quit)");
            run_console(&handle, handle.subscribe(), handle.notices(), auto_accept, false).await
        }
    };

    handle.shutdown().await;
    signaling.close().await;
    outcome
}

/// Drive the session from the terminal until the user quits or, for an
/// outgoing call, until the call is over.
async fn run_console(
    handle: &CallHandle,
    mut snapshots: watch::Receiver<CallSnapshot>,
    mut notices: broadcast::Receiver<CallNotice>,
    auto_accept: bool,
    exit_when_idle: bool,
) -> Result<()> {
    let mut stdin = Some(BufReader::new(tokio::io::stdin()).lines());
    // An outgoing call counts as started even if it is already over.
    let mut was_in_call = exit_when_idle || handle.state() != CallState::Idle;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let snapshot = snapshots.borrow_and_update().clone();
                report_state(&snapshot);
                match snapshot.state {
                    CallState::Incoming if auto_accept => {
                        if let Err(err) = handle.accept().await {
                            warn!(error = %err, "could not accept call");
                        }
                    }
                    CallState::Idle if was_in_call && exit_when_idle => {
                        while let Ok(notice) = notices.try_recv() {
                            report_notice(&notice);
                        }
                        return Ok(());
                    }
                    _ => {}
                }
                was_in_call = snapshot.state != CallState::Idle;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => report_notice(&notice),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed call notices"),
                Err(RecvError::Closed) => return Ok(()),
            },
            line = next_line(&mut stdin) => {
                match line {
                    Some(line) => {
                        if !run_command(handle, line.trim()).await {
                            return Ok(());
                        }
                    }
                    None => stdin = None,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if handle.state() != CallState::Idle {
                    let _ = handle.hangup().await;
                }
                return Ok(());
            }
        }
    }
}

async fn next_line(
    stdin: &mut Option<tokio::io::Lines<BufReader<tokio::io::Stdin>>>,
) -> Option<String> {
    match stdin {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// Returns false when the user asked to quit.
async fn run_command(handle: &CallHandle, input: &str) -> bool {
    let result = match input {
        "" => return true,
        "a" | "accept" => handle.accept().await,
        "d" | "decline" => handle.decline().await,
        "h" | "hangup" => handle.hangup().await,
        "m" | "mute" => handle.set_muted(!handle.snapshot().muted).await,
        "q" | "quit" => {
            if handle.state() != CallState::Idle {
                let _ = handle.hangup().await;
            }
            return false;
        }
        other => {
            println!("unknown command '{other}' (a)ccept (d)ecline (h)angup (m)ute (q)uit");
            return true;
        }
    };
    if let Err(err) = result {
        println!("{err}");
    }
    true
}

fn report_state(snapshot: &CallSnapshot) {
    let remote = snapshot
        .remote
        .as_ref()
        .map(RemoteEndpoint::label)
        .unwrap_or("-");
    match snapshot.state {
        CallState::Idle => println!("idle"),
        CallState::Calling => println!("ringing {remote}..."),
        CallState::Incoming => {
            let media = if snapshot.has_video { "video" } else { "audio" };
            println!("incoming {media} call from {remote}: (a)ccept or (d)ecline");
        }
        CallState::Connecting => println!("connecting to {remote}..."),
        CallState::Active => {
            let muted = if snapshot.muted { " (muted)" } else { "" };
            println!("in call with {remote}{muted}");
        }
    }
}

fn report_notice(notice: &CallNotice) {
    match notice {
        CallNotice::Failed(failure) => println!("call failed: {failure}"),
        CallNotice::Ended { remote, reason } => println!("{remote} ended the call ({reason})"),
        CallNotice::Rejected { caller } => {
            println!("{} tried to call while you were busy", caller.label())
        }
    }
}
