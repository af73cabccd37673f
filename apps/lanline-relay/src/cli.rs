use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use lanline_proto::{ClientMessage, EndReason, SessionDescription, ServerMessage};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

use lanline_relay::config::Config;

/// Placeholder offer; the probe only exercises routing.
const PROBE_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=lanline-probe\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
const PROBE_REQUEST_ID: u64 = 1;

#[derive(Parser, Debug)]
#[command(name = "lanline-relay")]
#[command(about = "Lanline call signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Port to listen on (overrides LANLINE_RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// HS256 secret for connection tokens (overrides LANLINE_JWT_SECRET)
    #[arg(long)]
    pub jwt_secret: Option<String>,

    /// Drop connections that have not pinged for this many seconds
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Ring an endpoint with a placeholder offer and report the routing ack
    Probe {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Identity to connect as
        #[arg(long, default_value = "lanline-probe")]
        user: String,

        /// Display name to present
        #[arg(long)]
        name: Option<String>,

        /// Identity to ring
        #[arg(long)]
        to: String,
    },
}

impl Cli {
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secret) = self.jwt_secret.clone().filter(|s| !s.is_empty()) {
            config.jwt_secret = Some(secret);
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout_seconds = secs;
        }
        config
    }
}

pub async fn run_probe(url: String, user: String, name: Option<String>, to: String) -> Result<()> {
    let mut ws_url = Url::parse(&url).context("invalid relay url")?;
    ws_url.set_path("/ws");
    {
        let mut query = ws_url.query_pairs_mut();
        query.append_pair("user_id", &user);
        if let Some(name) = &name {
            query.append_pair("name", name);
        }
    }
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(ws_url.as_str())).await
    {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => return Err(anyhow!("connection failed: {}", e)),
        Err(_) => {
            return Err(anyhow!(
                "connection timeout - is the relay running at {}?",
                url
            ))
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let ring = ClientMessage::Ring {
        to: to.as_str().into(),
        offer: SessionDescription::offer(PROBE_SDP),
        from_name: name,
        request_id: Some(PROBE_REQUEST_ID),
    };
    write
        .send(Message::Text(serde_json::to_string(&ring)?))
        .await?;

    let ack = timeout(Duration::from_secs(5), async {
        while let Some(msg) = read.next().await {
            match msg? {
                Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::RingAck {
                        request_id: PROBE_REQUEST_ID,
                        ok,
                        error,
                    }) => return Ok::<_, anyhow::Error>((ok, error)),
                    Ok(other) => debug!("ignoring {:?}", other),
                    Err(e) => debug!("unparsed frame: {}", e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(anyhow!("connection closed before acknowledgment"))
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for ring acknowledgment"))??;

    match ack {
        (true, _) => {
            println!("ring routed to {}", to);
            let end = ClientMessage::End {
                to: to.as_str().into(),
                reason: EndReason::Hangup,
            };
            write.send(Message::Text(serde_json::to_string(&end)?)).await?;
        }
        (false, error) => {
            println!(
                "ring not routed: {}",
                error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
    }
    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
