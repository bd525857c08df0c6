use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::mpsc;
use tracing::warn;

use wireline::{
    Endpoint, EndpointConfig, EndpointHandler, Message, NetError, Peer, Server, ServerHandler,
};

mod cli;

use cli::{Cli, ClientArgs, Command, ServeArgs};

const CHAT_KIND: &str = "chat";

#[derive(Debug, Serialize, Deserialize)]
struct ChatPayload {
    nickname: String,
    text: String,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Client(args) => client(args).await,
    }
}

/// Relays every inbound chat message to every connected client,
/// including the sender. The handler only bridges messages out of the
/// callback; the relay loop below does the broadcasting.
struct RelayHandler {
    inbound: mpsc::UnboundedSender<Message>,
}

impl ServerHandler for RelayHandler {
    fn on_client_connected(&self, peer: &Arc<Peer>) {
        println!("*** client {} connected from {}", peer.id(), peer.addr());
    }

    fn on_client_disconnected(&self, peer: &Arc<Peer>) {
        println!("*** client {} disconnected", peer.id());
    }

    fn on_message(&self, message: Message, _from: &Arc<Peer>) {
        let _ = self.inbound.send(message);
    }

    fn on_error(&self, error: &NetError) {
        warn!(%error, "server error");
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let (inbound, mut messages) = mpsc::unbounded_channel();
    let server = Server::new(RelayHandler { inbound });
    let addr = server
        .start(args.listen)
        .await
        .with_context(|| format!("failed to start server on {}", args.listen))?;

    println!("listening on {addr}");

    loop {
        select! {
            message = messages.recv() => {
                let Some(message) = message else { break };
                if let Err(error) = server.send_to_all(&message).await {
                    warn!(%error, "broadcast failed");
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    server.stop().await;
    Ok(())
}

/// Prints inbound chat lines and signals the input loop when the
/// connection goes away.
struct ChatHandler {
    closed: mpsc::UnboundedSender<()>,
}

impl EndpointHandler for ChatHandler {
    fn on_disconnected(&self) {
        let _ = self.closed.send(());
    }

    fn on_message(&self, message: Message) {
        match message.decode::<ChatPayload>() {
            Ok(chat) => println!("<{}> {}", chat.nickname, chat.text),
            Err(error) => warn!(%error, kind = message.kind(), "unrecognized message"),
        }
    }

    fn on_error(&self, error: &NetError) {
        warn!(%error, "connection error");
    }
}

async fn client(args: ClientArgs) -> Result<()> {
    let config = EndpointConfig::from_millis(args.timeout_ms)?;
    let (closed, mut closed_rx) = mpsc::unbounded_channel();
    let endpoint = Endpoint::new(config, ChatHandler { closed });

    endpoint
        .connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    println!("*** connected to {}", args.server);

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            _ = closed_rx.recv() => {
                println!("*** server closed the connection");
                break;
            }
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_input(&endpoint, &args.nickname, bytes_read?, &input).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    endpoint.disconnect(true).await;
    Ok(())
}

async fn handle_input(
    endpoint: &Endpoint,
    nickname: &str,
    bytes_read: usize,
    input: &str,
) -> Result<bool> {
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        println!("*** leaving chat");
        return Ok(false);
    }

    let payload = ChatPayload {
        nickname: nickname.to_string(),
        text: text.to_string(),
    };
    endpoint.send(&Message::new(CHAT_KIND, &payload)?).await?;
    Ok(true)
}
