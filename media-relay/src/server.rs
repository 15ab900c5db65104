use std::io::ErrorKind;
use std::net::SocketAddr;

use anyhow::{anyhow, bail, Result};
use common::{decode_length, decode_message, StreamMessage, LENGTH_PREFIX_LEN};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::registry::SessionRegistry;

pub struct RelayServer {
    listener: TcpListener,
    registry: SessionRegistry,
}

impl RelayServer {
    pub async fn bind(addr: &str, registry: SessionRegistry) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(&self) -> Result<()> {
        info!("Relay server running...");

        loop {
            let (stream, peer) = self.listener.accept().await?;
            let registry = self.registry.clone();

            tokio::spawn(async move {
                info!("New pusher connection from: {}", peer);
                if let Err(e) = handle_connection(stream, registry).await {
                    error!("Connection {} error: {}", peer, e);
                }
            });
        }
    }
}

/// 读取一条消息，连接在消息边界处关闭时返回 None
async fn read_message(stream: &mut TcpStream) -> Result<Option<StreamMessage>> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = decode_length(prefix)?;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(decode_message(&body)?))
}

/// 处理一条推流连接，首条消息必须是 Hello
async fn handle_connection(mut stream: TcpStream, registry: SessionRegistry) -> Result<()> {
    let session_id: Uuid = match read_message(&mut stream).await? {
        Some(StreamMessage::Hello(hello)) => {
            registry.on_hello(&hello);
            hello.session_id
        }
        Some(other) => bail!("expected hello, got {}", kind_of(&other)),
        None => return Ok(()),
    };

    while let Some(message) = read_message(&mut stream).await? {
        match message {
            StreamMessage::Sample(envelope) => {
                if envelope.session_id != session_id {
                    bail!(
                        "sample for session {} on connection of {}",
                        envelope.session_id,
                        session_id
                    );
                }
                registry
                    .on_sample(&envelope)
                    .ok_or_else(|| anyhow!("unknown session {}", session_id))?;
                debug!(
                    "Sample #{} {:?} pts={}us",
                    envelope.sequence, envelope.kind, envelope.pts_us
                );
            }
            StreamMessage::Goodbye {
                session_id: id,
                last_sequence,
            } => {
                registry.on_goodbye(id, last_sequence);
                return Ok(());
            }
            StreamMessage::Hello(_) => bail!("duplicate hello on one connection"),
        }
    }

    info!("Session {} connection closed without goodbye", session_id);
    Ok(())
}

fn kind_of(message: &StreamMessage) -> &'static str {
    match message {
        StreamMessage::Hello(_) => "hello",
        StreamMessage::Sample(_) => "sample",
        StreamMessage::Goodbye { .. } => "goodbye",
    }
}
