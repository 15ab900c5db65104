// TCP 媒体服务器连接
//
// 每条消息为 u32 大端长度前缀 + bincode 编码的 `StreamMessage`。
// 每次建连后先发送 Hello，媒体服务器据此把重连续接到同一会话上。

use async_trait::async_trait;
use common::{encode_message, MuxedSample, SampleEnvelope, StreamHello, StreamMessage};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::collaborator::MediaSink;
use crate::config::PipelineConfig;
use crate::error::SinkError;
use crate::session::PipelineSession;

pub struct TcpMediaSink {
    address: String,
    hello: StreamHello,
    stream: Option<TcpStream>,
    last_sequence: Option<u64>,
}

impl TcpMediaSink {
    pub fn new(config: &PipelineConfig, session: &PipelineSession) -> Self {
        Self::with_address(
            config.output.address.clone(),
            config,
            session.id(),
            session.started_at().timestamp_millis(),
        )
    }

    pub fn with_address(
        address: String,
        config: &PipelineConfig,
        session_id: Uuid,
        started_at_ms: i64,
    ) -> Self {
        let media = &config.media;
        Self {
            address,
            hello: StreamHello {
                session_id,
                started_at_ms,
                frame_rate: media.frame_rate,
                sample_rate: media.sample_rate,
                width: media.width,
                height: media.height,
            },
            stream: None,
            last_sequence: None,
        }
    }

    async fn write(&mut self, message: &StreamMessage) -> Result<(), SinkError> {
        let frame = encode_message(message)?;
        let stream = self.stream.as_mut().ok_or(SinkError::NotConnected)?;
        if let Err(e) = stream.write_all(&frame).await {
            self.stream = None;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSink for TcpMediaSink {
    async fn connect(&mut self) -> Result<(), SinkError> {
        self.stream = None;
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        let hello = StreamMessage::Hello(self.hello.clone());
        self.write(&hello).await?;
        info!(
            "Connected to media server {} (session {})",
            self.address, self.hello.session_id
        );
        Ok(())
    }

    async fn send(&mut self, sample: &MuxedSample) -> Result<(), SinkError> {
        let envelope = SampleEnvelope::from_sample(self.hello.session_id, sample);
        self.write(&StreamMessage::Sample(envelope)).await?;
        self.last_sequence = Some(sample.sequence);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if self.stream.is_none() {
            return Ok(());
        }
        if let Some(last_sequence) = self.last_sequence {
            let goodbye = StreamMessage::Goodbye {
                session_id: self.hello.session_id,
                last_sequence,
            };
            self.write(&goodbye).await?;
        }
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        debug!("Media server connection closed");
        Ok(())
    }
}
