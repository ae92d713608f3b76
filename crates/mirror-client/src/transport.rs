//! 전송 계층 추상화.
//!
//! `Session`은 구체적인 WebSocket 구현 대신 `Transport`/`Connector`
//! trait에 의존합니다. 운영 환경에서는 `WsConnector`가 tokio-tungstenite
//! 연결을 제공하고, 테스트에서는 채널 기반 목(mock) 전송을 주입합니다.

use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

/// 단일 양방향 텍스트 프레임 스트림.
#[async_trait]
pub trait Transport: Send {
    /// 텍스트 프레임을 전송합니다.
    async fn send(&mut self, text: String) -> ClientResult<()>;

    /// 다음 텍스트 프레임을 수신합니다. 연결이 닫히면 None을 반환합니다.
    async fn recv(&mut self) -> Option<ClientResult<String>>;

    /// 연결을 닫습니다.
    async fn close(&mut self);
}

/// 엔드포인트로의 전송 연결을 여는 팩토리.
#[async_trait]
pub trait Connector: Send + Sync {
    /// 주어진 엔드포인트에 연결합니다.
    async fn connect(&self, endpoint: &str) -> ClientResult<Box<dyn Transport>>;
}

/// tokio-tungstenite 기반 운영용 커넥터.
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> ClientResult<Box<dyn Transport>> {
        let (ws, _) = connect_async(endpoint)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Box::new(WsTransport { ws }))
    }
}

struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> ClientResult<()> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<ClientResult<String>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong은 tungstenite에서 자동으로 처리됨
                    debug!("Received ping/pong");
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(ClientError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
