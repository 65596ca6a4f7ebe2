//! Websocket backed channels: the broker side over axum, the client side
//! over tokio-tungstenite.

use super::{deadline, ChannelError, FrameChannel, Result, Timeouts};
use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

fn transport(e: impl std::fmt::Display) -> ChannelError {
    ChannelError::Transport(e.to_string())
}

fn client_error(e: WsError) -> ChannelError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ChannelError::Closed,
        e => transport(e),
    }
}

/// Broker end of an upgraded `/getPass` or `/postPass` request.
pub struct ServerSocket {
    socket: WebSocket,
    timeouts: Timeouts,
}

impl ServerSocket {
    pub fn new(socket: WebSocket, timeouts: Timeouts) -> Self {
        Self { socket, timeouts }
    }
}

#[async_trait]
impl FrameChannel for ServerSocket {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        let socket = &mut self.socket;
        deadline(self.timeouts.write, async move {
            socket
                .send(AxumMessage::Binary(frame))
                .await
                .map_err(transport)
        })
        .await
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        let socket = &mut self.socket;
        deadline(self.timeouts.read, async move {
            loop {
                match socket.recv().await {
                    None | Some(Ok(AxumMessage::Close(_))) => return Err(ChannelError::Closed),
                    Some(Ok(AxumMessage::Binary(data))) => return Ok(data),
                    Some(Ok(AxumMessage::Text(text))) => return Ok(text.into_bytes()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(transport(e)),
                }
            }
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        let socket = &mut self.socket;
        deadline(self.timeouts.write, async move {
            // The peer may already be gone; nothing left to close then.
            socket.send(AxumMessage::Close(None)).await.ok();
            Ok(())
        })
        .await
    }
}

/// Client end of a connection to the broker.
pub struct ClientSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    timeouts: Timeouts,
}

impl ClientSocket {
    /// Opens the websocket described by `request`, headers included.
    pub async fn connect(request: Request, timeouts: Timeouts) -> Result<Self> {
        let (stream, _response) = deadline(timeouts.read, async move {
            tokio_tungstenite::connect_async(request)
                .await
                .map_err(client_error)
        })
        .await?;
        Ok(Self { stream, timeouts })
    }
}

#[async_trait]
impl FrameChannel for ClientSocket {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        let stream = &mut self.stream;
        deadline(self.timeouts.write, async move {
            stream.send(Message::Binary(frame)).await.map_err(client_error)
        })
        .await
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        let stream = &mut self.stream;
        deadline(self.timeouts.read, async move {
            loop {
                match stream.next().await {
                    None | Some(Ok(Message::Close(_))) => return Err(ChannelError::Closed),
                    Some(Ok(Message::Binary(data))) => return Ok(data),
                    Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(client_error(e)),
                }
            }
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        let stream = &mut self.stream;
        deadline(self.timeouts.write, async move {
            match stream.close(None).await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(transport(e)),
            }
        })
        .await
    }
}
