//! Message framed duplex connections.
//!
//! Every exchange between broker and client is a sequence of binary frames
//! over a [`FrameChannel`]. The websocket implementations live in [`ws`]; an
//! in-process pair for tests and embedding lives in [`memory`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod ws;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("connection closed")]
    Closed,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport: {0}")]
    Transport(String),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = ChannelError> = core::result::Result<T, E>;

#[async_trait]
pub trait FrameChannel: Send {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Next data frame. A close frame or the end of the stream yields
    /// [`ChannelError::Closed`].
    async fn recv_frame(&mut self) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

/// Read and write deadlines applied to each frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub read: Duration,
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(10),
            write: Duration::from_secs(10),
        }
    }
}

pub(crate) async fn deadline<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ChannelError::Timeout(limit))?
}

pub async fn write_json<C, T>(channel: &mut C, value: &T) -> Result<()>
where
    C: FrameChannel + ?Sized,
    T: Serialize + ?Sized,
{
    channel.send_frame(serde_json::to_vec(value)?).await
}

pub async fn read_json<C, T>(channel: &mut C) -> Result<T>
where
    C: FrameChannel + ?Sized,
    T: DeserializeOwned,
{
    let frame = channel.recv_frame().await?;
    Ok(serde_json::from_slice(&frame)?)
}
