//! Boot time discovery plugin: one JSON event in, one JSON response out.

use crate::client::{Broker, ClientError, Resolver, ServerSource};
use crate::volume::PartitionDescriptor;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DISCOVERY_PASSWORD: &str = "discovery.password";

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("failed reading event: {0}")]
    Event(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PluginError> = core::result::Result<T, E>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub name: String,
    /// Event specific payload, itself JSON encoded.
    #[serde(default)]
    pub data: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventResponse {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub error: String,
}

impl EventResponse {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }
}

pub async fn handle<B, S>(
    event_name: &str,
    event: &Event,
    resolver: &mut Resolver<B, S>,
) -> EventResponse
where
    B: Broker,
    S: ServerSource,
{
    if event_name != DISCOVERY_PASSWORD {
        return EventResponse::error(format!("unsupported event `{event_name}`"));
    }
    let partition: PartitionDescriptor = match serde_json::from_str(&event.data) {
        Ok(partition) => partition,
        Err(e) => return EventResponse::error(format!("failed reading partition descriptor: {e}")),
    };
    match resolver.resolve(&partition).await {
        Ok(pass) => EventResponse::data(pass.value.as_str()),
        Err(ClientError::NoServer) => EventResponse::error("no server configured"),
        Err(e) => EventResponse::error(format!("failed getting passphrase: {e}")),
    }
}

/// Reads the event from `input` and writes the response to `output`.
pub async fn run<B, S, R, W>(
    event_name: &str,
    mut input: R,
    output: W,
    resolver: &mut Resolver<B, S>,
) -> Result<()>
where
    B: Broker,
    S: ServerSource,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut raw = Vec::new();
    input.read_to_end(&mut raw).await?;
    let event: Event = serde_json::from_slice(&raw)?;
    let response = handle(event_name, &event, resolver).await;
    if !response.error.is_empty() {
        tracing::error!(event = event_name, error = %response.error, "discovery failed");
    }
    write_response(output, &response).await
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    mut output: W,
    response: &EventResponse,
) -> Result<()> {
    output.write_all(&serde_json::to_vec(response)?).await?;
    output.flush().await?;
    Ok(())
}
