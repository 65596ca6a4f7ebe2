//! Client side of the exchange, run by the boot time agent.

use crate::attest::{AttestError, Prover};
use crate::channel::ws::ClientSocket;
use crate::channel::{read_json, write_json, ChannelError, FrameChannel, Timeouts};
use crate::config::ConfigSources;
use crate::payload::{Payload, NO_SECRET_PREFIX};
use crate::seal::SealError;
use crate::server::{GET_PASS, POST_PASS};
use crate::volume::PartitionDescriptor;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use zeroize::Zeroizing;

pub mod resolver;

pub use resolver::{Resolver, ResolverConfig};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("no server configured")]
    NoServer,
    #[error("invalid server address `{0}`")]
    InvalidServer(String),
    #[error("invalid header value for `{0}`")]
    InvalidHeader(&'static str),
    #[error("pass for partition not found")]
    PassphraseNotFound,
    #[error("{0}")]
    Rejected(String),
    #[error("broker answered without passphrase or error")]
    EmptyResponse,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Attest(#[from] AttestError),
    #[error(transparent)]
    Seal(#[from] SealError),
}

impl ClientError {
    /// Whether another attempt may succeed. Explicit refusals from the broker
    /// are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::NoServer
                | ClientError::EmptyResponse
                | ClientError::Channel(_)
                | ClientError::Attest(_)
        )
    }
}

pub type Result<T, E = ClientError> = core::result::Result<T, E>;

pub struct Passphrase {
    pub value: Zeroizing<String>,
    pub generated_by: Option<String>,
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Passphrase")
            .field("value", &"<redacted>")
            .field("generated_by", &self.generated_by)
            .finish()
    }
}

/// Maps a broker response onto the client's view of it.
pub fn classify(payload: Payload) -> Result<Passphrase> {
    if payload.has_passphrase() {
        return Ok(Passphrase {
            value: Zeroizing::new(payload.passphrase.unwrap_or_default()),
            generated_by: payload.generated_by.filter(|g| !g.is_empty()),
        });
    }
    match payload.error.filter(|e| !e.is_empty()) {
        Some(e) if e.starts_with(NO_SECRET_PREFIX) => Err(ClientError::PassphraseNotFound),
        Some(e) => Err(ClientError::Rejected(e)),
        None => Err(ClientError::EmptyResponse),
    }
}

/// Something that can tell where the broker is right now.
pub trait ServerSource: Send + Sync {
    fn server(&self) -> Option<String>;
}

impl ServerSource for ConfigSources {
    fn server(&self) -> Option<String> {
        ConfigSources::server(self)
    }
}

impl ServerSource for Option<String> {
    fn server(&self) -> Option<String> {
        self.clone().filter(|s| !s.trim().is_empty())
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_pass(&self, server: &str, partition: &PartitionDescriptor) -> Result<Passphrase>;

    async fn post_pass(
        &self,
        server: &str,
        partition: &PartitionDescriptor,
        payload: &Payload,
    ) -> Result<()>;
}

/// Websocket URL for `path` on `server`. `http(s)` schemes are mapped to
/// `ws(s)`.
pub fn endpoint(server: &str, path: &str) -> Result<String> {
    let base = server.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_owned()
    } else {
        return Err(ClientError::InvalidServer(server.to_owned()));
    };
    Ok(format!("{base}{path}"))
}

/// Talks to the broker over websockets, proving identity with `P`.
pub struct WsBroker<P> {
    prover: P,
    timeouts: Timeouts,
}

impl<P: Prover> WsBroker<P> {
    pub fn new(prover: P) -> Self {
        Self {
            prover,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn request(&self, url: &str, partition: &PartitionDescriptor) -> Result<Request> {
        let mut request = url
            .into_client_request()
            .map_err(|_| ClientError::InvalidServer(url.to_owned()))?;
        let value = |name: &'static str, v: &str| {
            HeaderValue::from_str(v).map_err(|_| ClientError::InvalidHeader(name))
        };
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, value("Authorization", &self.prover.token()?)?);
        headers.insert("label", value("label", &partition.label)?);
        headers.insert("name", value("name", &partition.name)?);
        headers.insert("uuid", value("uuid", &partition.uuid)?);
        Ok(request)
    }

    async fn open(
        &self,
        server: &str,
        path: &str,
        partition: &PartitionDescriptor,
    ) -> Result<ClientSocket> {
        let request = self.request(&endpoint(server, path)?, partition)?;
        let mut socket = ClientSocket::connect(request, self.timeouts).await?;
        self.prover.respond(&mut socket).await?;
        Ok(socket)
    }
}

#[async_trait]
impl<P: Prover> Broker for WsBroker<P> {
    async fn get_pass(&self, server: &str, partition: &PartitionDescriptor) -> Result<Passphrase> {
        let mut socket = self.open(server, GET_PASS, partition).await?;
        let payload: Payload = read_json(&mut socket).await?;
        socket.close().await.ok();
        classify(payload)
    }

    async fn post_pass(
        &self,
        server: &str,
        partition: &PartitionDescriptor,
        payload: &Payload,
    ) -> Result<()> {
        let mut socket = self.open(server, POST_PASS, partition).await?;
        write_json(&mut socket, payload).await?;
        // The broker's next challenge, or its hangup, means the submission
        // has been dealt with.
        let done = match socket.recv_frame().await {
            Ok(_) | Err(ChannelError::Closed) => Ok(()),
            Err(e) => Err(e.into()),
        };
        socket.close().await.ok();
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_http_to_ws() -> eyre::Result<()> {
        assert_eq!(endpoint("http://10.0.0.1:8082", GET_PASS)?, "ws://10.0.0.1:8082/getPass");
        assert_eq!(endpoint("https://ks.example/", POST_PASS)?, "wss://ks.example/postPass");
        assert_eq!(endpoint("ws://ks:1/base", GET_PASS)?, "ws://ks:1/base/getPass");
        assert!(matches!(
            endpoint("ks.example", GET_PASS),
            Err(ClientError::InvalidServer(_))
        ));
        Ok(())
    }

    #[test]
    fn classifies_broker_answers() {
        let pass = classify(Payload::passphrase("abc", Some("tpm".into()))).expect("passphrase");
        assert_eq!(pass.value.as_str(), "abc");
        assert_eq!(pass.generated_by.as_deref(), Some("tpm"));

        assert!(matches!(
            classify(Payload::no_secret("H1", "ROOT")),
            Err(ClientError::PassphraseNotFound)
        ));
        let refused = classify(Payload::quarantined("ROOT")).unwrap_err();
        assert!(!refused.is_retryable());
        assert_eq!(refused.to_string(), "quarantined: ROOT");
        let empty = classify(Payload::default()).unwrap_err();
        assert!(empty.is_retryable());
    }

    #[test]
    fn passphrase_debug_is_redacted() {
        let pass = classify(Payload::passphrase("hunter2", None)).expect("passphrase");
        assert!(!format!("{pass:?}").contains("hunter2"));
    }

    #[test]
    fn fixed_server_source() {
        assert_eq!(Some("http://ks".to_owned()).server().as_deref(), Some("http://ks"));
        assert_eq!(Some("  ".to_owned()).server(), None);
        assert_eq!(None::<String>.server(), None);
    }
}
