//! Attestation handshake seam.
//!
//! The broker only needs a verified [`HardwareIdentity`] out of a session;
//! how possession of the module is proven belongs to the
//! [`AttestationProvider`] and its client side [`Prover`].

use crate::channel::{read_json, write_json, ChannelError, FrameChannel};
use crate::identity::HardwareIdentity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttestError {
    #[error("missing authorization token")]
    MissingToken,
    #[error("malformed authorization token: {0}")]
    MalformedToken(String),
    #[error("malformed challenge: {0}")]
    MalformedChallenge(String),
    #[error("challenge response rejected")]
    Rejected,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[cfg(feature = "tpm")]
    #[error(transparent)]
    Tpm(#[from] crate::tpm::TpmError),
}

impl AttestError {
    /// The peer went away before the handshake finished.
    pub fn is_closed(&self) -> bool {
        matches!(self, AttestError::Channel(ChannelError::Closed))
    }
}

pub type Result<T, E = AttestError> = core::result::Result<T, E>;

/// Broker side of the handshake.
#[async_trait]
pub trait AttestationProvider: Send + Sync {
    /// Runs the challenge over `channel` and returns the identity bound to
    /// `token`. Any error fails the session.
    async fn verify(
        &self,
        token: &str,
        channel: &mut dyn FrameChannel,
    ) -> Result<HardwareIdentity>;
}

/// Client side of the handshake.
#[async_trait]
pub trait Prover: Send + Sync {
    /// Value for the `Authorization` header.
    fn token(&self) -> Result<String>;

    /// Answers the broker's challenge on `channel`.
    async fn respond(&self, channel: &mut dyn FrameChannel) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Challenge {
    challenge: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Proof {
    proof: String,
}

fn proof_for(nonce: &[u8], ek_public: &[u8]) -> Vec<u8> {
    Sha256::new()
        .chain_update(nonce)
        .chain_update(ek_public)
        .finalize()
        .to_vec()
}

/// Binds the session to the endorsement key carried in the token.
///
/// The token is the hex encoded endorsement public area. A fresh nonce is
/// sent and must come back hashed together with that key. This ties the
/// answer to the live session but does not by itself prove the caller holds
/// the key; credential activation plugs in through [`AttestationProvider`].
#[derive(Clone, Copy, Debug, Default)]
pub struct EkDigestAttestor;

#[async_trait]
impl AttestationProvider for EkDigestAttestor {
    async fn verify(
        &self,
        token: &str,
        channel: &mut dyn FrameChannel,
    ) -> Result<HardwareIdentity> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AttestError::MissingToken);
        }
        let ek_public =
            hex::decode(token).map_err(|e| AttestError::MalformedToken(e.to_string()))?;

        let nonce: [u8; 32] = rand::random();
        write_json(
            channel,
            &Challenge {
                challenge: hex::encode(nonce),
            },
        )
        .await?;

        let Proof { proof }: Proof = read_json(channel).await?;
        let proof = hex::decode(proof).map_err(|_| AttestError::Rejected)?;
        if proof != proof_for(&nonce, &ek_public) {
            return Err(AttestError::Rejected);
        }
        Ok(HardwareIdentity::from_public(&ek_public))
    }
}

/// Client counterpart of [`EkDigestAttestor`].
#[derive(Clone, Debug)]
pub struct EkDigestProver {
    ek_public: Vec<u8>,
}

impl EkDigestProver {
    pub fn new(ek_public: Vec<u8>) -> Self {
        Self { ek_public }
    }

    pub fn identity(&self) -> HardwareIdentity {
        HardwareIdentity::from_public(&self.ek_public)
    }
}

#[async_trait]
impl Prover for EkDigestProver {
    fn token(&self) -> Result<String> {
        Ok(hex::encode(&self.ek_public))
    }

    async fn respond(&self, channel: &mut dyn FrameChannel) -> Result<()> {
        let Challenge { challenge }: Challenge = read_json(channel).await?;
        let nonce = hex::decode(challenge)
            .map_err(|e| AttestError::MalformedChallenge(e.to_string()))?;
        write_json(
            channel,
            &Proof {
                proof: hex::encode(proof_for(&nonce, &self.ek_public)),
            },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory;
    use eyre::Result;

    #[tokio::test]
    async fn handshake_yields_identity() -> Result<()> {
        let prover = EkDigestProver::new(b"ek-public-area".to_vec());
        let token = prover.token()?;
        let (mut server, mut client) = memory::pair();

        let (identity, answered) = tokio::join!(
            EkDigestAttestor.verify(&token, &mut server),
            prover.respond(&mut client),
        );
        answered?;
        assert_eq!(identity?, prover.identity());
        Ok(())
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() -> Result<()> {
        let claimed = EkDigestProver::new(b"someone-else".to_vec());
        let actual = EkDigestProver::new(b"ours".to_vec());
        let (mut server, mut client) = memory::pair();
        let token = claimed.token()?;

        let (identity, _) = tokio::join!(
            EkDigestAttestor.verify(&token, &mut server),
            actual.respond(&mut client),
        );
        assert!(matches!(identity, Err(AttestError::Rejected)));
        Ok(())
    }

    #[tokio::test]
    async fn bad_tokens_fail_before_challenge() {
        let (mut server, _client) = memory::pair();
        assert!(matches!(
            EkDigestAttestor.verify("", &mut server).await,
            Err(AttestError::MissingToken)
        ));
        assert!(matches!(
            EkDigestAttestor.verify("not-hex", &mut server).await,
            Err(AttestError::MalformedToken(_))
        ));
    }

    #[tokio::test]
    async fn hangup_is_reported_as_closed() {
        let (mut server, client) = memory::pair();
        drop(client);
        let err = EkDigestAttestor
            .verify(&hex::encode(b"ek"), &mut server)
            .await
            .unwrap_err();
        assert!(err.is_closed());
    }
}
