//! One client session, end to end.
//!
//! A session lists the declared volumes, runs the attestation handshake,
//! matches the request and then either releases the stored passphrase
//! (`getPass`) or accepts a submitted one (`postPass`). Store outages are
//! retried inside the session; attestation failures end it.

use crate::attest::{AttestError, AttestationProvider};
use crate::channel::{write_json, ChannelError, FrameChannel};
use crate::identity::HardwareIdentity;
use crate::materializer::{CreateOutcome, SecretMaterializer};
use crate::payload::{Payload, GENERATED_BY_KEY};
use crate::store::{RecordStore, SecretRecord, StoreError};
use crate::volume::{find_volume_for, MatchResult, PartitionDescriptor, VolumeRecord};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("attestation failed: {0}")]
    Attestation(#[from] AttestError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub type Result<T, E = SessionError> = core::result::Result<T, E>;

/// Which exchange a session runs. Displays as the route name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Get,
    Post,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Get => f.write_str("getPass"),
            Flow::Post => f.write_str("postPass"),
        }
    }
}

/// Caller supplied values taken from the connection headers. Untrusted
/// until the handshake succeeds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionHeaders {
    pub token: String,
    pub descriptor: PartitionDescriptor,
}

/// How a session copes with record store failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Minimum pause after each failed store call.
    pub backoff: Duration,
    /// Consecutive failed store calls tolerated before the session is closed.
    pub max_transient: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            max_transient: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetOutcome {
    Released,
    NoMatch,
    Quarantined,
    SecretMissing,
    StoreUnavailable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostOutcome {
    /// The client hung up after at least one cycle. `stored` counts the
    /// submissions that created a secret.
    Finished { stored: usize },
    NoMatch,
    Quarantined,
    StoreUnavailable,
}

pub struct SessionHandler {
    store: Arc<dyn RecordStore>,
    attestor: Arc<dyn AttestationProvider>,
    materializer: SecretMaterializer,
    namespace: String,
    retry: RetryPolicy,
}

enum Listing {
    Records(Vec<VolumeRecord>),
    Retry,
    GiveUp,
}

impl SessionHandler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        attestor: Arc<dyn AttestationProvider>,
        namespace: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            materializer: SecretMaterializer::new(store.clone(), namespace.clone()),
            store,
            attestor,
            namespace,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Records a store failure and sleeps. Returns false once the session
    /// has used up its retries.
    async fn back_off(&self, id: Uuid, flow: Flow, err: &StoreError, failures: &mut u32) -> bool {
        *failures += 1;
        warn!(
            session = %id,
            %flow,
            error = %err,
            failures = *failures,
            "record store call failed"
        );
        if *failures >= self.retry.max_transient {
            warn!(session = %id, %flow, "giving up on record store, closing session");
            return false;
        }
        tokio::time::sleep(self.retry.backoff).await;
        true
    }

    async fn list(&self, id: Uuid, flow: Flow, failures: &mut u32) -> Listing {
        match self.store.list_volumes(&self.namespace).await {
            Ok(records) => {
                *failures = 0;
                Listing::Records(records)
            }
            Err(e) => match self.back_off(id, flow, &e, failures).await {
                true => Listing::Retry,
                false => Listing::GiveUp,
            },
        }
    }

    fn lookup(
        &self,
        id: Uuid,
        flow: Flow,
        identity: &HardwareIdentity,
        headers: &SessionHeaders,
        records: &[VolumeRecord],
    ) -> Option<MatchResult> {
        let descriptor = &headers.descriptor;
        debug!(
            session = %id,
            %flow,
            label = %descriptor.label,
            name = %descriptor.name,
            uuid = %descriptor.uuid,
            volumes = records.len(),
            "looking up volume"
        );
        let found = find_volume_for(identity, descriptor, records);
        if found.is_none() {
            warn!(session = %id, %flow, identity = %identity, "no volume declared for request");
        }
        found
    }

    async fn finish(&self, channel: &mut dyn FrameChannel, payload: &Payload) -> Result<()> {
        write_json(channel, payload).await?;
        channel.close().await.ok();
        Ok(())
    }

    /// Serves one `getPass` connection.
    pub async fn get_pass(
        &self,
        id: Uuid,
        headers: &SessionHeaders,
        channel: &mut dyn FrameChannel,
    ) -> Result<GetOutcome> {
        let flow = Flow::Get;
        let mut failures = 0;
        let records = loop {
            match self.list(id, flow, &mut failures).await {
                Listing::Records(records) => break records,
                Listing::Retry => continue,
                Listing::GiveUp => {
                    channel.close().await.ok();
                    return Ok(GetOutcome::StoreUnavailable);
                }
            }
        };

        let identity = self.attestor.verify(&headers.token, channel).await?;
        info!(session = %id, %flow, identity = %identity, "attestation succeeded");

        let Some(matched) = self.lookup(id, flow, &identity, headers, &records) else {
            self.finish(channel, &Payload::no_match(identity.as_str())).await?;
            return Ok(GetOutcome::NoMatch);
        };

        if matched.quarantined {
            warn!(
                session = %id,
                %flow,
                volume = %matched.volume_name,
                label = %matched.partition_label,
                "refusing quarantined volume"
            );
            self.finish(channel, &Payload::quarantined(&matched.partition_label)).await?;
            return Ok(GetOutcome::Quarantined);
        }

        let secret = matched.secret_ref();
        let existing = loop {
            match self.materializer.get_existing(&secret.name).await {
                Ok(existing) => break existing,
                // Retrying cannot fix a bad name or a broken record.
                Err(e) if !e.is_transient() => {
                    warn!(
                        session = %id,
                        %flow,
                        secret = %secret.name,
                        error = %e,
                        "secret cannot be read"
                    );
                    break None;
                }
                Err(e) => {
                    if !self.back_off(id, flow, &e, &mut failures).await {
                        channel.close().await.ok();
                        return Ok(GetOutcome::StoreUnavailable);
                    }
                }
            }
        };

        match existing.as_ref().and_then(|record| release(record, &secret.path)) {
            Some(payload) => {
                info!(session = %id, %flow, secret = %secret.name, "releasing passphrase");
                self.finish(channel, &payload).await?;
                Ok(GetOutcome::Released)
            }
            None => {
                warn!(session = %id, %flow, secret = %secret.name, "no passphrase stored");
                let payload = Payload::no_secret(identity.as_str(), &matched.partition_label);
                self.finish(channel, &payload).await?;
                Ok(GetOutcome::SecretMissing)
            }
        }
    }

    /// Serves one `postPass` connection. Each cycle re-attests and accepts
    /// at most one submission; existing secrets are never replaced.
    pub async fn post_pass(
        &self,
        id: Uuid,
        headers: &SessionHeaders,
        channel: &mut dyn FrameChannel,
    ) -> Result<PostOutcome> {
        let flow = Flow::Post;
        let mut failures = 0;
        let mut cycles = 0usize;
        let mut stored = 0usize;

        loop {
            let records = match self.list(id, flow, &mut failures).await {
                Listing::Records(records) => records,
                Listing::Retry => continue,
                Listing::GiveUp => {
                    channel.close().await.ok();
                    return Ok(PostOutcome::StoreUnavailable);
                }
            };

            let identity = match self.attestor.verify(&headers.token, channel).await {
                Ok(identity) => identity,
                Err(e) if cycles > 0 && e.is_closed() => {
                    return Ok(PostOutcome::Finished { stored })
                }
                Err(e) => return Err(e.into()),
            };
            cycles += 1;
            info!(session = %id, %flow, identity = %identity, "attestation succeeded");

            let Some(matched) = self.lookup(id, flow, &identity, headers, &records) else {
                channel.close().await.ok();
                return Ok(PostOutcome::NoMatch);
            };
            if matched.quarantined {
                warn!(
                    session = %id,
                    %flow,
                    volume = %matched.volume_name,
                    "ignoring submission for quarantined volume"
                );
                channel.close().await.ok();
                return Ok(PostOutcome::Quarantined);
            }

            let frame = match channel.recv_frame().await {
                Ok(frame) => frame,
                Err(ChannelError::Closed) => return Ok(PostOutcome::Finished { stored }),
                Err(e) => return Err(e.into()),
            };
            let submission = match serde_json::from_slice::<Payload>(&frame) {
                Ok(p) if p.has_passphrase() && !p.has_error() => p,
                Ok(_) => {
                    warn!(session = %id, %flow, "submission carries no passphrase, ignoring");
                    continue;
                }
                Err(e) => {
                    warn!(session = %id, %flow, error = %e, "malformed submission, ignoring");
                    continue;
                }
            };

            let secret = matched.secret_ref();
            let passphrase = submission.passphrase.as_deref().unwrap_or_default();
            match self
                .materializer
                .create_if_absent(&secret, passphrase, submission.generated_by.as_deref())
                .await
            {
                Ok(CreateOutcome::Created(_)) => {
                    info!(
                        session = %id,
                        %flow,
                        secret = %secret.name,
                        "stored submitted passphrase"
                    );
                    stored += 1;
                }
                Ok(CreateOutcome::AlreadyExisted(_)) => {
                    info!(
                        session = %id,
                        %flow,
                        secret = %secret.name,
                        "secret already exists, discarding submission"
                    );
                }
                Err(e) if !e.is_transient() => {
                    warn!(
                        session = %id,
                        %flow,
                        secret = %secret.name,
                        error = %e,
                        "secret cannot be stored, discarding submission"
                    );
                }
                Err(e) => {
                    if !self.back_off(id, flow, &e, &mut failures).await {
                        channel.close().await.ok();
                        return Ok(PostOutcome::StoreUnavailable);
                    }
                }
            }
        }
    }
}

fn release(record: &SecretRecord, path: &str) -> Option<Payload> {
    let passphrase = record.get(path).filter(|p| !p.is_empty())?;
    let generated_by = record
        .get(GENERATED_BY_KEY)
        .filter(|g| !g.is_empty())
        .map(str::to_owned);
    Some(Payload::passphrase(passphrase, generated_by))
}
