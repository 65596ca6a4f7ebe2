use super::{Broker, ClientError, Passphrase, Result, ServerSource};
use crate::config::ClientConfig;
use crate::payload::{Payload, TPM_GENERATED};
use crate::seal::{local_pass, random_passphrase, SealStore};
use crate::volume::PartitionDescriptor;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolverConfig {
    pub attempts: u32,
    pub backoff: Duration,
    pub generate_on_miss: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ClientConfig::default().into()
    }
}

impl From<&ClientConfig> for ResolverConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            attempts: config.attempts,
            backoff: config.backoff(),
            generate_on_miss: config.generate_on_miss,
        }
    }
}

impl From<ClientConfig> for ResolverConfig {
    fn from(config: ClientConfig) -> Self {
        (&config).into()
    }
}

/// Obtains the passphrase for one partition, retrying until the broker
/// answers or the attempts run out.
pub struct Resolver<B, S> {
    broker: B,
    servers: S,
    config: ResolverConfig,
    local: Option<Box<dyn SealStore + Send>>,
}

impl<B: Broker, S: ServerSource> Resolver<B, S> {
    pub fn new(broker: B, servers: S, config: ResolverConfig) -> Self {
        Self {
            broker,
            servers,
            config,
            local: None,
        }
    }

    /// Falls back to `store` when no server is configured.
    pub fn with_local(mut self, store: Box<dyn SealStore + Send>) -> Self {
        self.local = Some(store);
        self
    }

    pub async fn resolve(&mut self, partition: &PartitionDescriptor) -> Result<Passphrase> {
        if self.servers.server().is_none() {
            if let Some(store) = self.local.as_deref_mut() {
                info!(label = %partition.label, "no server configured, using sealed passphrase");
                return Ok(Passphrase {
                    value: local_pass(store)?,
                    generated_by: Some(TPM_GENERATED.to_owned()),
                });
            }
        }
        self.wait_pass(partition).await
    }

    pub async fn wait_pass(&self, partition: &PartitionDescriptor) -> Result<Passphrase> {
        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.fetch(partition).await {
                Ok(pass) => return Ok(pass),
                Err(e) if !e.is_retryable() || attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "failed getting passphrase, retrying");
                }
            }
            attempt += 1;
            tokio::time::sleep(self.config.backoff).await;
        }
    }

    async fn fetch(&self, partition: &PartitionDescriptor) -> Result<Passphrase> {
        let server = self.servers.server().ok_or(ClientError::NoServer)?;
        match self.broker.get_pass(&server, partition).await {
            Err(ClientError::PassphraseNotFound) if self.config.generate_on_miss => {
                debug!(label = %partition.label, "no passphrase stored, submitting a new one");
                let generated = random_passphrase();
                let payload = Payload::passphrase(
                    generated.as_str(),
                    Some(TPM_GENERATED.to_owned()),
                );
                self.broker.post_pass(&server, partition, &payload).await?;
                // Another boot may have won the race; the broker keeps the first.
                self.broker.get_pass(&server, partition).await
            }
            other => other,
        }
    }
}
