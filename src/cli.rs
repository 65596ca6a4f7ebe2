use crate::attest::{EkDigestAttestor, EkDigestProver};
use crate::channel::Timeouts;
use crate::client::{Resolver, ResolverConfig, WsBroker};
use crate::config::{ClientConfig, ConfigSources, CMDLINE, CONFIG_FILE, SERVER_ENV};
use crate::plugin;
use crate::server::{Server, ServerConfig};
use crate::session::RetryPolicy;
use crate::store::file::FileStore;
use clap::{Args, Parser, Subcommand};
use eyre::{Result, WrapErr};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

#[cfg(feature = "tpm")]
use crate::tpm::pcr::parse_pcr_selection_list;
#[cfg(feature = "tpm")]
use tss_esapi::structures::PcrSelectionList;

const TPM_ENV_VAR: &str = "TCTI";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TPM device specified in TCTI format, e.g. `device:/dev/tpmrm0`
    #[arg(short = 'T', long, env = TPM_ENV_VAR, global = true)]
    tcti: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the passphrase broker
    Serve(ServeArgs),
    /// Answer a boot time discovery event read from stdin
    Discovery {
        /// Event name, e.g. `discovery.password`
        #[arg(value_name = "event")]
        event: String,
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Print the hardware identity this machine presents to the broker
    Pubhash {
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Show PCR digest for current running system
    #[cfg(feature = "tpm")]
    Digest {
        /// PCRs to digest
        #[arg(short, long, value_name = "PCR List", default_value = crate::config::DEFAULT_PCRS, value_parser = parse_pcr_selection_list)]
        pcrs: PcrSelectionList,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8082", env = "KEYSERVER_LISTEN")]
    listen: SocketAddr,

    /// Namespace holding volume records and secrets
    #[arg(short, long, default_value = "default", env = "KEYSERVER_NAMESPACE")]
    namespace: String,

    /// Root directory of the record store
    #[arg(short, long, default_value = "/var/lib/keyserver", env = "KEYSERVER_STORE")]
    store: PathBuf,

    /// Seconds to wait for a client frame
    #[arg(long, default_value_t = 10, env = "KEYSERVER_READ_TIMEOUT")]
    read_timeout: u64,

    /// Seconds to wait for a frame to be written
    #[arg(long, default_value_t = 10, env = "KEYSERVER_WRITE_TIMEOUT")]
    write_timeout: u64,

    /// Seconds in-flight sessions may run after shutdown is requested
    #[arg(long, default_value_t = 30, env = "KEYSERVER_GRACE")]
    grace: u64,

    /// Milliseconds between attempts to list volume records
    #[arg(long, default_value_t = 1000, env = "KEYSERVER_LIST_RETRY_BACKOFF")]
    list_retry_backoff: u64,

    /// Consecutive store failures tolerated before a session is closed
    #[arg(long, default_value_t = 10, env = "KEYSERVER_MAX_TRANSIENT_RETRIES")]
    max_transient_retries: u32,
}

impl ServeArgs {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            namespace: self.namespace.clone(),
            timeouts: Timeouts {
                read: Duration::from_secs(self.read_timeout),
                write: Duration::from_secs(self.write_timeout),
            },
            retry: RetryPolicy {
                backoff: Duration::from_millis(self.list_retry_backoff),
                max_transient: self.max_transient_retries,
            },
            grace: Duration::from_secs(self.grace),
            ..Default::default()
        }
    }
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Client configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Kernel command line to read `keyserver.*` settings from
    #[arg(long, default_value = CMDLINE)]
    cmdline: PathBuf,

    /// Read the endorsement public area from a file instead of the TPM
    #[arg(long, value_name = "FILE")]
    ek_public: Option<PathBuf>,
}

impl ClientArgs {
    fn sources(&self) -> ConfigSources {
        ConfigSources {
            file: Some(self.config.clone()),
            cmdline: self.cmdline.clone(),
            server_env: SERVER_ENV.into(),
        }
    }

    fn load(&self) -> ClientConfig {
        self.sources().load().unwrap_or_else(|e| {
            warn!(error = %e, "falling back to default client configuration");
            ClientConfig::default()
        })
    }

    fn prover(&self, config: &ClientConfig) -> Result<EkDigestProver> {
        if let Some(path) = &self.ek_public {
            return read_ek_public(path);
        }
        hardware_prover(config)
    }
}

fn read_ek_public(path: &Path) -> Result<EkDigestProver> {
    let ek = std::fs::read(path)
        .wrap_err_with(|| format!("failed to read endorsement key from {}", path.display()))?;
    Ok(EkDigestProver::new(ek))
}

#[cfg(feature = "tpm")]
fn hardware_prover(config: &ClientConfig) -> Result<EkDigestProver> {
    if env::var_os(TPM_ENV_VAR).is_none() {
        env::set_var(TPM_ENV_VAR, format!("device:{}", config.tpm_device));
    }
    Ok(crate::tpm::endorsement_prover()?)
}

#[cfg(not(feature = "tpm"))]
fn hardware_prover(_: &ClientConfig) -> Result<EkDigestProver> {
    Err(eyre::eyre!(
        "built without TPM support, pass --ek-public to name the endorsement key"
    ))
}

#[cfg(feature = "tpm")]
fn local_store(config: &ClientConfig) -> Result<Option<Box<dyn crate::seal::SealStore + Send>>> {
    if !config.offline_fallback {
        return Ok(None);
    }
    let store = crate::tpm::TpmSealStore::new(config.seal_handle()?, &config.pcrs)?;
    Ok(Some(Box::new(store)))
}

#[cfg(not(feature = "tpm"))]
fn local_store(config: &ClientConfig) -> Result<Option<Box<dyn crate::seal::SealStore + Send>>> {
    if config.offline_fallback {
        warn!("offline fallback requested but built without TPM support");
    }
    Ok(None)
}

async fn shutdown_signal() {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "failed to register signal handlers, using ctrl-c only");
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

impl Cli {
    pub fn new() -> Self {
        let cli = Cli::parse();
        if let Some(tcti) = &cli.tcti {
            env::set_var(TPM_ENV_VAR, tcti);
        }
        cli
    }

    pub async fn run(&self) -> Result<&Self> {
        match &self.command {
            Commands::Serve(args) => self.serve(args).await?,
            Commands::Discovery { event, client } => self.discovery(event, client).await?,
            Commands::Pubhash { client } => self.show_pubhash(client)?,
            #[cfg(feature = "tpm")]
            Commands::Digest { pcrs } => self.show_pcr_digest(pcrs)?,
        };
        Ok(self)
    }

    async fn serve(&self, args: &ServeArgs) -> Result<()> {
        let store = Arc::new(FileStore::new(&args.store));
        Server::new(args.config(), store, Arc::new(EkDigestAttestor))
            .run(shutdown_signal())
            .await?;
        Ok(())
    }

    async fn discovery(&self, event: &str, args: &ClientArgs) -> Result<()> {
        let config = args.load();
        let prover = match args.prover(&config) {
            Ok(prover) => prover,
            Err(e) => {
                let response =
                    plugin::EventResponse::error(format!("failed getting passphrase: {e}"));
                plugin::write_response(tokio::io::stdout(), &response).await?;
                return Err(e);
            }
        };
        let mut resolver = Resolver::new(
            WsBroker::new(prover),
            args.sources(),
            ResolverConfig::from(&config),
        );
        if let Some(store) = local_store(&config)? {
            resolver = resolver.with_local(store);
        }
        plugin::run(event, tokio::io::stdin(), tokio::io::stdout(), &mut resolver).await?;
        Ok(())
    }

    fn show_pubhash(&self, args: &ClientArgs) -> Result<()> {
        println!("{}", args.prover(&args.load())?.identity());
        Ok(())
    }

    #[cfg(feature = "tpm")]
    fn show_pcr_digest(&self, pcrs: &PcrSelectionList) -> Result<()> {
        let digest = crate::tpm::get_pcr_digest(pcrs)?;
        println!("Current PCR Digest: {}", hex::encode(digest.value()));
        Ok(())
    }
}
