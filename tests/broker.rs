use eyre::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tpm_keyserver::attest::{EkDigestAttestor, EkDigestProver};
use tpm_keyserver::client::{Broker, ClientError, Resolver, ResolverConfig, WsBroker};
use tpm_keyserver::payload::{Payload, TPM_GENERATED};
use tpm_keyserver::server::{self, Server, ServerConfig};
use tpm_keyserver::session::RetryPolicy;
use tpm_keyserver::store::file::FileStore;
use tpm_keyserver::store::memory::MemoryStore;
use tpm_keyserver::store::RecordStore;
use tpm_keyserver::volume::{PartitionDescriptor, PartitionRule, VolumeRecord};

const NAMESPACE: &str = "default";

struct Running {
    url: String,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<server::Result<()>>,
}

impl Running {
    async fn stop(self) -> Result<()> {
        self.shutdown.send(()).ok();
        tokio::time::timeout(Duration::from_secs(5), self.task).await???;
        Ok(())
    }
}

async fn start(store: Arc<dyn RecordStore>) -> Result<Running> {
    let config = ServerConfig {
        listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        namespace: NAMESPACE.into(),
        retry: RetryPolicy {
            backoff: Duration::from_millis(10),
            max_transient: 3,
        },
        grace: Duration::from_secs(1),
        ..Default::default()
    };
    let listener = TcpListener::bind(config.listen).await?;
    let url = format!("http://{}", listener.local_addr()?);
    let (shutdown, signal) = oneshot::channel::<()>();
    let server = Server::new(config, store, Arc::new(EkDigestAttestor));
    let task = tokio::spawn(server.serve(listener, async move {
        signal.await.ok();
    }));
    Ok(Running {
        url,
        shutdown,
        task,
    })
}

fn machine(ek: &[u8]) -> WsBroker<EkDigestProver> {
    WsBroker::new(EkDigestProver::new(ek.to_vec()))
}

fn volume(ek: &[u8], quarantined: bool) -> VolumeRecord {
    VolumeRecord {
        name: "vol1".into(),
        hardware_hash: EkDigestProver::new(ek.to_vec()).identity().to_string(),
        quarantined,
        partitions: vec![PartitionRule {
            label: "ROOT".into(),
            ..Default::default()
        }],
    }
}

fn root() -> PartitionDescriptor {
    PartitionDescriptor {
        label: "ROOT".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn submitted_passphrase_is_released() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.add_volume(NAMESPACE, volume(b"ek-a", false));
    let server = start(store.clone()).await?;
    let broker = machine(b"ek-a");

    let missing = broker.get_pass(&server.url, &root()).await.unwrap_err();
    assert!(matches!(missing, ClientError::PassphraseNotFound));

    let submission = Payload::passphrase("correct horse", Some(TPM_GENERATED.into()));
    broker.post_pass(&server.url, &root(), &submission).await?;

    let pass = broker.get_pass(&server.url, &root()).await?;
    assert_eq!(pass.value.as_str(), "correct horse");
    assert_eq!(pass.generated_by.as_deref(), Some(TPM_GENERATED));

    let stored = store.secret(NAMESPACE, "vol1-root").expect("secret created");
    assert_eq!(stored.get("passphrase"), Some("correct horse"));

    server.stop().await
}

#[tokio::test]
async fn quarantined_volume_is_refused() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.add_volume(NAMESPACE, volume(b"ek-q", true));
    let server = start(store.clone()).await?;
    let broker = machine(b"ek-q");

    let err = broker.get_pass(&server.url, &root()).await.unwrap_err();
    assert_eq!(err.to_string(), "quarantined: ROOT");
    assert!(!err.is_retryable());

    // the broker may hang up before the submission is even read
    broker
        .post_pass(&server.url, &root(), &Payload::passphrase("nope", None))
        .await
        .ok();
    assert_eq!(store.secret_count(NAMESPACE), 0);
    assert_eq!(store.secret_writes(), 0);

    server.stop().await
}

#[tokio::test]
async fn unknown_machine_is_named() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.add_volume(NAMESPACE, volume(b"ek-known", false));
    let server = start(store).await?;
    let broker = machine(b"ek-stranger");
    let identity = EkDigestProver::new(b"ek-stranger".to_vec()).identity();

    let err = broker.get_pass(&server.url, &root()).await.unwrap_err();
    assert_eq!(err.to_string(), format!("Invalid hash: {identity}"));

    server.stop().await
}

#[tokio::test]
async fn resolver_gives_up_without_broker() -> Result<()> {
    let config = ResolverConfig {
        attempts: 3,
        backoff: Duration::ZERO,
        generate_on_miss: true,
    };
    let resolver = Resolver::new(machine(b"ek-a"), None::<String>, config);
    let err = resolver.wait_pass(&root()).await.unwrap_err();
    assert!(matches!(err, ClientError::NoServer));
    Ok(())
}

#[tokio::test]
async fn resolver_generates_and_reuses() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.add_volume(NAMESPACE, volume(b"ek-gen", false));
    let server = start(store.clone()).await?;
    let config = ResolverConfig {
        attempts: 2,
        backoff: Duration::from_millis(10),
        generate_on_miss: true,
    };

    let resolver = Resolver::new(machine(b"ek-gen"), Some(server.url.clone()), config);
    let first = resolver.wait_pass(&root()).await?;
    let second = resolver.wait_pass(&root()).await?;
    assert_eq!(first.value, second.value);
    assert_eq!(store.secret_count(NAMESPACE), 1);

    let stored = store.secret(NAMESPACE, "vol1-root").expect("secret created");
    assert_eq!(stored.get("generated_by"), Some(TPM_GENERATED));

    server.stop().await
}

#[tokio::test]
async fn concurrent_submissions_keep_first_value() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let volumes = dir.path().join(NAMESPACE).join("volumes");
    std::fs::create_dir_all(&volumes)?;
    std::fs::write(
        volumes.join("vol1.yaml"),
        serde_yaml::to_string(&volume(b"ek-race", false))?,
    )?;
    let store = Arc::new(FileStore::new(dir.path()));
    let server = start(store).await?;

    let submissions = (0..8).map(|i| {
        let url = server.url.clone();
        tokio::spawn(async move {
            machine(b"ek-race")
                .post_pass(&url, &root(), &Payload::passphrase(format!("pass-{i}"), None))
                .await
        })
    });
    for submission in futures::future::join_all(submissions).await {
        submission??;
    }

    let secrets = std::fs::read_dir(dir.path().join(NAMESPACE).join("secrets"))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "yaml"))
        .count();
    assert_eq!(secrets, 1);

    let a = machine(b"ek-race").get_pass(&server.url, &root()).await?;
    let b = machine(b"ek-race").get_pass(&server.url, &root()).await?;
    assert!(a.value.starts_with("pass-"));
    assert_eq!(a.value, b.value);

    server.stop().await
}

#[tokio::test]
async fn shutdown_stops_accepting() -> Result<()> {
    let server = start(Arc::new(MemoryStore::new())).await?;
    let url = server.url.clone();
    server.stop().await?;

    let err = machine(b"ek-a").get_pass(&url, &root()).await.unwrap_err();
    assert!(err.is_retryable());
    Ok(())
}
