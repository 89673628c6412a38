//! Demo agent: an in-memory key-value store, the datasync broker, and two
//! small plugins wired through the dependency discoverer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use vnf_agent::AgentBuilder;
use vnf_agent::AgentConfig;
use vnf_agent::Aggregate;
use vnf_agent::ChangeEvent;
use vnf_agent::KvBroker;
use vnf_agent::MemKvClient;
use vnf_agent::NamedMapping;
use vnf_agent::Plugin;
use vnf_agent::PluginHandle;
use vnf_agent::PostInitPlugin;
use vnf_agent::ResyncEvent;
use vnf_agent::ResyncOrchestrator;
use vnf_agent::Result;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let config = AgentConfig::load(None)?;

    // Initializing Logs
    let _guard = init_observability();

    // Initializing external close channel
    let (_close_tx, close_rx) = watch::channel(());

    // Assemble the plugin set
    let kv = Arc::new(MemKvClient::new());
    let orchestrator = Arc::new(ResyncOrchestrator::new(&config.datasync));
    let broker = Arc::new(KvBroker::new(
        kv,
        orchestrator.clone(),
        config.datasync.clone(),
    ));

    let watcher = DemoWatcher::new(broker.clone());
    let publisher = DemoPublisher::new(broker.clone());

    let aggregate = Aggregate::new("demo-agent")
        .with(PluginHandle::plain(orchestrator.clone()))
        .with(PluginHandle::plain(Arc::new(watcher)).named("watcher"))
        .with(PluginHandle::with_post_init(Arc::new(publisher)).named("publisher"))
        .into_handle();

    let agent = AgentBuilder::new(config, close_rx)
        .aggregate(aggregate)
        .orchestrator(orchestrator)
        .build()?
        .ready()?;

    info!("Application started. Waiting for CTRL+C signal...");
    agent.run().await?;

    println!("Exiting program.");
    Ok(())
}

fn init_observability() -> WorkerGuard {
    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());
    let base_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(base_subscriber).init();

    guard
}

/// Subscribes to `/demo/` keys and mirrors them into a named mapping.
struct DemoWatcher {
    broker: Arc<KvBroker>,
    mirror: Arc<NamedMapping<Vec<u8>>>,
}

impl DemoWatcher {
    fn new(broker: Arc<KvBroker>) -> Self {
        Self {
            broker,
            mirror: Arc::new(NamedMapping::new("demo-keys")),
        }
    }
}

#[async_trait]
impl Plugin for DemoWatcher {
    fn name(&self) -> &str {
        "demo-watcher"
    }

    async fn init(&self) -> Result<()> {
        let (change_tx, change_rx) = mpsc::channel(self.broker.change_sink_capacity());
        let (resync_tx, resync_rx) = mpsc::channel(4);
        self.broker.watch(
            "demo-watcher",
            change_tx,
            resync_tx,
            vec!["/demo/".to_string()],
        )?;
        tokio::spawn(consume(self.mirror.clone(), change_rx, resync_rx));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn dependencies(&self) -> Vec<PluginHandle> {
        vec![PluginHandle::with_post_init(self.broker.clone())]
    }
}

async fn consume(
    mirror: Arc<NamedMapping<Vec<u8>>>,
    mut change_rx: mpsc::Receiver<ChangeEvent>,
    mut resync_rx: mpsc::Receiver<ResyncEvent>,
) {
    loop {
        tokio::select! {
            change = change_rx.recv() => {
                let Some(event) = change else { break };
                info!(
                    key = %event.key,
                    kind = ?event.kind,
                    revision = event.revision,
                    "change delivered"
                );
                match &event.value {
                    Some(value) => mirror.put(&event.key, value.clone()),
                    None => {
                        mirror.delete(&event.key);
                    }
                }
                event.done.done();
            },
            resync = resync_rx.recv() => {
                let Some(event) = resync else { break };
                for (prefix, pairs) in event.data {
                    let mut count = 0;
                    for pair in pairs {
                        mirror.put(&pair.key, pair.value);
                        count += 1;
                    }
                    info!(prefix = %prefix, "resync delivered {} pair(s)", count);
                }
                event.done.done();
            },
        }
    }
}

/// Publishes a handful of `/demo/` keys once every peer finished `init`.
struct DemoPublisher {
    broker: Arc<KvBroker>,
}

impl DemoPublisher {
    fn new(broker: Arc<KvBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Plugin for DemoPublisher {
    fn name(&self) -> &str {
        "demo-publisher"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn dependencies(&self) -> Vec<PluginHandle> {
        vec![PluginHandle::with_post_init(self.broker.clone())]
    }
}

#[async_trait]
impl PostInitPlugin for DemoPublisher {
    async fn after_init(&self) -> Result<()> {
        for index in 0..3 {
            let key = format!("/demo/message-{}", index);
            self.broker
                .put(&key, format!("payload-{}", index).into_bytes())
                .await?;
        }
        Ok(())
    }
}
