use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bfr_cluster::{ClusterSettings, LocalNetwork, Node, NodeInfo};
use bfr_storage::MemRecordStore;

pub type TestNode = Node<MemRecordStore, LocalNetwork>;

pub const WAIT: Duration = Duration::from_secs(5);

/// Honors RUST_LOG; quiet by default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short timeouts so failure detection happens within a test run.
pub fn fast_settings() -> ClusterSettings {
    ClusterSettings {
        request_timeout_ms: 500,
        retry_backoff_ms: 10,
        listener_timeout_ms: 500,
        heartbeat_interval_ms: 50,
        max_missed_heartbeats: 3,
        resync_timeout_ms: 2_000,
        status_poll_interval_ms: 20,
        ..ClusterSettings::default()
    }
}

/// Several nodes sharing one in-process network. Stores outlive node
/// restarts.
pub struct TestCluster {
    pub net: Arc<LocalNetwork>,
    pub settings: ClusterSettings,
    stores: HashMap<String, Arc<MemRecordStore>>,
}

impl TestCluster {
    pub fn new(settings: ClusterSettings) -> Self {
        init_tracing();
        TestCluster {
            net: LocalNetwork::new(),
            settings,
            stores: HashMap::new(),
        }
    }

    /// Start `id`, joining through `seeds`. A node that ran before gets its
    /// old store back.
    pub async fn start(&mut self, id: &str, seeds: &[&str]) -> TestNode {
        let store = self
            .stores
            .entry(id.to_string())
            .or_default()
            .clone();
        let inbox = self.net.register(id);
        let seeds: Vec<String> = seeds.iter().map(|s| s.to_string()).collect();
        Node::start(
            NodeInfo::new(id, format!("mem://{id}")),
            self.settings.clone(),
            store,
            self.net.clone(),
            inbox,
            &seeds,
        )
        .await
        .unwrap()
    }

    /// Start `ids` in order, each seeded with the first.
    pub async fn start_all(&mut self, ids: &[&str]) -> Vec<TestNode> {
        let mut nodes = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let seeds: Vec<&str> = if i == 0 { vec![] } else { vec![ids[0]] };
            nodes.push(self.start(id, &seeds).await);
        }
        nodes
    }
}

/// Poll `check` until it holds or `WAIT` elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
