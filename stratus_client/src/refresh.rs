//! The active read-service set and the periodic task that refreshes it.
//!
//! Readers clone the client vector out from under a reader lock, so an
//! in-flight read keeps its snapshot (and the network clients in it alive)
//! across any number of concurrent refreshes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::error;

use crate::directory::Directory;
use crate::metrics::ClientMetrics;
use crate::network::{Connector, NetworkClient};

/// The hot-swappable set of read clients.
#[derive(Debug, Default)]
pub(crate) struct ReadServiceSet {
    clients: RwLock<Vec<Arc<dyn NetworkClient>>>,
    /// Service names behind `clients`, compared against the directory to
    /// skip no-op rebuilds. Touched only by refreshes.
    current_names: Mutex<Vec<String>>,
    /// Highest shard count across the current set.
    max_num_shards: AtomicUsize,
}

impl ReadServiceSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Clone the current client vector; immutable for the caller's lifetime.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn NetworkClient>> {
        self.clients.read().clone()
    }

    /// The first read client, used for single-service operations.
    pub(crate) fn first(&self) -> Option<Arc<dyn NetworkClient>> {
        self.clients.read().first().map(Arc::clone)
    }

    pub(crate) fn max_num_shards(&self) -> usize {
        self.max_num_shards.load(Ordering::Relaxed)
    }

    /// Install `clients` directly, bypassing the directory. Test-client
    /// construction only.
    pub(crate) fn install(&self, clients: Vec<Arc<dyn NetworkClient>>) {
        let max = clients.iter().map(|c| c.num_shards()).max().unwrap_or(0);
        self.max_num_shards.store(max, Ordering::Relaxed);
        *self.clients.write() = clients;
    }
}

/// Re-resolve the read services and swap the new set in, if the directory's
/// answer changed.
pub(crate) fn update_read_services(
    set: &ReadServiceSet,
    directory: &dyn Directory,
    connector: &dyn Connector,
    metrics: &ClientMetrics,
) {
    let services = directory.get_read_services();

    // A directory hiccup returning nothing must not tear down a working set.
    if services.is_empty() || *set.current_names.lock() == services {
        return;
    }

    let clients = build_read_clients(&services, directory, connector, metrics);
    let max = clients.iter().map(|c| c.num_shards()).max().unwrap_or(0);

    *set.current_names.lock() = services;
    set.max_num_shards.store(max, Ordering::Relaxed);
    *set.clients.write() = clients;
}

/// Validate and connect every named service, falling back to the nearest
/// service when none survives.
fn build_read_clients(
    services: &[String],
    directory: &dyn Directory,
    connector: &dyn Connector,
    metrics: &ClientMetrics,
) -> Vec<Arc<dyn NetworkClient>> {
    let mut clients = Vec::with_capacity(services.len());

    for service in services {
        if !directory.is_valid_read_service(service) {
            metrics.bad_read_services.inc(1);
            continue;
        }
        match connector.connect(service, false) {
            Ok(client) => clients.push(client),
            Err(error) => {
                error!(%error, "failed to build read client");
                metrics.bad_read_services.inc(1);
            }
        }
    }

    if clients.is_empty() {
        let nearest = directory.get_nearest_read_service();
        match connector.connect(&nearest, false) {
            Ok(client) => clients.push(client),
            Err(error) => {
                error!(%error, service = %nearest, "failed to connect to nearest read service")
            }
        }
    }

    clients
}

/// Start the periodic refresher. The first refresh happens one full interval
/// after startup; initialization performs its own synchronous refresh.
pub(crate) fn spawn_refresher(
    set: Arc<ReadServiceSet>,
    directory: Arc<dyn Directory>,
    connector: Arc<dyn Connector>,
    metrics: Arc<ClientMetrics>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut tick = tokio::time::interval_at(start, interval);
        loop {
            tick.tick().await;
            update_read_services(&set, &*directory, &*connector, &metrics);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::directory::mock::MockDirectory;
    use crate::network::mock::{MockConnector, MockNetworkClient};

    use metric::Attributes;

    struct Fixture {
        registry: metric::Registry,
        metrics: ClientMetrics,
        set: ReadServiceSet,
    }

    fn fixture() -> Fixture {
        let registry = metric::Registry::new();
        let metrics = ClientMetrics::new(&registry);
        Fixture {
            registry,
            metrics,
            set: ReadServiceSet::new(),
        }
    }

    fn bad_read_services(registry: &metric::Registry) -> u64 {
        registry
            .get_instrument::<metric::U64Counter>(crate::metrics::BAD_READ_SERVICES)
            .and_then(|m| m.get_observer(&Attributes::default(), |o| o.fetch()))
            .unwrap_or(0)
    }

    fn snapshot_names(set: &ReadServiceSet) -> Vec<String> {
        set.snapshot()
            .iter()
            .map(|c| c.service_name().to_string())
            .collect()
    }

    #[test]
    fn refresh_installs_directory_services() {
        let fixture = fixture();
        let directory = MockDirectory::default().with_read_services(["east", "west"]);
        let connector = MockConnector::default()
            .with_client(Arc::new(MockNetworkClient::new("east").with_num_shards(16)))
            .with_client(Arc::new(MockNetworkClient::new("west").with_num_shards(32)));

        update_read_services(&fixture.set, &directory, &connector, &fixture.metrics);

        assert_eq!(snapshot_names(&fixture.set), vec!["east", "west"]);
        assert_eq!(fixture.set.max_num_shards(), 32);
    }

    #[test]
    fn invalid_services_are_skipped_and_counted() {
        let fixture = fixture();
        let directory = MockDirectory::default()
            .with_read_services(["east", "bogus"])
            .with_invalid_service("bogus");
        let connector = MockConnector::default()
            .with_client(Arc::new(MockNetworkClient::new("east")));

        update_read_services(&fixture.set, &directory, &connector, &fixture.metrics);

        assert_eq!(snapshot_names(&fixture.set), vec!["east"]);
        assert_eq!(bad_read_services(&fixture.registry), 1);
    }

    #[test]
    fn connect_failures_count_as_bad_services() {
        let fixture = fixture();
        let directory = MockDirectory::default()
            .with_read_services(["east", "west"]);
        let connector = MockConnector::default()
            .with_client(Arc::new(MockNetworkClient::new("east")))
            .with_failing_service("west");

        update_read_services(&fixture.set, &directory, &connector, &fixture.metrics);

        assert_eq!(snapshot_names(&fixture.set), vec!["east"]);
        assert_eq!(bad_read_services(&fixture.registry), 1);
    }

    #[test]
    fn falls_back_to_the_nearest_service() {
        let fixture = fixture();
        let directory = MockDirectory::default()
            .with_read_services(["bogus"])
            .with_invalid_service("bogus")
            .with_nearest_service("near");
        let connector = MockConnector::default()
            .with_client(Arc::new(MockNetworkClient::new("near")));

        update_read_services(&fixture.set, &directory, &connector, &fixture.metrics);

        assert_eq!(snapshot_names(&fixture.set), vec!["near"]);
    }

    #[test]
    fn unchanged_directory_answer_skips_the_rebuild() {
        let fixture = fixture();
        let directory = MockDirectory::default().with_read_services(["east"]);
        let connector =
            MockConnector::default().with_client(Arc::new(MockNetworkClient::new("east")));

        update_read_services(&fixture.set, &directory, &connector, &fixture.metrics);
        let before = fixture.set.snapshot();

        update_read_services(&fixture.set, &directory, &connector, &fixture.metrics);
        let after = fixture.set.snapshot();

        // Same handle: the set was not rebuilt.
        assert!(Arc::ptr_eq(&before[0], &after[0]));
    }

    #[test]
    fn empty_directory_answer_keeps_the_current_set() {
        let fixture = fixture();
        let directory = MockDirectory::default().with_read_services(["east"]);
        let connector =
            MockConnector::default().with_client(Arc::new(MockNetworkClient::new("east")));

        update_read_services(&fixture.set, &directory, &connector, &fixture.metrics);
        directory.set_read_services(Vec::<String>::new());
        update_read_services(&fixture.set, &directory, &connector, &fixture.metrics);

        assert_eq!(snapshot_names(&fixture.set), vec!["east"]);
    }

    #[test]
    fn snapshots_survive_a_concurrent_refresh() {
        let fixture = fixture();
        let directory = MockDirectory::default().with_read_services(["east"]);
        let connector = MockConnector::default()
            .with_client(Arc::new(MockNetworkClient::new("east")))
            .with_client(Arc::new(MockNetworkClient::new("west")));

        update_read_services(&fixture.set, &directory, &connector, &fixture.metrics);
        let snapshot = fixture.set.snapshot();

        directory.set_read_services(["west"]);
        update_read_services(&fixture.set, &directory, &connector, &fixture.metrics);

        // The reader's snapshot still points at the old set.
        assert_eq!(snapshot[0].service_name(), "east");
        assert_eq!(snapshot_names(&fixture.set), vec!["west"]);
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_task_picks_up_directory_changes() {
        let registry = metric::Registry::new();
        let metrics = Arc::new(ClientMetrics::new(&registry));
        let set = Arc::new(ReadServiceSet::new());
        let directory = Arc::new(MockDirectory::default().with_read_services(["east"]));
        let connector = Arc::new(
            MockConnector::default()
                .with_client(Arc::new(MockNetworkClient::new("east"))),
        );

        let interval = Duration::from_secs(15);
        let task = spawn_refresher(
            Arc::clone(&set),
            Arc::clone(&directory) as _,
            Arc::clone(&connector) as _,
            metrics,
            interval,
        );

        assert!(snapshot_names(&set).is_empty());
        tokio::time::sleep(interval + Duration::from_secs(1)).await;
        assert_eq!(snapshot_names(&set), vec!["east"]);

        task.abort();
    }
}
