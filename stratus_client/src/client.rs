//! The client: wiring between the write pipeline, the read coordinators,
//! and the service refresher.

use std::sync::Arc;
use std::time::Duration;

use data_types::{
    DataPoint, GetDataRequest, Key, ResultEntry, ScanShardRequest, ScanShardResult, StatusCode,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::collector::GetResult;
use crate::config::ClientConfig;
use crate::directory::Directory;
use crate::error::{ConnectError, ReadError};
use crate::metrics::ClientMetrics;
use crate::network::{Connector, LastUpdateCallback, NetworkClient};
use crate::parallel;
use crate::read::get_with_failover;
use crate::refresh::{spawn_refresher, update_read_services, ReadServiceSet};
use crate::retry::{retry_loop, RetryState};
use crate::time::TimeProvider;
use crate::write::{write_loop, WriteClient};

/// A client for one stratus deployment.
///
/// A process is either a writer
/// ([`writer_threads_per_service`](ClientConfig::writer_threads_per_service)
/// `> 0`) or a reader (`== 0`), never both. Writers own one buffered queue
/// and a set of worker tasks per write and shadow service; readers hold the
/// refreshed read-service set. Construction must happen inside a tokio
/// runtime, which the workers and the refresher are spawned onto.
#[derive(Debug)]
pub struct StratusClient {
    config: ClientConfig,
    directory: Arc<dyn Directory>,
    connector: Arc<dyn Connector>,
    metrics: Arc<ClientMetrics>,
    write_clients: Vec<Arc<WriteClient>>,
    write_max_shards: usize,
    read_services: Arc<ReadServiceSet>,
    retry: Arc<RetryState>,
    writer_tasks: Mutex<Vec<JoinHandle<()>>>,
    retry_tasks: Mutex<Vec<JoinHandle<()>>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl StratusClient {
    /// Build a client, resolving services through `directory` and connecting
    /// them through `connector`.
    ///
    /// Writer construction connects every write and shadow service up front
    /// and fails if any of them cannot be reached. Reader construction
    /// resolves the read set once and then keeps it fresh in the background.
    pub fn new(
        config: ClientConfig,
        directory: Arc<dyn Directory>,
        connector: Arc<dyn Connector>,
        registry: &metric::Registry,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Arc<Self>, ConnectError> {
        let metrics = Arc::new(ClientMetrics::new(registry));
        let retry = Arc::new(RetryState::new(
            config.retry_queue_capacity,
            time,
            &metrics,
        ));

        let mut write_clients = Vec::new();
        let mut write_max_shards = 0;
        if config.writer_threads_per_service > 0 {
            for service in directory.get_write_services() {
                let client = connector.connect(&service, false)?;
                write_clients.push(Arc::new(WriteClient::new(
                    client,
                    config.queue_capacity,
                    config.queue_capacity_size_ratio,
                    &metrics,
                )));
            }
            write_max_shards = write_clients
                .iter()
                .map(|w| w.client.num_shards())
                .max()
                .unwrap_or(0);

            for service in directory.get_shadow_services() {
                let client = connector.connect(&service, true)?;
                write_clients.push(Arc::new(WriteClient::new(
                    client,
                    config.queue_capacity,
                    config.queue_capacity_size_ratio,
                    &metrics,
                )));
            }
        }

        let client = Arc::new(Self {
            write_clients,
            write_max_shards,
            read_services: Arc::new(ReadServiceSet::new()),
            retry,
            writer_tasks: Mutex::new(vec![]),
            retry_tasks: Mutex::new(vec![]),
            refresher: Mutex::new(None),
            metrics,
            directory,
            connector,
            config,
        });

        if client.config.writer_threads_per_service > 0 {
            client.start_writer_tasks(client.config.writer_threads_per_service);
        } else {
            // Resolve the read set now; a failing directory just means no
            // services until the refresher finds some.
            update_read_services(
                &client.read_services,
                &*client.directory,
                &*client.connector,
                &client.metrics,
            );
            if let Some(interval) = client.config.read_services_update_interval {
                *client.refresher.lock() = Some(spawn_refresher(
                    Arc::clone(&client.read_services),
                    Arc::clone(&client.directory),
                    Arc::clone(&client.connector),
                    Arc::clone(&client.metrics),
                    interval,
                ));
            }
        }

        Ok(client)
    }

    /// Build a client around ready-made network clients, bypassing the
    /// directory. Intended for tests.
    ///
    /// Write workers are spawned per `writer_threads_per_service`; pass `0`
    /// to keep the queues unconsumed.
    pub fn new_with_clients(
        config: ClientConfig,
        readers: Vec<Arc<dyn NetworkClient>>,
        writers: Vec<Arc<dyn NetworkClient>>,
        directory: Arc<dyn Directory>,
        connector: Arc<dyn Connector>,
        registry: &metric::Registry,
        time: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        let metrics = Arc::new(ClientMetrics::new(registry));
        let retry = Arc::new(RetryState::new(
            config.retry_queue_capacity,
            time,
            &metrics,
        ));

        let write_clients: Vec<_> = writers
            .into_iter()
            .map(|network_client| {
                Arc::new(WriteClient::new(
                    network_client,
                    config.queue_capacity,
                    config.queue_capacity_size_ratio,
                    &metrics,
                ))
            })
            .collect();
        let write_max_shards = write_clients
            .iter()
            .map(|w| w.client.num_shards())
            .max()
            .unwrap_or(0);

        let read_services = Arc::new(ReadServiceSet::new());
        read_services.install(readers);

        let client = Arc::new(Self {
            write_clients,
            write_max_shards,
            read_services,
            retry,
            writer_tasks: Mutex::new(vec![]),
            retry_tasks: Mutex::new(vec![]),
            refresher: Mutex::new(None),
            metrics,
            directory,
            connector,
            config,
        });

        if client.config.writer_threads_per_service > 0 && !client.write_clients.is_empty() {
            client.start_writer_tasks(client.config.writer_threads_per_service);
        }

        client
    }

    /// Buffer `points` for every write and shadow service.
    ///
    /// Returns `true` when at least one service accepted the batch. Never
    /// blocks: a full queue drops the batch for that service and records it.
    pub fn put(&self, points: Vec<DataPoint>) -> bool {
        let count = points.len();
        if count == 0 {
            error!("empty put request");
            return true;
        }

        let mut any_accepted = false;
        let last = self.write_clients.len().saturating_sub(1);
        let mut points = points;

        for (i, write_client) in self.write_clients.iter().enumerate() {
            // The last push gets to move the batch.
            let batch = if i < last {
                points.clone()
            } else {
                std::mem::take(&mut points)
            };

            let accepted = write_client.queue.push(batch);
            if accepted {
                write_client.metrics.enqueued.inc(count as u64);
                any_accepted = true;
            } else {
                write_client.metrics.enqueue_dropped.inc(count as u64);
            }
            write_client
                .metrics
                .queue_size
                .set(write_client.queue.size() as u64);
        }

        any_accepted
    }

    /// Read `request`, one service at a time with failover, returning
    /// `(key, entry)` pairs in completion order.
    pub async fn get(
        &self,
        request: &GetDataRequest,
        service_override: Option<&str>,
    ) -> Result<Vec<(Key, ResultEntry)>, ReadError> {
        let clients = self.read_client_snapshot(service_override)?;
        get_with_failover(&clients, request, self.config.strict_reads, &self.metrics).await
    }

    /// Read `request` from every service in parallel, finalizing as soon as
    /// one full copy of the data exists (plus a grace window), and merge the
    /// best copies. Entries come back in request key order.
    pub async fn future_get(
        &self,
        request: &GetDataRequest,
        service_override: Option<&str>,
    ) -> Result<GetResult, ReadError> {
        let clients = self.read_client_snapshot(service_override)?;
        parallel::future_get(
            &clients,
            request,
            self.config.strict_reads,
            self.config.compare_reads,
        )
        .await
    }

    /// Scan one shard on the first read service.
    pub async fn scan_shard(&self, request: ScanShardRequest) -> ScanShardResult {
        let Some(client) = self.read_services.first() else {
            error!("no read clients available");
            return ScanShardResult::status_only(StatusCode::RpcFail);
        };
        let Some(host) = client.host_for_shard(request.shard_id) else {
            return ScanShardResult::status_only(StatusCode::RpcFail);
        };
        client.perform_scan_shard(&host, request).await
    }

    /// Scan one shard, fanning out to every read service when
    /// [`parallel_scan_shard`](ClientConfig::parallel_scan_shard) is set.
    pub async fn future_scan_shard(
        &self,
        request: ScanShardRequest,
        service_override: Option<&str>,
    ) -> Result<ScanShardResult, ReadError> {
        let mut clients = self.read_client_snapshot(service_override)?;
        if !self.config.parallel_scan_shard {
            clients.truncate(1);
        }
        parallel::future_scan_shard(&clients, request, self.config.strict_reads).await
    }

    /// Stream last-update times from the first read service into `callback`.
    pub async fn get_last_update_times(
        &self,
        min_last_update_time: i64,
        max_keys_per_request: usize,
        timeout: Duration,
        callback: LastUpdateCallback,
    ) {
        let Some(client) = self.read_services.first() else {
            error!("no read clients available");
            return;
        };
        client
            .get_last_update_times(min_last_update_time, max_keys_per_request, timeout, callback)
            .await;
    }

    /// Drain the write queues: every point accepted so far is attempted
    /// before this returns, then fresh workers take over.
    pub async fn flush_queue(&self) {
        let per_service = {
            let tasks = self.writer_tasks.lock();
            if self.write_clients.is_empty() {
                0
            } else {
                tasks.len() / self.write_clients.len()
            }
        };
        self.stop_writer_tasks().await;
        self.start_writer_tasks(per_service);
    }

    /// Stop the write pipeline (draining the queues) and the refresher.
    pub async fn shutdown(&self) {
        self.stop_writer_tasks().await;
        if let Some(task) = self.refresher.lock().take() {
            task.abort();
        }
    }

    /// Abort in-flight reads on the first read service.
    pub fn stop_requests(&self) {
        let Some(client) = self.read_services.first() else {
            return;
        };
        client.stop_requests();
    }

    /// The highest shard count across the services this client talks to.
    pub fn max_num_shards(&self) -> usize {
        if self.write_clients.is_empty() {
            self.read_services.max_num_shards()
        } else {
            self.write_max_shards
        }
    }

    /// The shard count reported by the first write service.
    pub fn num_shards_from_write_client(&self) -> usize {
        self.write_clients
            .first()
            .map(|w| w.client.num_shards())
            .unwrap_or(0)
    }

    /// Data points currently waiting in the retry queue or being retried.
    pub fn retry_pending_points(&self) -> usize {
        self.retry.pending_points()
    }

    fn start_writer_tasks(&self, per_service: usize) {
        if per_service == 0 || self.write_clients.is_empty() {
            return;
        }

        let mut tasks = self.writer_tasks.lock();
        for write_client in &self.write_clients {
            for _ in 0..per_service {
                tasks.push(tokio::spawn(write_loop(
                    Arc::clone(write_client),
                    Arc::clone(&self.retry),
                    self.config.clone(),
                )));
            }
        }
        drop(tasks);

        let mut retry_tasks = self.retry_tasks.lock();
        for _ in 0..self.config.retry_thread_count {
            retry_tasks.push(tokio::spawn(retry_loop(
                Arc::clone(&self.retry),
                Arc::clone(&self.metrics),
            )));
        }
    }

    /// Post one shutdown sentinel per worker and wait for all of them.
    async fn stop_writer_tasks(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.writer_tasks.lock());
        if !tasks.is_empty() {
            let per_service = tasks.len() / self.write_clients.len();
            for write_client in &self.write_clients {
                write_client.queue.flush(per_service);
            }
        }
        for task in tasks {
            if let Err(error) = task.await {
                if !error.is_cancelled() {
                    error!(%error, "write worker task failed");
                }
            }
        }

        let retry_tasks: Vec<_> = std::mem::take(&mut *self.retry_tasks.lock());
        if !retry_tasks.is_empty() {
            self.retry.post_shutdown_sentinels(retry_tasks.len());
            info!(workers = retry_tasks.len(), "stopping retry workers");
        }
        for task in retry_tasks {
            if let Err(error) = task.await {
                if !error.is_cancelled() {
                    error!(%error, "retry worker task failed");
                }
            }
        }
    }

    /// Snapshot the read clients, resolving a `service_override` by an
    /// explicit find.
    ///
    /// An override missing from the set but valid per the directory gets a
    /// temporary client that is never installed into the shared set; an
    /// invalid override is counted and the full snapshot is used.
    fn read_client_snapshot(
        &self,
        service_override: Option<&str>,
    ) -> Result<Vec<Arc<dyn NetworkClient>>, ReadError> {
        let clients = self.read_services.snapshot();

        let Some(name) = service_override else {
            return Ok(clients);
        };

        if let Some(client) = clients.iter().find(|c| c.service_name() == name) {
            return Ok(vec![Arc::clone(client)]);
        }

        if !self.directory.is_valid_read_service(name) {
            self.metrics.bad_read_services.inc(1);
            return Ok(clients);
        }

        let client = self.connector.connect(name, false)?;
        Ok(vec![client])
    }
}

impl Drop for StratusClient {
    fn drop(&mut self) {
        // Best effort: a client dropped without `shutdown` must not leak
        // tasks.
        for task in self.writer_tasks.lock().drain(..) {
            task.abort();
        }
        for task in self.retry_tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(task) = self.refresher.lock().take() {
            task.abort();
        }
    }
}
