//! The network-client collaborator: one handle per service, owning the
//! shard→host cache, key-to-request batching, and the per-host RPCs.
//!
//! The real implementation wraps the RPC transport and the directory's
//! shard map; this crate only depends on the contract below and ships a
//! scriptable [`mock`] for tests.

use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::time::Duration;

use async_trait::async_trait;
use data_types::{
    DataPoint, GetDataRequest, GetDataResult, Key, KeyUpdateTime, ScanShardRequest,
    ScanShardResult,
};
use hashbrown::HashMap;

use crate::error::ConnectError;

/// A storage host within a service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostInfo {
    /// Host name or address.
    pub name: String,
    /// RPC port.
    pub port: u16,
}

impl HostInfo {
    /// Create a host handle.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// Data points grouped by destination host, ready for `perform_put`.
pub type PutRequestMap = HashMap<HostInfo, Vec<DataPoint>>;

/// Keys grouped by destination host for the sequential read path.
pub type GetRequestMap = HashMap<HostInfo, GetDataRequest>;

/// A per-host subrequest plus the positions its keys occupy in the
/// originating request, for the parallel read path.
#[derive(Debug, Clone, Default)]
pub struct IndexedGetRequest {
    /// The keys routed to this host.
    pub request: GetDataRequest,
    /// `indices[i]` is the position of `request.keys[i]` in the original
    /// request's key list.
    pub indices: Vec<usize>,
}

/// Keys grouped by destination host with original-request indices attached.
pub type MultiGetRequestMap = HashMap<HostInfo, IndexedGetRequest>;

/// One host's answer within a sequential read round.
#[derive(Debug, Clone)]
pub struct HostResponse {
    /// The subrequest as sent.
    pub request: GetDataRequest,
    /// The host's response, entries in subrequest key order.
    pub result: GetDataResult,
}

/// The outcome of offering one data point to a put request under
/// construction.
#[derive(Debug, Clone, Copy)]
pub struct PointPlacement {
    /// Whether the request can take more points. `false` ends the current
    /// drain.
    pub accept_more: bool,
    /// Whether the point was dropped instead of placed (unknown shard, batch
    /// limit, encoding failure) and should be routed to the retry queue.
    pub dropped: bool,
}

/// Callback consuming chunks of last-update times; return `false` to stop.
pub type LastUpdateCallback = Box<dyn FnMut(Vec<KeyUpdateTime>) -> bool + Send>;

/// A per-service handle performing shard routing and RPCs.
#[async_trait]
pub trait NetworkClient: Send + Sync + Debug + 'static {
    /// The service this client talks to.
    fn service_name(&self) -> &str;

    /// Whether this client feeds a shadow (write-only) service.
    fn is_shadow(&self) -> bool;

    /// The fixed per-RPC deadline.
    fn rpc_timeout(&self) -> Duration;

    /// Number of shards the service is configured with.
    fn num_shards(&self) -> usize;

    /// Route `key` through the shard cache and append it to the subrequest
    /// for its owning host. The cached shard id may override the key's.
    fn add_key_to_get_request(&self, key: &Key, requests: &mut GetRequestMap);

    /// As [`add_key_to_get_request`](Self::add_key_to_get_request), recording
    /// the key's position `index` in the originating request.
    fn add_indexed_key_to_get_request(
        &self,
        index: usize,
        key: &Key,
        requests: &mut MultiGetRequestMap,
    );

    /// Offer one data point to the put request under construction.
    fn add_data_point_to_request(
        &self,
        point: &DataPoint,
        requests: &mut PutRequestMap,
    ) -> PointPlacement;

    /// Issue every subrequest in `requests`, in parallel, waiting for all.
    async fn perform_get(&self, requests: GetRequestMap) -> Vec<HostResponse>;

    /// Issue one subrequest to one host.
    async fn perform_get_host(&self, host: &HostInfo, request: GetDataRequest) -> GetDataResult;

    /// Send the grouped points, returning the points the servers dropped.
    async fn perform_put(&self, requests: PutRequestMap) -> Vec<DataPoint>;

    /// The host currently owning `shard_id`, if the cache knows one.
    fn host_for_shard(&self, shard_id: i64) -> Option<HostInfo>;

    /// Scan a whole shard on `host`.
    async fn perform_scan_shard(&self, host: &HostInfo, request: ScanShardRequest)
        -> ScanShardResult;

    /// Stream last-update times for keys written since `min_last_update_time`
    /// into `callback`, at most `max_keys_per_request` per chunk.
    async fn get_last_update_times(
        &self,
        min_last_update_time: i64,
        max_keys_per_request: usize,
        timeout: Duration,
        callback: LastUpdateCallback,
    );

    /// Drop the cached owners of `shard_ids` so the next request re-resolves
    /// them through the directory.
    fn invalidate_cache(&self, shard_ids: &HashSet<i64>);

    /// Abort in-flight requests; subsequent calls fail fast.
    fn stop_requests(&self);
}

/// Builds [`NetworkClient`] handles for named services.
pub trait Connector: Send + Sync + Debug {
    /// Connect a client to `service`.
    fn connect(
        &self,
        service: &str,
        shadow: bool,
    ) -> Result<std::sync::Arc<dyn NetworkClient>, ConnectError>;
}

/// Mocks for testing.
pub mod mock {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Arc;

    use data_types::{EncodedBlock, ResultEntry, StatusCode};
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct State {
        shard_owner: HashMap<i64, HostInfo>,
        cache_override: HashMap<String, i64>,
        get_ret: VecDeque<GetDataResult>,
        scan_ret: VecDeque<ScanShardResult>,
        put_ret: VecDeque<Vec<DataPoint>>,
        get_calls: Vec<GetDataRequest>,
        put_calls: Vec<PutRequestMap>,
        scan_calls: Vec<ScanShardRequest>,
        invalidations: Vec<Vec<i64>>,
        drop_keys: HashSet<String>,
        request_capacity: usize,
        get_delay: Option<Duration>,
        update_times: Vec<KeyUpdateTime>,
        stopped: bool,
    }

    impl Default for State {
        fn default() -> Self {
            Self {
                shard_owner: Default::default(),
                cache_override: Default::default(),
                get_ret: Default::default(),
                scan_ret: Default::default(),
                put_ret: Default::default(),
                get_calls: Default::default(),
                put_calls: Default::default(),
                scan_calls: Default::default(),
                invalidations: Default::default(),
                drop_keys: Default::default(),
                request_capacity: usize::MAX,
                get_delay: None,
                update_times: Default::default(),
                stopped: false,
            }
        }
    }

    /// A scriptable in-memory [`NetworkClient`].
    ///
    /// Unrouted shards resolve to a single default host. Scripted responses
    /// are consumed in call order; once a script runs dry every key answers
    /// `OK` with one empty block.
    #[derive(Debug)]
    pub struct MockNetworkClient {
        service: String,
        shadow: bool,
        num_shards: usize,
        timeout: Duration,
        default_host: HostInfo,
        state: Mutex<State>,
    }

    impl MockNetworkClient {
        /// Create a client for `service` with an 8-shard default layout and a
        /// 5 s RPC timeout.
        pub fn new(service: impl Into<String>) -> Self {
            let service = service.into();
            Self {
                default_host: HostInfo::new(format!("{service}-host"), 9999),
                service,
                shadow: false,
                num_shards: 8,
                timeout: Duration::from_secs(5),
                state: Default::default(),
            }
        }

        /// Mark this client as feeding a shadow service.
        pub fn shadow(mut self) -> Self {
            self.shadow = true;
            self
        }

        /// Override the number of shards reported by the service.
        pub fn with_num_shards(mut self, num_shards: usize) -> Self {
            self.num_shards = num_shards;
            self
        }

        /// Override the per-RPC timeout.
        pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }

        /// Route `shard_id` to `host` instead of the default host.
        pub fn with_shard_owner(self, shard_id: i64, host: HostInfo) -> Self {
            self.state.lock().shard_owner.insert(shard_id, host);
            self
        }

        /// Make the shard cache rewrite `key_name`'s shard id on routing.
        pub fn with_cached_shard(self, key_name: impl Into<String>, shard_id: i64) -> Self {
            self.state
                .lock()
                .cache_override
                .insert(key_name.into(), shard_id);
            self
        }

        /// Script read responses, consumed one per `perform_get` /
        /// `perform_get_host` call.
        pub fn with_get_results(self, results: impl IntoIterator<Item = GetDataResult>) -> Self {
            self.state.lock().get_ret.extend(results);
            self
        }

        /// Script scan responses.
        pub fn with_scan_results(self, results: impl IntoIterator<Item = ScanShardResult>) -> Self {
            self.state.lock().scan_ret.extend(results);
            self
        }

        /// Script the server-dropped points returned by successive
        /// `perform_put` calls.
        pub fn with_put_results(
            self,
            results: impl IntoIterator<Item = Vec<DataPoint>>,
        ) -> Self {
            self.state.lock().put_ret.extend(results);
            self
        }

        /// Make the request builder drop points for these key names.
        pub fn with_dropped_keys<S: Into<String>>(
            self,
            names: impl IntoIterator<Item = S>,
        ) -> Self {
            self.state
                .lock()
                .drop_keys
                .extend(names.into_iter().map(Into::into));
            self
        }

        /// Cap the points one put request accepts before reporting "full".
        pub fn with_request_capacity(self, capacity: usize) -> Self {
            self.state.lock().request_capacity = capacity;
            self
        }

        /// Delay every read RPC by `delay`.
        pub fn with_get_delay(self, delay: Duration) -> Self {
            self.state.lock().get_delay = Some(delay);
            self
        }

        /// Set the key update times streamed by `get_last_update_times`.
        pub fn with_update_times(self, times: impl IntoIterator<Item = KeyUpdateTime>) -> Self {
            self.state.lock().update_times.extend(times);
            self
        }

        /// The put request maps this client received.
        pub fn put_calls(&self) -> Vec<PutRequestMap> {
            self.state.lock().put_calls.clone()
        }

        /// Every data point received across all put calls, in order.
        pub fn put_points(&self) -> Vec<DataPoint> {
            self.state
                .lock()
                .put_calls
                .iter()
                .flat_map(|m| m.values().flatten().cloned())
                .collect()
        }

        /// The get subrequests this client received.
        pub fn get_calls(&self) -> Vec<GetDataRequest> {
            self.state.lock().get_calls.clone()
        }

        /// The scan requests this client received.
        pub fn scan_calls(&self) -> Vec<ScanShardRequest> {
            self.state.lock().scan_calls.clone()
        }

        /// The shard-id sets passed to `invalidate_cache`, in call order.
        pub fn invalidations(&self) -> Vec<Vec<i64>> {
            self.state.lock().invalidations.clone()
        }

        /// Whether `stop_requests` was called.
        pub fn stopped(&self) -> bool {
            self.state.lock().stopped
        }

        fn route(&self, shard_id: i64) -> HostInfo {
            self.state
                .lock()
                .shard_owner
                .get(&shard_id)
                .cloned()
                .unwrap_or_else(|| self.default_host.clone())
        }

        fn routed_key(&self, key: &Key) -> Key {
            let cached = self.state.lock().cache_override.get(&key.name).copied();
            Key::new(key.name.clone(), cached.unwrap_or(key.shard_id))
        }

        fn next_get_result(&self, request: &GetDataRequest) -> GetDataResult {
            self.state.lock().get_ret.pop_front().unwrap_or_else(|| {
                let ok = ResultEntry {
                    status: StatusCode::Ok,
                    data: vec![EncodedBlock::default()],
                };
                GetDataResult {
                    results: vec![ok; request.keys.len()],
                }
            })
        }

        async fn simulate_latency(&self) {
            let delay = self.state.lock().get_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl NetworkClient for Arc<MockNetworkClient> {
        fn service_name(&self) -> &str {
            &self.service
        }

        fn is_shadow(&self) -> bool {
            self.shadow
        }

        fn rpc_timeout(&self) -> Duration {
            self.timeout
        }

        fn num_shards(&self) -> usize {
            self.num_shards
        }

        fn add_key_to_get_request(&self, key: &Key, requests: &mut GetRequestMap) {
            let key = self.routed_key(key);
            let host = self.route(key.shard_id);
            requests.entry(host).or_default().keys.push(key);
        }

        fn add_indexed_key_to_get_request(
            &self,
            index: usize,
            key: &Key,
            requests: &mut MultiGetRequestMap,
        ) {
            let key = self.routed_key(key);
            let host = self.route(key.shard_id);
            let sub = requests.entry(host).or_default();
            sub.request.keys.push(key);
            sub.indices.push(index);
        }

        fn add_data_point_to_request(
            &self,
            point: &DataPoint,
            requests: &mut PutRequestMap,
        ) -> PointPlacement {
            let state = self.state.lock();
            if state.drop_keys.contains(&point.key.name) {
                return PointPlacement {
                    accept_more: true,
                    dropped: true,
                };
            }
            let host = state
                .shard_owner
                .get(&point.key.shard_id)
                .cloned()
                .unwrap_or_else(|| self.default_host.clone());
            drop(state);

            requests.entry(host).or_default().push(point.clone());

            let total: usize = requests.values().map(Vec::len).sum();
            PointPlacement {
                accept_more: total < self.state.lock().request_capacity,
                dropped: false,
            }
        }

        async fn perform_get(&self, requests: GetRequestMap) -> Vec<HostResponse> {
            self.simulate_latency().await;

            // Deterministic host order so scripted responses line up.
            let mut requests: Vec<_> = requests.into_iter().collect();
            requests.sort_by(|(a, _), (b, _)| a.cmp(b));

            requests
                .into_iter()
                .map(|(_, request)| {
                    let result = self.next_get_result(&request);
                    self.state.lock().get_calls.push(request.clone());
                    HostResponse { request, result }
                })
                .collect()
        }

        async fn perform_get_host(
            &self,
            _host: &HostInfo,
            request: GetDataRequest,
        ) -> GetDataResult {
            self.simulate_latency().await;
            let result = self.next_get_result(&request);
            self.state.lock().get_calls.push(request);
            result
        }

        async fn perform_put(&self, requests: PutRequestMap) -> Vec<DataPoint> {
            let mut state = self.state.lock();
            state.put_calls.push(requests);
            state.put_ret.pop_front().unwrap_or_default()
        }

        fn host_for_shard(&self, shard_id: i64) -> Option<HostInfo> {
            Some(self.route(shard_id))
        }

        async fn perform_scan_shard(
            &self,
            _host: &HostInfo,
            request: ScanShardRequest,
        ) -> ScanShardResult {
            self.simulate_latency().await;
            let mut state = self.state.lock();
            state.scan_calls.push(request);
            state
                .scan_ret
                .pop_front()
                .unwrap_or_else(|| ScanShardResult::status_only(StatusCode::Ok))
        }

        async fn get_last_update_times(
            &self,
            min_last_update_time: i64,
            max_keys_per_request: usize,
            _timeout: Duration,
            mut callback: LastUpdateCallback,
        ) {
            let times: Vec<_> = self
                .state
                .lock()
                .update_times
                .iter()
                .filter(|t| t.updated_at >= min_last_update_time)
                .cloned()
                .collect();

            for chunk in times.chunks(max_keys_per_request.max(1)) {
                if !callback(chunk.to_vec()) {
                    break;
                }
            }
        }

        fn invalidate_cache(&self, shard_ids: &HashSet<i64>) {
            let mut ids: Vec<_> = shard_ids.iter().copied().collect();
            ids.sort_unstable();
            self.state.lock().invalidations.push(ids);
        }

        fn stop_requests(&self) {
            self.state.lock().stopped = true;
        }
    }

    /// A [`Connector`] resolving service names to pre-registered mock
    /// clients.
    #[derive(Debug, Default)]
    pub struct MockConnector {
        clients: Mutex<HashMap<String, Arc<MockNetworkClient>>>,
        failing: Mutex<HashSet<String>>,
    }

    impl MockConnector {
        /// Register `client` under its service name.
        pub fn with_client(self, client: Arc<MockNetworkClient>) -> Self {
            self.clients
                .lock()
                .insert(client.service.clone(), client);
            self
        }

        /// Make connections to `service` fail.
        pub fn with_failing_service(self, service: impl Into<String>) -> Self {
            self.failing.lock().insert(service.into());
            self
        }
    }

    impl Connector for MockConnector {
        fn connect(
            &self,
            service: &str,
            _shadow: bool,
        ) -> Result<Arc<dyn NetworkClient>, ConnectError> {
            if self.failing.lock().contains(service) {
                return Err(ConnectError {
                    service: service.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            self.clients
                .lock()
                .get(service)
                .map(|c| Arc::new(Arc::clone(c)) as Arc<dyn NetworkClient>)
                .ok_or_else(|| ConnectError {
                    service: service.to_string(),
                    reason: "unknown service".to_string(),
                })
        }
    }
}
