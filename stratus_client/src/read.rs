//! The sequential read path: one service at a time, with one in-service
//! retry after a shard-cache invalidation, then failover to the next
//! service.

use std::collections::HashSet;
use std::sync::Arc;

use data_types::{GetDataRequest, GetDataResult, Key, ResultEntry, StatusCode};
use hashbrown::HashMap;
use tracing::{error, info};

use crate::error::ReadError;
use crate::metrics::ClientMetrics;
use crate::network::{GetRequestMap, NetworkClient};

/// Which not-yet-final statuses a round collects for a later service instead
/// of consuming in place.
///
/// On the last service there is nowhere left to fail over to, so partial
/// shards that returned any data are accepted as successes; strict mode
/// keeps collecting in-progress shards so the call can fail instead.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PartialPolicy {
    pub collect_in_progress: bool,
    pub collect_missing_data: bool,
}

/// Issue `request` against one service and classify every key of the
/// response.
///
/// Successes append to `result`/`found_keys` (kept in lock step), transient
/// failures to `failed_keys`, deferred partial shards to `partial_keys`.
/// Missing keys are dropped and never retried anywhere.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn get_with_client(
    client: &dyn NetworkClient,
    request: &GetDataRequest,
    policy: PartialPolicy,
    result: &mut GetDataResult,
    found_keys: &mut Vec<Key>,
    failed_keys: &mut Vec<Key>,
    partial_keys: &mut Vec<Key>,
    metrics: &ClientMetrics,
) {
    // Break the key set up into one subrequest per owning host.
    let mut requests = GetRequestMap::default();
    for key in &request.keys {
        client.add_key_to_get_request(key, &mut requests);
    }
    for sub in requests.values_mut() {
        sub.begin = request.begin;
        sub.end = request.end;
    }

    let responses = client.perform_get(requests).await;

    for response in responses {
        let requested = response.request.keys.len();
        let returned = response.result.results.len();
        if requested != returned {
            // Fewer results than keys is a server bug; the unanswered tail is
            // not retried.
            error!(requested, returned, "mismatch between request keys and result size");
        }

        for (key, entry) in response
            .request
            .keys
            .iter()
            .zip(response.result.results)
        {
            match entry.status {
                StatusCode::Ok => {
                    result.results.push(entry);
                    found_keys.push(key.clone());
                }
                StatusCode::KeyMissing => {}
                StatusCode::RpcFail | StatusCode::StorageFail | StatusCode::DontOwnShard => {
                    failed_keys.push(key.clone());
                }
                StatusCode::ShardInProgress => {
                    if policy.collect_in_progress {
                        partial_keys.push(key.clone());
                    } else if !entry.data.is_empty() {
                        result.results.push(entry);
                        found_keys.push(key.clone());
                    }
                }
                StatusCode::MissingTooMuchData => {
                    metrics.redirect_for_missing_data.inc(1);
                    if policy.collect_missing_data {
                        info!(key = %key, "data gaps recorded, will redirect to another service");
                        partial_keys.push(key.clone());
                    } else {
                        info!(
                            key = %key,
                            has_data = !entry.data.is_empty(),
                            "data gaps recorded, no service left to redirect to"
                        );
                        if !entry.data.is_empty() {
                            result.results.push(entry);
                            found_keys.push(key.clone());
                        }
                    }
                }
                StatusCode::BucketNotFinalized => {
                    // Protocol violation; there is no safe way to continue.
                    error!("BUCKET_NOT_FINALIZED observed in a read response");
                    std::process::abort();
                }
            }
        }
    }
}

/// Read `request` from the first service that can serve it, failing over
/// down `read_clients` and retrying once within each service after
/// invalidating the shard cache for failed keys.
///
/// Returns `(key, entry)` pairs in completion order; a key the storage does
/// not have is simply absent. In strict mode residual transient failures on
/// the last service fail the whole call.
pub(crate) async fn get_with_failover(
    read_clients: &[Arc<dyn NetworkClient>],
    request: &GetDataRequest,
    strict: bool,
    metrics: &ClientMetrics,
) -> Result<Vec<(Key, ResultEntry)>, ReadError> {
    if read_clients.is_empty() {
        return Err(ReadError::NoReadServices);
    }

    // The routing layer may rewrite shard ids from its cache; capture the
    // caller's ids so every service starts from the same routing hint.
    let original_shards: HashMap<String, i64> = request
        .keys
        .iter()
        .map(|key| (key.name.clone(), key.shard_id))
        .collect();

    let mut client_request = request.clone();
    let mut found_keys = Vec::new();
    let mut result = GetDataResult::default();
    let last_index = read_clients.len() - 1;

    for (i, client) in read_clients.iter().enumerate() {
        if i > 0 {
            metrics.read_failover.inc(1);
            info!(
                service = client.service_name(),
                "retrying read on failover service"
            );
        }

        let last = i == last_index;
        let policy = PartialPolicy {
            collect_in_progress: strict || !last,
            collect_missing_data: !last,
        };

        let mut failed_keys = Vec::new();
        let mut partial_keys = Vec::new();
        get_with_client(
            &**client,
            &client_request,
            policy,
            &mut result,
            &mut found_keys,
            &mut failed_keys,
            &mut partial_keys,
            metrics,
        )
        .await;

        if failed_keys.is_empty() && partial_keys.is_empty() {
            break;
        }

        // One retry within the service: drop the cached owners of the failed
        // shards and ask again. In-progress shards are excluded: their data
        // lives on another service, not behind a stale cache entry.
        if !failed_keys.is_empty() {
            let shard_ids: HashSet<i64> = failed_keys.iter().map(|key| key.shard_id).collect();
            client.invalidate_cache(&shard_ids);

            client_request.keys = std::mem::take(&mut failed_keys);
            get_with_client(
                &**client,
                &client_request,
                policy,
                &mut result,
                &mut found_keys,
                &mut failed_keys,
                &mut partial_keys,
                metrics,
            )
            .await;
        }

        if failed_keys.is_empty() && partial_keys.is_empty() {
            break;
        }

        if last && strict {
            return Err(ReadError::Exhausted);
        }

        // Hand the residuals to the next service, restoring the caller's
        // shard ids.
        client_request.keys = failed_keys;
        client_request.keys.extend(partial_keys);
        for key in &mut client_request.keys {
            if let Some(&shard_id) = original_shards.get(&key.name) {
                key.shard_id = shard_id;
            }
        }
    }

    Ok(found_keys.into_iter().zip(result.results).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::network::mock::MockNetworkClient;

    use assert_matches::assert_matches;
    use data_types::EncodedBlock;
    use metric::Attributes;

    fn entry(status: StatusCode) -> ResultEntry {
        ResultEntry::status_only(status)
    }

    fn entry_with_data(status: StatusCode) -> ResultEntry {
        ResultEntry {
            status,
            data: vec![EncodedBlock {
                count: 1,
                data: vec![1],
            }],
        }
    }

    fn result_of(entries: Vec<ResultEntry>) -> GetDataResult {
        GetDataResult { results: entries }
    }

    fn clients(
        mocks: &[&Arc<MockNetworkClient>],
    ) -> Vec<Arc<dyn NetworkClient>> {
        mocks
            .iter()
            .map(|m| Arc::new(Arc::clone(m)) as Arc<dyn NetworkClient>)
            .collect()
    }

    struct Fixture {
        registry: metric::Registry,
        metrics: ClientMetrics,
    }

    fn fixture() -> Fixture {
        let registry = metric::Registry::new();
        let metrics = ClientMetrics::new(&registry);
        Fixture { registry, metrics }
    }

    fn global_counter(registry: &metric::Registry, name: &'static str) -> u64 {
        registry
            .get_instrument::<metric::U64Counter>(name)
            .and_then(|m| m.get_observer(&Attributes::default(), |o| o.fetch()))
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn failover_after_in_service_retry() {
        let fixture = fixture();

        // Service A fails k1 twice (initial + post-invalidation retry);
        // service B answers with data.
        let a = Arc::new(MockNetworkClient::new("svc-a").with_get_results([
            result_of(vec![entry(StatusCode::RpcFail)]),
            result_of(vec![entry(StatusCode::RpcFail)]),
        ]));
        let b = Arc::new(MockNetworkClient::new("svc-b"));

        let request = GetDataRequest::new(0, 120, vec![Key::new("k1", 3)]);
        let got = get_with_failover(&clients(&[&a, &b]), &request, false, &fixture.metrics)
            .await
            .unwrap();

        // A was retried once with its cache invalidated for k1's shard.
        assert_eq!(a.invalidations(), vec![vec![3]]);
        assert_eq!(a.get_calls().len(), 2);

        // B served the key.
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0.name, "k1");
        assert_eq!(got[0].1.status, StatusCode::Ok);
        assert_eq!(
            global_counter(&fixture.registry, crate::metrics::READ_FAILOVER),
            1
        );
    }

    #[tokio::test]
    async fn missing_keys_are_never_re_requested() {
        let fixture = fixture();

        // k1 fails (retried), k2 is missing (dropped for good).
        let a = Arc::new(MockNetworkClient::new("svc-a").with_get_results([
            result_of(vec![entry(StatusCode::RpcFail), entry(StatusCode::KeyMissing)]),
            result_of(vec![entry(StatusCode::RpcFail)]),
        ]));
        let b = Arc::new(MockNetworkClient::new("svc-b"));

        let request = GetDataRequest::new(
            0,
            120,
            vec![Key::new("k1", 1), Key::new("k2", 2)],
        );
        let got = get_with_failover(&clients(&[&a, &b]), &request, false, &fixture.metrics)
            .await
            .unwrap();

        // B only ever saw k1.
        let b_calls = b.get_calls();
        assert_eq!(b_calls.len(), 1);
        let b_keys: Vec<_> = b_calls[0].keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(b_keys, vec!["k1"]);

        // And k2 is absent from the merged result.
        assert!(got.iter().all(|(key, _)| key.name != "k2"));
    }

    #[tokio::test]
    async fn partial_shards_skip_the_in_service_retry() {
        let fixture = fixture();

        let a = Arc::new(MockNetworkClient::new("svc-a").with_get_results([result_of(vec![
            entry_with_data(StatusCode::ShardInProgress),
        ])]));
        let b = Arc::new(MockNetworkClient::new("svc-b"));

        let request = GetDataRequest::new(0, 120, vec![Key::new("k1", 5)]);
        let got = get_with_failover(&clients(&[&a, &b]), &request, false, &fixture.metrics)
            .await
            .unwrap();

        // No cache invalidation for in-progress shards; straight to B.
        assert!(a.invalidations().is_empty());
        assert_eq!(a.get_calls().len(), 1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1.status, StatusCode::Ok);
    }

    #[tokio::test]
    async fn last_service_accepts_partial_data() {
        let fixture = fixture();

        let a = Arc::new(MockNetworkClient::new("svc-a").with_get_results([result_of(vec![
            entry_with_data(StatusCode::ShardInProgress),
        ])]));

        let request = GetDataRequest::new(0, 120, vec![Key::new("k1", 5)]);
        let got = get_with_failover(&clients(&[&a]), &request, false, &fixture.metrics)
            .await
            .unwrap();

        // Only service, non-strict: the partial copy counts as a success and
        // keeps its status.
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1.status, StatusCode::ShardInProgress);
        assert!(!got[0].1.data.is_empty());
    }

    #[tokio::test]
    async fn empty_partial_data_on_last_service_is_dropped() {
        let fixture = fixture();

        let a = Arc::new(MockNetworkClient::new("svc-a")
            .with_get_results([result_of(vec![entry(StatusCode::ShardInProgress)])]));

        let request = GetDataRequest::new(0, 120, vec![Key::new("k1", 5)]);
        let got = get_with_failover(&clients(&[&a]), &request, false, &fixture.metrics)
            .await
            .unwrap();

        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn strict_mode_fails_when_transients_survive_the_last_service() {
        let fixture = fixture();

        let a = Arc::new(MockNetworkClient::new("svc-a").with_get_results([
            result_of(vec![entry(StatusCode::StorageFail)]),
            result_of(vec![entry(StatusCode::StorageFail)]),
        ]));

        let request = GetDataRequest::new(0, 120, vec![Key::new("k1", 5)]);
        let got = get_with_failover(&clients(&[&a]), &request, true, &fixture.metrics).await;

        assert_matches!(got, Err(ReadError::Exhausted));
    }

    #[tokio::test]
    async fn shard_ids_are_restored_between_services() {
        let fixture = fixture();

        // A's shard cache rewrites k1 onto shard 99, then fails it.
        let a = Arc::new(
            MockNetworkClient::new("svc-a")
                .with_cached_shard("k1", 99)
                .with_get_results([
                    result_of(vec![entry(StatusCode::DontOwnShard)]),
                    result_of(vec![entry(StatusCode::DontOwnShard)]),
                ]),
        );
        let b = Arc::new(MockNetworkClient::new("svc-b"));

        let request = GetDataRequest::new(0, 120, vec![Key::new("k1", 3)]);
        get_with_failover(&clients(&[&a, &b]), &request, false, &fixture.metrics)
            .await
            .unwrap();

        // The in-service retry used A's cached id; B starts from the
        // caller's original id.
        assert_eq!(a.invalidations(), vec![vec![99]]);
        assert_eq!(b.get_calls()[0].keys[0].shard_id, 3);
    }

    #[tokio::test]
    async fn no_read_clients_is_an_error() {
        let fixture = fixture();
        let request = GetDataRequest::new(0, 120, vec![Key::new("k1", 3)]);
        let got = get_with_failover(&[], &request, false, &fixture.metrics).await;
        assert_matches!(got, Err(ReadError::NoReadServices));
    }

    #[tokio::test]
    async fn redirect_metric_counts_missing_data_statuses() {
        let fixture = fixture();

        let a = Arc::new(MockNetworkClient::new("svc-a").with_get_results([result_of(vec![
            entry_with_data(StatusCode::MissingTooMuchData),
        ])]));
        let b = Arc::new(MockNetworkClient::new("svc-b"));

        let request = GetDataRequest::new(0, 120, vec![Key::new("k1", 5)]);
        get_with_failover(&clients(&[&a, &b]), &request, false, &fixture.metrics)
            .await
            .unwrap();

        assert_eq!(
            global_counter(&fixture.registry, crate::metrics::REDIRECT_FOR_MISSING_DATA),
            1
        );
    }
}
