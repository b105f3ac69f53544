//! The parallel read path: one logical read fanned out to every read
//! service at once, with partial results streamed into a collector.
//!
//! The fan-out ends on whichever comes first:
//!
//! 1. a full copy of the data exists across some combination of services,
//!    followed by a grace window of one RPC timeout for stragglers, or
//! 2. every subrequest has settled.
//!
//! Subrequests still in flight when the race resolves are abandoned; their
//! results cannot affect the returned value.

use std::sync::Arc;
use std::time::Duration;

use data_types::{GetDataRequest, ScanShardRequest, ScanShardResult};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::error;

use crate::collector::{GetResult, GetResultCollector, ScanShardResultCollector};
use crate::error::ReadError;
use crate::network::{MultiGetRequestMap, NetworkClient};

/// The `one_complete` signal: fired at most once, by whichever subrequest
/// completes the first full copy.
type CompleteSignal = Arc<Mutex<Option<oneshot::Sender<()>>>>;

fn complete_signal() -> (CompleteSignal, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    (Arc::new(Mutex::new(Some(tx))), rx)
}

fn fire(signal: &CompleteSignal) {
    if let Some(tx) = signal.lock().take() {
        // The receiver only disappears once the race is decided; a send
        // failing then is harmless.
        let _ = tx.send(());
    }
}

/// Wait out the finalize race.
///
/// Owns `tasks`: when the grace window wins, dropping the set aborts the
/// losers.
async fn await_finalize_race(
    mut tasks: JoinSet<()>,
    one_complete: oneshot::Receiver<()>,
    grace: Duration,
) {
    let one_complete_then_grace = async move {
        match one_complete.await {
            Ok(()) => tokio::time::sleep(grace).await,
            // Sender dropped without firing: no full copy will ever exist,
            // leave the race to the all-settled branch.
            Err(_) => futures::future::pending().await,
        }
    };

    let all_settled = async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                if !error.is_cancelled() {
                    error!(%error, "read subrequest task failed");
                }
            }
        }
    };

    tokio::select! {
        _ = one_complete_then_grace => {}
        _ = all_settled => {}
    }
}

/// The longest per-RPC deadline across the snapshot, used as the grace
/// window.
fn grace_window(read_clients: &[Arc<dyn NetworkClient>]) -> Duration {
    read_clients
        .iter()
        .map(|client| client.rpc_timeout())
        .max()
        .unwrap_or_default()
}

/// Fan `request` out to every service in `read_clients` and merge the
/// results.
pub(crate) async fn future_get(
    read_clients: &[Arc<dyn NetworkClient>],
    request: &GetDataRequest,
    strict: bool,
    compare_reads: bool,
) -> Result<GetResult, ReadError> {
    if read_clients.is_empty() {
        return Err(ReadError::NoReadServices);
    }

    let service_names: Vec<String> = read_clients
        .iter()
        .map(|client| client.service_name().to_string())
        .collect();

    let collector = Arc::new(GetResultCollector::new(
        request.keys.len(),
        read_clients.len(),
        request.begin,
        request.end,
        compare_reads,
    ));
    let (signal, one_complete) = complete_signal();
    let mut tasks = JoinSet::new();

    for (replica, client) in read_clients.iter().enumerate() {
        // Partition the keys by owning host, per this service's shard cache.
        let mut requests = MultiGetRequestMap::default();
        for (index, key) in request.keys.iter().enumerate() {
            client.add_indexed_key_to_get_request(index, key, &mut requests);
        }

        for (host, mut sub) in requests {
            sub.request.begin = request.begin;
            sub.request.end = request.end;

            let client = Arc::clone(client);
            let collector = Arc::clone(&collector);
            let signal = Arc::clone(&signal);
            tasks.spawn(async move {
                let result = client.perform_get_host(&host, sub.request).await;
                if collector.add(result, &sub.indices, replica) {
                    fire(&signal);
                }
            });
        }
    }

    await_finalize_race(tasks, one_complete, grace_window(read_clients)).await;

    collector.finalize(strict, &service_names)
}

/// Scan one shard on every service in `read_clients`; the first complete
/// copy wins.
///
/// The caller controls the fan-out width through the snapshot it passes;
/// a single-element slice makes this a plain remote scan.
pub(crate) async fn future_scan_shard(
    read_clients: &[Arc<dyn NetworkClient>],
    request: ScanShardRequest,
    strict: bool,
) -> Result<ScanShardResult, ReadError> {
    if read_clients.is_empty() {
        return Err(ReadError::NoReadServices);
    }

    let service_names: Vec<String> = read_clients
        .iter()
        .map(|client| client.service_name().to_string())
        .collect();

    let collector = Arc::new(ScanShardResultCollector::new(read_clients.len()));
    let (signal, one_complete) = complete_signal();
    let mut tasks = JoinSet::new();

    for (replica, client) in read_clients.iter().enumerate() {
        // Services whose cache cannot place the shard sit the scan out.
        let Some(host) = client.host_for_shard(request.shard_id) else {
            continue;
        };

        let client = Arc::clone(client);
        let collector = Arc::clone(&collector);
        let signal = Arc::clone(&signal);
        tasks.spawn(async move {
            let result = client.perform_scan_shard(&host, request).await;
            if collector.add(result, replica) {
                fire(&signal);
            }
        });
    }

    await_finalize_race(tasks, one_complete, grace_window(read_clients)).await;

    collector.finalize(strict, &service_names)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::network::mock::MockNetworkClient;

    use assert_matches::assert_matches;
    use data_types::{EncodedBlock, GetDataResult, Key, ResultEntry, StatusCode};

    fn block(tag: u8) -> EncodedBlock {
        EncodedBlock {
            count: 1,
            data: vec![tag],
        }
    }

    fn ok_result(tag: u8) -> GetDataResult {
        GetDataResult {
            results: vec![ResultEntry {
                status: StatusCode::Ok,
                data: vec![block(tag)],
            }],
        }
    }

    fn fail_result() -> GetDataResult {
        GetDataResult {
            results: vec![ResultEntry::status_only(StatusCode::RpcFail)],
        }
    }

    fn clients(mocks: &[&Arc<MockNetworkClient>]) -> Vec<Arc<dyn NetworkClient>> {
        mocks
            .iter()
            .map(|m| Arc::new(Arc::clone(m)) as Arc<dyn NetworkClient>)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn early_finalize_ignores_slow_services() {
        let timeout = Duration::from_millis(100);

        // Service A is slow, B answers immediately, C effectively never
        // does. The call must resolve one grace window after B's full copy,
        // with B's data, without waiting for A or C.
        let a = Arc::new(
            MockNetworkClient::new("svc-a")
                .with_rpc_timeout(timeout)
                .with_get_delay(Duration::from_secs(1))
                .with_get_results([ok_result(1)]),
        );
        let b = Arc::new(
            MockNetworkClient::new("svc-b")
                .with_rpc_timeout(timeout)
                .with_get_results([ok_result(2)]),
        );
        let c = Arc::new(
            MockNetworkClient::new("svc-c")
                .with_rpc_timeout(timeout)
                .with_get_delay(Duration::from_secs(1_000))
                .with_get_results([ok_result(3)]),
        );

        let request = GetDataRequest::new(0, 120, vec![Key::new("k1", 1)]);
        let started = tokio::time::Instant::now();
        let result = future_get(&clients(&[&a, &b, &c]), &request, false, false)
            .await
            .unwrap();

        // Resolved within the grace window, far before A's 1 s.
        assert!(started.elapsed() <= Duration::from_millis(200));
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].data, vec![block(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn straggler_arriving_within_grace_takes_merge_precedence() {
        let timeout = Duration::from_millis(100);

        // A (declared first) answers 10 ms after B's full copy, inside the
        // grace window, so the merge prefers it.
        let a = Arc::new(
            MockNetworkClient::new("svc-a")
                .with_rpc_timeout(timeout)
                .with_get_delay(Duration::from_millis(10))
                .with_get_results([ok_result(1)]),
        );
        let b = Arc::new(
            MockNetworkClient::new("svc-b")
                .with_rpc_timeout(timeout)
                .with_get_results([ok_result(2)]),
        );

        let request = GetDataRequest::new(0, 120, vec![Key::new("k1", 1)]);
        let result = future_get(&clients(&[&a, &b]), &request, false, false)
            .await
            .unwrap();

        assert_eq!(result.entries[0].data, vec![block(1)]);
    }

    #[tokio::test]
    async fn all_settled_resolves_without_a_full_copy() {
        let a = Arc::new(MockNetworkClient::new("svc-a").with_get_results([fail_result()]));
        let b = Arc::new(MockNetworkClient::new("svc-b").with_get_results([fail_result()]));

        let request = GetDataRequest::new(0, 120, vec![Key::new("k1", 1)]);

        let result = future_get(&clients(&[&a, &b]), &request, false, false)
            .await
            .unwrap();
        assert_eq!(result.entries[0].status, StatusCode::RpcFail);

        // Strict mode turns the residual failure into an error.
        let a = Arc::new(MockNetworkClient::new("svc-a").with_get_results([fail_result()]));
        let strict = future_get(&clients(&[&a]), &request, true, false).await;
        assert_matches!(strict, Err(ReadError::Exhausted));
    }

    #[tokio::test]
    async fn scan_takes_first_complete_copy() {
        let shard_result = ScanShardResult {
            status: StatusCode::Ok,
            keys: vec!["k1".to_string()],
            data: vec![vec![block(1)]],
        };
        let a = Arc::new(
            MockNetworkClient::new("svc-a")
                .with_scan_results([ScanShardResult::status_only(StatusCode::ShardInProgress)]),
        );
        let b = Arc::new(MockNetworkClient::new("svc-b").with_scan_results([shard_result.clone()]));

        let request = ScanShardRequest {
            shard_id: 4,
            begin: 0,
            end: 120,
        };
        let result = future_scan_shard(&clients(&[&a, &b]), request, false)
            .await
            .unwrap();

        assert_eq!(result, shard_result);
    }

    #[tokio::test]
    async fn empty_snapshot_is_an_error() {
        let request = GetDataRequest::new(0, 120, vec![Key::new("k1", 1)]);
        assert_matches!(
            future_get(&[], &request, false, false).await,
            Err(ReadError::NoReadServices)
        );
    }
}
