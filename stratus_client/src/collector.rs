//! Accumulators merging partial read results from several services.
//!
//! A collector is shared by every subrequest task of one parallel read. All
//! state sits behind one internal mutex; callers must not hold other locks
//! while calling in. [`GetResultCollector::add`] reports, exactly once,
//! the moment a full copy of the requested data exists across any
//! combination of services, which is what arms the early-finalize timer.

use data_types::{EncodedBlock, GetDataResult, ScanShardResult, StatusCode};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::error::ReadError;

/// The merged outcome of a parallel read, entries in request key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetResult {
    /// `entries[i]` answers the i-th key of the originating request.
    pub entries: Vec<KeyReadResult>,
}

/// One key's merged outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyReadResult {
    /// The status of the copy that was chosen for this key.
    pub status: StatusCode,
    /// Encoded blocks from the chosen service, oldest first.
    pub data: Vec<EncodedBlock>,
}

#[derive(Debug, Clone)]
enum Slot {
    /// No response for this key from this service yet.
    Empty,
    /// A complete copy.
    Data(Vec<EncodedBlock>),
    /// An incomplete copy (shard loading, or recorded gaps).
    Partial(StatusCode, Vec<EncodedBlock>),
    /// The service does not have the key.
    Missing,
    /// A transient failure.
    Failed(StatusCode),
}

#[derive(Debug)]
struct GetState {
    /// `slots[key][replica]`.
    slots: Vec<Vec<Slot>>,
    /// Per key: has any replica delivered a complete copy.
    has_data: Vec<bool>,
    keys_with_data: usize,
    complete_signaled: bool,
}

/// Per-key × per-service result accumulator for the parallel read path.
#[derive(Debug)]
pub(crate) struct GetResultCollector {
    begin: i64,
    end: i64,
    compare_reads: bool,
    state: Mutex<GetState>,
}

impl GetResultCollector {
    pub(crate) fn new(
        n_keys: usize,
        n_replicas: usize,
        begin: i64,
        end: i64,
        compare_reads: bool,
    ) -> Self {
        Self {
            begin,
            end,
            compare_reads,
            state: Mutex::new(GetState {
                slots: vec![vec![Slot::Empty; n_replicas]; n_keys],
                has_data: vec![false; n_keys],
                keys_with_data: 0,
                complete_signaled: false,
            }),
        }
    }

    /// Record one subrequest's response from service `replica`.
    ///
    /// `indices[i]` names the original-request position of `result.results[i]`.
    /// Returns `true` the first time every key has a complete copy somewhere.
    pub(crate) fn add(&self, result: GetDataResult, indices: &[usize], replica: usize) -> bool {
        let mut state = self.state.lock();

        if result.results.len() != indices.len() {
            error!(
                results = result.results.len(),
                requested = indices.len(),
                "mismatch between requested keys and result size"
            );
        }

        for (entry, &key_index) in result.results.into_iter().zip(indices) {
            if key_index >= state.slots.len() {
                error!(key_index, "result for a key index outside the request");
                continue;
            }
            if replica >= state.slots[key_index].len() {
                error!(replica, "result from an unknown service index");
                continue;
            }

            let slot = match entry.status {
                StatusCode::Ok => {
                    if !state.has_data[key_index] {
                        state.has_data[key_index] = true;
                        state.keys_with_data += 1;
                    }
                    Slot::Data(entry.data)
                }
                StatusCode::KeyMissing => Slot::Missing,
                StatusCode::ShardInProgress | StatusCode::MissingTooMuchData => {
                    Slot::Partial(entry.status, entry.data)
                }
                StatusCode::RpcFail | StatusCode::StorageFail | StatusCode::DontOwnShard => {
                    Slot::Failed(entry.status)
                }
                StatusCode::BucketNotFinalized => {
                    // Protocol violation: servers never emit this on the read
                    // path. There is no safe way to continue.
                    error!("BUCKET_NOT_FINALIZED observed in a read response");
                    std::process::abort();
                }
            };
            state.slots[key_index][replica] = slot;
        }

        if !state.complete_signaled && state.keys_with_data == state.slots.len() {
            state.complete_signaled = true;
            return true;
        }
        false
    }

    /// Merge the best available copy per key, in service declaration order.
    ///
    /// In strict mode a key with only transient outcomes fails the call.
    pub(crate) fn finalize(
        &self,
        strict: bool,
        service_names: &[String],
    ) -> Result<GetResult, ReadError> {
        let state = self.state.lock();

        let mut entries = Vec::with_capacity(state.slots.len());
        for (key_index, slots) in state.slots.iter().enumerate() {
            let mut chosen: Option<KeyReadResult> = None;
            let mut fallback: Option<KeyReadResult> = None;
            let mut missing = false;
            let mut failed: Option<StatusCode> = None;

            for slot in slots {
                match slot {
                    Slot::Data(data) => {
                        chosen = Some(KeyReadResult {
                            status: StatusCode::Ok,
                            data: data.clone(),
                        });
                        break;
                    }
                    Slot::Partial(status, data) if !data.is_empty() => {
                        if fallback.is_none() {
                            fallback = Some(KeyReadResult {
                                status: *status,
                                data: data.clone(),
                            });
                        }
                    }
                    Slot::Partial(status, _) => {
                        if failed.is_none() {
                            failed = Some(*status);
                        }
                    }
                    Slot::Missing => missing = true,
                    Slot::Failed(status) => {
                        if failed.is_none() {
                            failed = Some(*status);
                        }
                    }
                    Slot::Empty => {}
                }
            }

            if self.compare_reads {
                self.compare_copies(key_index, slots, service_names);
            }

            let entry = if let Some(entry) = chosen {
                entry
            } else if let Some(entry) = fallback {
                if strict {
                    // Strict mode demands a full copy per key.
                    return Err(ReadError::Exhausted);
                }
                entry
            } else if missing && failed.is_none() {
                KeyReadResult {
                    status: StatusCode::KeyMissing,
                    data: vec![],
                }
            } else {
                if strict {
                    return Err(ReadError::Exhausted);
                }
                KeyReadResult {
                    // An abandoned subrequest leaves empty slots; report
                    // those like an RPC failure.
                    status: failed.unwrap_or(StatusCode::RpcFail),
                    data: vec![],
                }
            };
            entries.push(entry);
        }

        Ok(GetResult { entries })
    }

    /// Log keys whose complete copies disagree between services.
    fn compare_copies(&self, key_index: usize, slots: &[Slot], service_names: &[String]) {
        let copies: Vec<(usize, &Vec<EncodedBlock>)> = slots
            .iter()
            .enumerate()
            .filter_map(|(replica, slot)| match slot {
                Slot::Data(data) => Some((replica, data)),
                _ => None,
            })
            .collect();

        for window in copies.windows(2) {
            let (first_replica, first) = window[0];
            let (second_replica, second) = window[1];
            if first != second {
                let unknown = "?".to_string();
                warn!(
                    key_index,
                    begin = self.begin,
                    end = self.end,
                    first_service =
                        %service_names.get(first_replica).unwrap_or(&unknown),
                    second_service =
                        %service_names.get(second_replica).unwrap_or(&unknown),
                    "services returned different copies of a key"
                );
            }
        }
    }
}

#[derive(Debug)]
struct ScanState {
    slots: Vec<Option<ScanShardResult>>,
    complete_signaled: bool,
}

/// Per-service result accumulator for whole-shard scans.
#[derive(Debug)]
pub(crate) struct ScanShardResultCollector {
    state: Mutex<ScanState>,
}

impl ScanShardResultCollector {
    pub(crate) fn new(n_replicas: usize) -> Self {
        Self {
            state: Mutex::new(ScanState {
                slots: vec![None; n_replicas],
                complete_signaled: false,
            }),
        }
    }

    /// Record service `replica`'s scan result; `true` the first time a
    /// complete (OK) copy arrives.
    pub(crate) fn add(&self, result: ScanShardResult, replica: usize) -> bool {
        let mut state = self.state.lock();

        if result.status == StatusCode::BucketNotFinalized {
            error!("BUCKET_NOT_FINALIZED observed in a scan response");
            std::process::abort();
        }

        let complete = result.status == StatusCode::Ok;
        if replica >= state.slots.len() {
            error!(replica, "scan result from an unknown service index");
            return false;
        }
        state.slots[replica] = Some(result);

        if complete && !state.complete_signaled {
            state.complete_signaled = true;
            return true;
        }
        false
    }

    /// Return the first OK copy in service declaration order, or the best
    /// residual outcome.
    pub(crate) fn finalize(
        &self,
        strict: bool,
        _service_names: &[String],
    ) -> Result<ScanShardResult, ReadError> {
        let mut state = self.state.lock();

        if let Some(ok) = state
            .slots
            .iter_mut()
            .find(|slot| matches!(slot, Some(r) if r.status == StatusCode::Ok))
        {
            return Ok(ok.take().expect("matched a filled slot"));
        }

        if strict {
            return Err(ReadError::Exhausted);
        }

        Ok(state
            .slots
            .iter_mut()
            .find_map(Option::take)
            .unwrap_or_else(|| ScanShardResult::status_only(StatusCode::RpcFail)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use data_types::ResultEntry;

    fn block(tag: u8) -> EncodedBlock {
        EncodedBlock {
            count: 1,
            data: vec![tag],
        }
    }

    fn ok_entry(tag: u8) -> ResultEntry {
        ResultEntry {
            status: StatusCode::Ok,
            data: vec![block(tag)],
        }
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("svc{i}")).collect()
    }

    #[test]
    fn full_copy_signaled_exactly_once() {
        let collector = GetResultCollector::new(2, 2, 0, 100, false);

        // Key 0 from replica 0: not complete yet.
        let partial = GetDataResult {
            results: vec![ok_entry(1)],
        };
        assert!(!collector.add(partial, &[0], 0));

        // Key 1 from replica 1: completes the set.
        let rest = GetDataResult {
            results: vec![ok_entry(2)],
        };
        assert!(collector.add(rest, &[1], 1));

        // Further additions never re-signal.
        let again = GetDataResult {
            results: vec![ok_entry(3)],
        };
        assert!(!collector.add(again, &[0], 1));
    }

    #[test]
    fn finalize_prefers_earlier_services() {
        let collector = GetResultCollector::new(1, 2, 0, 100, false);

        // Replica 1 answers first; replica 0's copy must still win the merge.
        assert!(collector.add(
            GetDataResult {
                results: vec![ok_entry(9)]
            },
            &[0],
            1,
        ));
        assert!(!collector.add(
            GetDataResult {
                results: vec![ok_entry(3)]
            },
            &[0],
            0,
        ));

        let result = collector.finalize(false, &names(2)).unwrap();
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].status, StatusCode::Ok);
        assert_eq!(result.entries[0].data, vec![block(3)]);
    }

    #[test]
    fn partial_data_is_used_when_no_full_copy_exists() {
        let collector = GetResultCollector::new(1, 1, 0, 100, false);

        let partial = GetDataResult {
            results: vec![ResultEntry {
                status: StatusCode::ShardInProgress,
                data: vec![block(7)],
            }],
        };
        assert!(!collector.add(partial, &[0], 0), "partial is not a full copy");

        let result = collector.finalize(false, &names(1)).unwrap();
        assert_eq!(result.entries[0].status, StatusCode::ShardInProgress);
        assert_eq!(result.entries[0].data, vec![block(7)]);

        // Strict mode demands a full copy and refuses the partial one.
        assert_matches!(collector.finalize(true, &names(1)), Err(ReadError::Exhausted));
    }

    #[test]
    fn missing_keys_are_not_failures() {
        let collector = GetResultCollector::new(1, 1, 0, 100, false);

        let missing = GetDataResult {
            results: vec![ResultEntry::status_only(StatusCode::KeyMissing)],
        };
        assert!(!collector.add(missing, &[0], 0));

        let result = collector.finalize(true, &names(1)).unwrap();
        assert_eq!(result.entries[0].status, StatusCode::KeyMissing);
        assert!(result.entries[0].data.is_empty());
    }

    #[test]
    fn strict_finalize_fails_on_residual_transients() {
        let collector = GetResultCollector::new(1, 2, 0, 100, false);

        collector.add(
            GetDataResult {
                results: vec![ResultEntry::status_only(StatusCode::RpcFail)],
            },
            &[0],
            0,
        );
        collector.add(
            GetDataResult {
                results: vec![ResultEntry::status_only(StatusCode::StorageFail)],
            },
            &[0],
            1,
        );

        assert_matches!(
            collector.finalize(true, &names(2)),
            Err(ReadError::Exhausted)
        );

        // Non-strict keeps the key with its first failure status.
        let relaxed = collector.finalize(false, &names(2)).unwrap();
        assert_eq!(relaxed.entries[0].status, StatusCode::RpcFail);
    }

    #[test]
    fn scan_completes_on_first_ok_copy() {
        let collector = ScanShardResultCollector::new(2);

        assert!(!collector.add(
            ScanShardResult::status_only(StatusCode::ShardInProgress),
            0
        ));

        let ok = ScanShardResult {
            status: StatusCode::Ok,
            keys: vec!["a".to_string()],
            data: vec![vec![block(1)]],
        };
        assert!(collector.add(ok.clone(), 1));

        let result = collector.finalize(false, &names(2)).unwrap();
        assert_eq!(result, ok);
    }

    #[test]
    fn scan_strict_fails_without_an_ok_copy() {
        let collector = ScanShardResultCollector::new(1);
        collector.add(ScanShardResult::status_only(StatusCode::RpcFail), 0);

        assert_matches!(
            collector.finalize(true, &names(1)),
            Err(ReadError::Exhausted)
        );
        let relaxed = collector.finalize(false, &names(1)).unwrap();
        assert_eq!(relaxed.status, StatusCode::RpcFail);
    }
}
