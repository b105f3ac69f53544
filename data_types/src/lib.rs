//! This crate contains the data types that are shared between the stratus
//! storage servers and their clients: keys, data points, range-read requests
//! and the per-key result statuses the servers answer with.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// A logical time series identifier.
///
/// The shard id is advisory: it is the caller's best knowledge of the shard
/// that owns `name` within one service, and the routing layer may override it
/// from its shard cache. Coordinators that retry across services restore the
/// original id before re-requesting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    /// The time series name, unique within a shard.
    pub name: String,
    /// The shard the key is believed to live in.
    pub shard_id: i64,
}

impl Key {
    /// Create a key for `name` in shard `shard_id`.
    pub fn new(name: impl Into<String>, shard_id: i64) -> Self {
        Self {
            name: name.into(),
            shard_id,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.shard_id)
    }
}

/// A single observation for a [`Key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// The series this observation belongs to.
    pub key: Key,
    /// Observation time, unix seconds.
    pub unix_time: i64,
    /// Observed value.
    pub value: f64,
}

impl DataPoint {
    /// Create a data point for `key` at `unix_time`.
    pub fn new(key: Key, unix_time: i64, value: f64) -> Self {
        Self {
            key,
            unix_time,
            value,
        }
    }
}

/// An opaque compressed bucket of values for one key.
///
/// Blocks are produced and decoded by the wire codec; clients treat them as
/// pass-through payloads and only ever merge whole blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedBlock {
    /// Number of data points encoded in `data`.
    pub count: u32,
    /// The compressed payload.
    pub data: Vec<u8>,
}

/// Per-key status a storage server attaches to a read response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// The key was served successfully.
    Ok,
    /// The key does not exist on the owning shard.
    ///
    /// Missing keys are terminal: no replica is retried for them.
    KeyMissing,
    /// The RPC to the owning host failed.
    RpcFail,
    /// The host reached its backing store but the store failed.
    StorageFail,
    /// The host addressed does not currently own the key's shard.
    DontOwnShard,
    /// The shard is owned but still loading; data may be incomplete.
    ShardInProgress,
    /// The shard is serving but has recorded gaps in the requested range.
    MissingTooMuchData,
    /// The bucket holding the range is not yet finalized.
    ///
    /// Servers never emit this on the client-facing read path; observing it
    /// there is a protocol violation.
    BucketNotFinalized,
}

impl StatusCode {
    /// Whether this status is retryable within a service after a shard-cache
    /// invalidation, and across services after that.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RpcFail | Self::StorageFail | Self::DontOwnShard)
    }

    /// Whether this status marks a shard that can serve partial data and is
    /// expected to be complete on some other service.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::ShardInProgress | Self::MissingTooMuchData)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::KeyMissing => "KEY_MISSING",
            Self::RpcFail => "RPC_FAIL",
            Self::StorageFail => "STORAGE_FAIL",
            Self::DontOwnShard => "DONT_OWN_SHARD",
            Self::ShardInProgress => "SHARD_IN_PROGRESS",
            Self::MissingTooMuchData => "MISSING_TOO_MUCH_DATA",
            Self::BucketNotFinalized => "BUCKET_NOT_FINALIZED",
        };
        f.write_str(s)
    }
}

/// A range read over a set of keys.
///
/// The range is inclusive on both ends, `begin <= t <= end`, unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetDataRequest {
    /// Inclusive range start, unix seconds.
    pub begin: i64,
    /// Inclusive range end, unix seconds.
    pub end: i64,
    /// The keys to read.
    pub keys: Vec<Key>,
}

impl GetDataRequest {
    /// Create a request for `keys` over `[begin, end]`.
    pub fn new(begin: i64, end: i64, keys: Vec<Key>) -> Self {
        Self { begin, end, keys }
    }
}

/// One key's slice of a read response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    /// Outcome for this key.
    pub status: StatusCode,
    /// Encoded blocks covering the requested range, oldest first.
    pub data: Vec<EncodedBlock>,
}

impl ResultEntry {
    /// An entry carrying `status` and no data.
    pub fn status_only(status: StatusCode) -> Self {
        Self {
            status,
            data: vec![],
        }
    }
}

/// A read response; `results[i]` answers the i-th key of the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetDataResult {
    /// Per-key result entries, in request key order.
    pub results: Vec<ResultEntry>,
}

/// A whole-shard scan over a time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanShardRequest {
    /// The shard to scan.
    pub shard_id: i64,
    /// Inclusive range start, unix seconds.
    pub begin: i64,
    /// Inclusive range end, unix seconds.
    pub end: i64,
}

/// The result of scanning one shard on one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanShardResult {
    /// Outcome for the shard as a whole.
    pub status: StatusCode,
    /// Names of the keys found in the shard.
    pub keys: Vec<String>,
    /// `data[i]` holds the encoded blocks for `keys[i]`.
    pub data: Vec<Vec<EncodedBlock>>,
}

impl ScanShardResult {
    /// A result carrying `status` and no keys.
    pub fn status_only(status: StatusCode) -> Self {
        Self {
            status,
            keys: vec![],
            data: vec![],
        }
    }
}

/// Last-write time for one key, as reported by a shard owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUpdateTime {
    /// The key name.
    pub key: String,
    /// The shard the key lives in.
    pub shard_id: i64,
    /// Time of the most recent write, unix seconds.
    pub updated_at: i64,
}
