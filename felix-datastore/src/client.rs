// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Transport boundary to the datastore: a small trait the watcher drives
//! (so it can be unit-tested against an in-memory fake) plus a real
//! implementation targeting etcd's v2 HTTP API, matching the reference
//! `python-etcd` client's wire format.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// One etcd v2 node: a key/value leaf, or a directory with children.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Node {
    pub key: String,
    pub value: Option<String>,
    pub dir: bool,
    pub modified_index: u64,
    pub children: Vec<Node>,
}

/// The action that produced an etcd v2 response, per the wire protocol's
/// `action` field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Get,
    Set,
    Create,
    Update,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
}

impl Action {
    fn parse(raw: &str) -> Action {
        match raw {
            "set" => Action::Set,
            "create" => Action::Create,
            "update" => Action::Update,
            "delete" => Action::Delete,
            "expire" => Action::Expire,
            "compareAndSwap" => Action::CompareAndSwap,
            "compareAndDelete" => Action::CompareAndDelete,
            _ => Action::Get,
        }
    }

    /// Whether this action is a plain write, as opposed to a deletion or
    /// expiry -- the distinction `spec.md` §4.10's "on any non-set/non-create
    /// event" cares about.
    #[must_use]
    pub fn is_set_or_create(self) -> bool {
        matches!(self, Action::Set | Action::Create)
    }

    /// Whether this action removes the key.
    #[must_use]
    pub fn is_delete(self) -> bool {
        matches!(self, Action::Delete | Action::Expire | Action::CompareAndDelete)
    }
}

/// A response to a read or a long-poll wait.
#[derive(Clone, Debug)]
pub struct EtcdResponse {
    pub action: Action,
    pub node: Node,
    /// The cluster-wide modified-index high-water mark at the time of
    /// this response (`X-Etcd-Index`), used to seed `waitIndex` for the
    /// next poll.
    pub etcd_index: u64,
    /// `X-Etcd-Cluster-ID`, used to detect a cluster the watcher has not
    /// synced with (a reconnect to a different cluster entirely).
    pub cluster_id: Option<String>,
}

/// Failures reading from or waiting on the datastore.
#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("key {0:?} not found")]
    KeyNotFound(String),
    #[error("read from datastore timed out")]
    ReadTimeout,
    #[error("datastore event index was cleared, full resync required")]
    EventIndexCleared,
    #[error("connection to datastore failed: {0}")]
    ConnectFailed(String),
    #[error("datastore returned an error: {0}")]
    Other(String),
}

impl DatastoreError {
    /// `true` for errors the reference implementation retries
    /// indefinitely without tearing down polling state (read timeouts,
    /// transient connect failures) -- as opposed to [`DatastoreError::EventIndexCleared`],
    /// which always forces a full resync.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, DatastoreError::ReadTimeout | DatastoreError::ConnectFailed(_))
    }
}

/// Boundary to the datastore. The watcher is generic over this trait so
/// its polling protocol can be exercised against an in-memory fake
/// without a live etcd cluster.
#[async_trait::async_trait]
pub trait DatastoreClient: Send + Sync {
    /// Read `key`, optionally recursively (a directory snapshot).
    async fn read(&self, key: &str, recursive: bool) -> Result<EtcdResponse, DatastoreError>;

    /// Long-poll `key` (always recursive: the watcher only ever waits on
    /// the whole version directory) for the first change at or after
    /// `wait_index`, bounded by `connect_timeout`/`read_timeout`.
    async fn wait(
        &self,
        key: &str,
        wait_index: u64,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<EtcdResponse, DatastoreError>;

    /// Drop any cached connection state (e.g. a kept-alive HTTP
    /// connection) so the next call opens a fresh one. Called by the
    /// watcher on every desync and at the top of every resync, matching
    /// the reference `_reconnect`.
    fn reconnect(&self);
}

#[derive(Debug, Deserialize)]
struct NodeJson {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default, rename = "modifiedIndex")]
    modified_index: u64,
    #[serde(default)]
    nodes: Vec<NodeJson>,
}

impl From<NodeJson> for Node {
    fn from(raw: NodeJson) -> Self {
        Node {
            key: raw.key,
            value: raw.value,
            dir: raw.dir,
            modified_index: raw.modified_index,
            children: raw.nodes.into_iter().map(Node::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseJson {
    action: String,
    node: NodeJson,
}

#[derive(Debug, Deserialize)]
struct ErrorJson {
    #[serde(rename = "errorCode")]
    error_code: u32,
    message: String,
}

/// Etcd v2 error code for "the event in requested index is outdated and
/// cleared" -- the one desync condition that arrives as an HTTP error
/// body rather than a distinguishable response shape.
const ETCD_EVENT_INDEX_CLEARED: u32 = 401;
/// Etcd v2 error code for "key not found".
const ETCD_KEY_NOT_FOUND: u32 = 100;

/// Invokes a real etcd v2 cluster over HTTP, matching the reference
/// `python-etcd` client's wire format.
pub struct EtcdV2Client {
    base_url: String,
    client: Mutex<reqwest::Client>,
}

impl EtcdV2Client {
    /// `addr` is `host` or `host:port`, as read from the `ETCD_ADDR`
    /// config key (already normalized to include a port by
    /// `felix_config`).
    #[must_use]
    pub fn new(addr: &str) -> Self {
        EtcdV2Client {
            base_url: format!("http://{addr}/v2/keys"),
            client: Mutex::new(build_client()),
        }
    }

    async fn send(
        &self,
        key: &str,
        params: &[(&str, String)],
    ) -> Result<EtcdResponse, DatastoreError> {
        let client = self.client.lock().unwrap().clone();
        let url = format!("{}{}", self.base_url, key);
        let response = client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let headers = response.headers().clone();
        let etcd_index = headers
            .get("x-etcd-index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let cluster_id = headers
            .get("x-etcd-cluster-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<ErrorJson>(&body) {
                return Err(match err.error_code {
                    ETCD_KEY_NOT_FOUND => DatastoreError::KeyNotFound(key.to_string()),
                    ETCD_EVENT_INDEX_CLEARED => DatastoreError::EventIndexCleared,
                    _ => DatastoreError::Other(err.message),
                });
            }
            return Err(DatastoreError::Other(format!("HTTP {status}: {body}")));
        }

        let parsed: ResponseJson =
            serde_json::from_str(&body).map_err(|e| DatastoreError::Other(e.to_string()))?;
        Ok(EtcdResponse {
            action: Action::parse(&parsed.action),
            node: parsed.node.into(),
            etcd_index,
            cluster_id,
        })
    }
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .build()
        .expect("reqwest client with no custom TLS config always builds")
}

fn map_reqwest_error(err: reqwest::Error) -> DatastoreError {
    if err.is_timeout() {
        DatastoreError::ReadTimeout
    } else if err.is_connect() {
        DatastoreError::ConnectFailed(err.to_string())
    } else {
        DatastoreError::Other(err.to_string())
    }
}

#[async_trait::async_trait]
impl DatastoreClient for EtcdV2Client {
    async fn read(&self, key: &str, recursive: bool) -> Result<EtcdResponse, DatastoreError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if recursive {
            params.push(("recursive", "true".to_string()));
        }
        self.send(key, &params).await
    }

    async fn wait(
        &self,
        key: &str,
        wait_index: u64,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<EtcdResponse, DatastoreError> {
        let params: Vec<(&str, String)> = vec![
            ("wait", "true".to_string()),
            ("waitIndex", wait_index.to_string()),
            ("recursive", "true".to_string()),
        ];
        let total_timeout = connect_timeout + read_timeout;
        tokio::time::timeout(total_timeout, self.send(key, &params))
            .await
            .unwrap_or(Err(DatastoreError::ReadTimeout))
    }

    fn reconnect(&self) {
        *self.client.lock().unwrap() = build_client();
    }
}

/// An in-memory stand-in for [`EtcdV2Client`], driven entirely by
/// scripted responses. Used by `felix-datastore`'s own tests and
/// available to downstream crates' tests that need to exercise the
/// watcher's protocol without a real cluster.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::{Action, DatastoreClient, DatastoreError, EtcdResponse, Node};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// One scripted reply to the next `read` or `wait` call.
    pub enum Scripted {
        Read(Result<EtcdResponse, DatastoreError>),
        Wait(Result<EtcdResponse, DatastoreError>),
    }

    #[derive(Default)]
    pub struct FakeClient {
        reads: Mutex<VecDeque<Result<EtcdResponse, DatastoreError>>>,
        waits: Mutex<VecDeque<Result<EtcdResponse, DatastoreError>>>,
        pub reconnects: Mutex<usize>,
    }

    impl FakeClient {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, scripted: Scripted) {
            match scripted {
                Scripted::Read(r) => self.reads.lock().unwrap().push_back(r),
                Scripted::Wait(r) => self.waits.lock().unwrap().push_back(r),
            }
        }
    }

    #[async_trait::async_trait]
    impl DatastoreClient for FakeClient {
        async fn read(&self, _key: &str, _recursive: bool) -> Result<EtcdResponse, DatastoreError> {
            self.reads
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(DatastoreError::Other("no scripted read left".to_string())))
        }

        async fn wait(
            &self,
            _key: &str,
            _wait_index: u64,
            _connect_timeout: Duration,
            _read_timeout: Duration,
        ) -> Result<EtcdResponse, DatastoreError> {
            self.waits
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(DatastoreError::Other("no scripted wait left".to_string())))
        }

        fn reconnect(&self) {
            *self.reconnects.lock().unwrap() += 1;
        }
    }

    /// Build a leaf node response, the common case in tests.
    #[must_use]
    pub fn leaf(key: &str, value: &str, modified_index: u64, etcd_index: u64) -> EtcdResponse {
        EtcdResponse {
            action: Action::Set,
            node: Node {
                key: key.to_string(),
                value: Some(value.to_string()),
                dir: false,
                modified_index,
                children: Vec::new(),
            },
            etcd_index,
            cluster_id: Some("cluster-a".to_string()),
        }
    }

    /// Build a directory node response with `children`.
    #[must_use]
    pub fn dir(key: &str, children: Vec<Node>, etcd_index: u64) -> EtcdResponse {
        EtcdResponse {
            action: Action::Get,
            node: Node {
                key: key.to_string(),
                value: None,
                dir: true,
                modified_index: etcd_index,
                children,
            },
            etcd_index,
            cluster_id: Some("cluster-a".to_string()),
        }
    }

    /// Build a delete-action response for `key`.
    #[must_use]
    pub fn delete(key: &str, modified_index: u64, etcd_index: u64) -> EtcdResponse {
        EtcdResponse {
            action: Action::Delete,
            node: Node {
                key: key.to_string(),
                value: None,
                dir: false,
                modified_index,
                children: Vec::new(),
            },
            etcd_index,
            cluster_id: Some("cluster-a".to_string()),
        }
    }
}
