// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The datastore watcher (C10 in the component table): connects to the
//! key/value store, performs an initial snapshot read, then long-polls
//! for deltas, validating and classifying every change before handing
//! it to the rest of the agent.

#![forbid(unsafe_code)]

pub mod client;
pub mod keys;
pub mod watcher;

pub use client::{Action, DatastoreClient, DatastoreError, EtcdResponse, EtcdV2Client, Node};
pub use keys::{KeyKind, Keys, DEFAULT_ROOT};
pub use watcher::{PollOutcome, RawEndpoint, UpdateSink, Watcher, RETRY_DELAY, WAIT_CONNECT_TIMEOUT, WAIT_READ_TIMEOUT};
