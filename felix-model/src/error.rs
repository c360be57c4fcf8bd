// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Validation failures for datastore payloads.
//!
//! A single [`ValidationError`] collects every issue found in one payload
//! (not just the first), matching the reference validator's behavior of
//! reporting the whole list of problems at once. Per `spec.md` §7, a
//! validation failure is never fatal: the caller treats the offending key
//! as if it had been deleted and logs this error as a warning.

use thiserror::Error;

/// One or more problems found while validating a datastore payload.
#[derive(Debug, Error, Eq, PartialEq)]
#[error("{}", .0.join("; "))]
pub struct ValidationError(pub Vec<String>);

impl ValidationError {
    /// Build an error from a list of issues, or `Ok(())` if the list is
    /// empty — the common "collect issues as you go, fail at the end"
    /// pattern used by every validator in this crate.
    pub fn from_issues(issues: Vec<String>) -> Result<(), ValidationError> {
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError(issues))
        }
    }
}
