// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Newtype wrappers around the opaque string identifiers the datastore
//! hands us, so that an endpoint id and a profile id can't be swapped by
//! accident at a call site even though both are, underneath, plain
//! strings.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

macro_rules! opaque_string_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

opaque_string_id!(EndpointId, "Stable identifier of an endpoint.");
opaque_string_id!(ProfileId, "Identifier of a profile, shared by its rule list and tag list.");
opaque_string_id!(Tag, "An opaque tag name resolved to a set of endpoint IPs.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_deref() {
        let id = EndpointId::from("ep-1");
        assert_eq!(&*id, "ep-1");
        assert_eq!(id.to_string(), "ep-1");
    }
}
