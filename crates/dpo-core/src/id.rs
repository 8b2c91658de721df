//! Opaque string identifiers for the entities of a pipeline.
//!
//! Identifiers are globally unique within a run and cheap to clone: every
//! action in the DAG carries the ids of its inputs and outputs, and subfeeds
//! carry the id of the data object they describe.

use arcstr::ArcStr;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(ArcStr);

        impl $name {
            pub fn new(id: impl AsRef<str>) -> Self {
                Self(ArcStr::from(id.as_ref()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(ArcStr::from(s))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

id_newtype! {
    /// Identifier of a logical dataset (table, file set, stream).
    DataObjectId
}

id_newtype! {
    /// Identifier of a node in the execution graph.
    ActionId
}

id_newtype! {
    /// Identifier of a connection to a remote store.
    ConnectionId
}
