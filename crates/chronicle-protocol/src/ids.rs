//! Typed identifiers.
//!
//! IDs are opaque String wrappers (serde-transparent). Fresh ids are UUID v4,
//! but any caller-supplied string is accepted; stores that use ids as path
//! components validate them with [`validate_path_segment`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CheckpointError, CheckpointResult};

/// String newtype for thread, record and branch identifiers. Ordered so
/// manifests and trees can sort by id as a tiebreak.
macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Random v4 UUID, used when the caller does not name the record.
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
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

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Unique identifier for a conversation thread.
    ThreadId
);
typed_id!(
    /// Identifier of a checkpoint or snapshot record within a thread.
    ///
    /// A checkpoint and a snapshot may share the same id.
    CheckpointId
);
typed_id!(
    /// Label of a branch within a thread. Default is "main".
    BranchName
);

impl Default for ThreadId {
    fn default() -> Self {
        Self::new_uuid()
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new_uuid()
    }
}

impl BranchName {
    /// The default "main" branch.
    pub fn main() -> Self {
        Self("main".to_owned())
    }
}

impl Default for BranchName {
    fn default() -> Self {
        Self::main()
    }
}

/// Reject values that cannot be used verbatim as a single file-name segment.
pub fn validate_path_segment(kind: &str, value: &str) -> CheckpointResult<()> {
    if value.is_empty() {
        return Err(CheckpointError::Validation(format!("{kind} must not be empty")));
    }
    if value == "." || value == ".." {
        return Err(CheckpointError::Validation(format!(
            "{kind} must not be a relative path component: {value:?}"
        )));
    }
    if value
        .chars()
        .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control())
    {
        return Err(CheckpointError::Validation(format!(
            "{kind} contains characters not allowed in a file name: {value:?}"
        )));
    }
    Ok(())
}
