//! Identifier newtypes
//!
//! Campaign and message ids are ULIDs: globally unique and lexicographically
//! sortable by creation time, which is what the batch loader's keyset cursor
//! relies on. Owner ids are opaque strings handed to us by the caller.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(ulid::Ulid);

        impl $name {
            /// Generate a new unique id
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new())
            }

            /// Wrap an existing ULID
            #[must_use]
            pub const fn new(id: ulid::Ulid) -> Self {
                Self(id)
            }

            /// Get the underlying ULID
            #[must_use]
            pub const fn ulid(&self) -> ulid::Ulid {
                self.0
            }

            /// Milliseconds since the Unix epoch encoded in the id
            #[must_use]
            pub const fn timestamp_ms(&self) -> u64 {
                self.0.timestamp_ms()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                ulid::Ulid::from_string(s).map(Self)
            }
        }
    };
}

ulid_id!(
    /// Identifier of one bulk-send request
    CampaignId
);

ulid_id!(
    /// Identifier of one outbound message
    MessageId
);

/// The account a campaign is billed against
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(Arc<str>);

impl OwnerId {
    #[must_use]
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for OwnerId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_sort_by_creation() {
        let first = MessageId::new(ulid::Ulid::from_parts(1_000, 7));
        let second = MessageId::new(ulid::Ulid::from_parts(2_000, 1));
        assert!(first < second);
        assert_eq!(first.timestamp_ms(), 1_000);
    }

    #[test]
    fn test_id_display_round_trips_through_from_str() {
        let id = CampaignId::generate();
        let parsed: CampaignId = id.to_string().parse().expect("valid ULID");
        assert_eq!(parsed, id);
        assert!("not-a-ulid".parse::<CampaignId>().is_err());
    }

    #[test]
    fn test_owner_id() {
        let owner: OwnerId = "acme".into();
        assert_eq!(owner.as_str(), "acme");
        assert_eq!(owner.to_string(), "acme");
        assert_eq!(owner.len(), 4);
    }
}
