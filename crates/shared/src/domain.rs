use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! name_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

macro_rules! token_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

name_newtype!(UserId);
name_newtype!(ChannelId);

token_newtype!(MessageToken);
token_newtype!(ActionToken);

/// Tokens live in the backend's 100ns-unit time domain; milliseconds scale
/// into it by this factor.
const TOKEN_UNITS_PER_MS: i64 = 10_000;

impl MessageToken {
    /// Synthetic ordering token for a not-yet-confirmed message, derived from
    /// wall-clock time scaled into the backend token domain.
    pub fn synthetic(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_millis().saturating_mul(TOKEN_UNITS_PER_MS))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientMessageId(pub Uuid);

impl ClientMessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ClientMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
