//! Identifier types for the chat client.
//!
//! Server-assigned identifiers are opaque strings (the backend hands out
//! document ids), so they are wrapped in transparent string newtypes.
//! The only identifier minted locally is [`ClientMessageId`], the temporary
//! key attached to an optimistic message until the server confirms it.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix carried by optimistic message ids awaiting confirmation.
const TEMPORARY_PREFIX: &str = "temp-";
/// Prefix carried by messages that only ever exist locally.
const LOCAL_PREFIX: &str = "local-";

/// Generate a client-side identifier.
///
/// With feature `uuid_v7` enabled, this uses `Uuid::now_v7()` so ids sort by
/// creation time. Otherwise it falls back to `Uuid::new_v4()`.
#[inline]
#[must_use]
fn client_uuid() -> Uuid {
    #[cfg(feature = "uuid_v7")]
    {
        Uuid::now_v7()
    }
    #[cfg(not(feature = "uuid_v7"))]
    {
        Uuid::new_v4()
    }
}

/// Declare an opaque server-assigned string id with a consistent API.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            #[inline]
            #[must_use]
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow as `&str`.
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume into `String`.
            #[inline]
            #[must_use]
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            #[inline]
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            #[inline]
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            #[inline]
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// Account identifier of a customer or support agent.
    UserId
);

define_string_id!(
    /// Identifier of a marketplace order.
    OrderId
);

define_string_id!(
    /// Identifier of a support conversation.
    ConversationId
);

define_string_id!(
    /// Identifier of a chat message.
    ///
    /// Optimistic messages carry a temporary id derived from their
    /// [`ClientMessageId`] until the server assigns the real one.
    MessageId
);

impl MessageId {
    /// Temporary id for an optimistic message.
    #[must_use]
    pub fn temporary(client_id: ClientMessageId) -> Self {
        Self(format!("{TEMPORARY_PREFIX}{client_id}"))
    }

    /// Id for a client-only entry such as a send failure notice.
    #[must_use]
    pub fn local() -> Self {
        Self(format!("{LOCAL_PREFIX}{}", ClientMessageId::new()))
    }

    /// Whether this id was minted locally and not yet confirmed.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_PREFIX)
    }
}

/// Locally generated key correlating an optimistic message with its echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ClientMessageId(pub Uuid);

impl Default for ClientMessageId {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMessageId {
    /// Create a new identifier.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(client_uuid())
    }

    /// Borrow the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ClientMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClientMessageId {
    type Err = uuid::Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
