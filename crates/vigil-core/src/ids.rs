//! Branded ID newtypes for type safety.
//!
//! Servers and service monitors each get a distinct ID type implemented as a
//! newtype wrapper around `String`. This prevents accidentally passing a
//! monitor ID where a server ID is expected when keying caches.
//!
//! All IDs are assigned by the backend and arrive over the wire; nothing in
//! the client mints them.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Unique identifier for a monitored server.
    ServerId
}

branded_id! {
    /// Unique identifier for a service monitor attached to a server.
    MonitorId
}

branded_id! {
    /// Opaque bearer credential for the authenticated feed.
    AuthToken
}

// ─────────────────────────────────────────────────────────────────────────────
// EntityKey
// ─────────────────────────────────────────────────────────────────────────────

/// Key for caches and subscriptions that span both entity families.
///
/// Service-monitor results are fanned out under both the owning server and
/// the owning monitor, so the service-check cache is keyed by this enum.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntityKey {
    /// Keyed by the owning server.
    Server(ServerId),
    /// Keyed by the owning monitor.
    Monitor(MonitorId),
}

impl EntityKey {
    /// The raw id string, without the family discriminant.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Server(id) => id.as_str(),
            Self::Monitor(id) => id.as_str(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(f, "server:{id}"),
            Self::Monitor(id) => write!(f, "monitor:{id}"),
        }
    }
}

impl From<ServerId> for EntityKey {
    fn from(id: ServerId) -> Self {
        Self::Server(id)
    }
}

impl From<MonitorId> for EntityKey {
    fn from(id: MonitorId) -> Self {
        Self::Monitor(id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
