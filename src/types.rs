//! Shared data types: topics, channels, subscription identities and the
//! message envelope delivered to handlers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;

/// A validated topic name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Topic(String);

/// A validated channel name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(String);

/// The name failed the broker's `^[.a-zA-Z0-9_-]+(#ephemeral)?$`, ≤64 byte rule
#[derive(Debug, thiserror::Error)]
#[error("invalid name {0:?}: must match ^[.a-zA-Z0-9_-]+(#ephemeral)?$ and be <= 64 bytes")]
pub struct InvalidName(pub String);

fn validate_name(name: &str) -> Result<(), InvalidName> {
    let body = name.strip_suffix("#ephemeral").unwrap_or(name);
    let valid = !name.is_empty()
        && name.len() <= 64
        && !body.is_empty()
        && body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(InvalidName(name.to_owned()))
    }
}

macro_rules! validated_name {
    ($ty:ident) => {
        impl $ty {
            /// Validate and wrap a name
            ///
            /// # Errors
            ///
            /// Returns [`InvalidName`] if `name` does not match
            /// `^[.a-zA-Z0-9_-]+(#ephemeral)?$` or exceeds 64 bytes.
            pub fn new(name: impl Into<String>) -> Result<Self, InvalidName> {
                let name = name.into();
                validate_name(&name)?;
                Ok(Self(name))
            }

            /// The underlying string
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<&str> for $ty {
            type Error = InvalidName;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }
    };
}

validated_name!(Topic);
validated_name!(Channel);

/// An opaque, monotonically increasing subscription identifier
///
/// Minted from a process-wide counter; stable across the owning
/// subscription's lifetime and comparable for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// An opaque broker-assigned message identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 16]);

impl MessageId {
    #[must_use]
    pub(crate) fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> [u8; 16] {
        self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A message delivered from the broker to a [`crate::handler::MessageHandler`]
#[derive(Debug, Clone)]
pub struct Message {
    /// Broker-assigned identifier, used for `FIN`/`REQ`/`TOUCH`
    pub id: MessageId,
    /// The broker node's delivery timestamp
    pub timestamp: SystemTime,
    /// Number of times the broker has attempted delivery of this message
    pub attempts: u16,
    /// The message body
    pub body: Bytes,
}

#[cfg(test)]
mod tests {
    use super::{Channel, Topic};

    #[test]
    fn accepts_simple_names() {
        assert!(Topic::new("orders").is_ok());
        assert!(Channel::new("orders.worker#ephemeral").is_ok());
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(Topic::new("").is_err());
        assert!(Topic::new("has space").is_err());
        assert!(Topic::new("a".repeat(65)).is_err());
    }
}
