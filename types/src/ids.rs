use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{ValidationError, is_identifier_char};

/// Opaque identifier of one offloaded fetch, stable across retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReqId(String);

impl ReqId {
    pub const MAX_LENGTH: usize = 128;

    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ValidationError::Empty { field: "req_id" });
        }
        if value.len() > Self::MAX_LENGTH {
            return Err(ValidationError::TooLong {
                field: "req_id",
                max: Self::MAX_LENGTH,
            });
        }
        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ValidationError::InvalidChars {
                field: "req_id",
                value,
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ReqId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ReqId> for String {
    fn from(value: ReqId) -> Self {
        value.0
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of one actor instance: the binding (actor kind) plus the instance name.
///
/// Both parts name on-disk storage, so they are restricted to `[A-Za-z0-9._-]`
/// and may not start with a dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawActorRef")]
pub struct ActorRef {
    binding: String,
    instance: String,
}

#[derive(Deserialize)]
struct RawActorRef {
    binding: String,
    instance: String,
}

impl TryFrom<RawActorRef> for ActorRef {
    type Error = ValidationError;

    fn try_from(raw: RawActorRef) -> Result<Self, Self::Error> {
        Self::new(raw.binding, raw.instance)
    }
}

impl ActorRef {
    pub const MAX_PART_LENGTH: usize = 64;

    pub fn new(
        binding: impl Into<String>,
        instance: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let binding = binding.into();
        let instance = instance.into();
        validate_part("binding", &binding)?;
        validate_part("instance", &instance)?;
        Ok(Self { binding, instance })
    }

    #[must_use]
    pub fn binding(&self) -> &str {
        &self.binding
    }

    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }
}

fn validate_part(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.len() > ActorRef::MAX_PART_LENGTH {
        return Err(ValidationError::TooLong {
            field,
            max: ActorRef::MAX_PART_LENGTH,
        });
    }
    if value.starts_with('.') || !value.chars().all(is_identifier_char) {
        return Err(ValidationError::InvalidChars {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.binding, self.instance)
    }
}

/// Monotonic, timestamp-encoding, lexicographically sortable queue position.
///
/// A ULID: the first 48 bits are the creation time in Unix milliseconds, so the
/// age of an entry can be read back from its key after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderingKey(Ulid);

impl OrderingKey {
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    #[must_use]
    pub fn timestamp_ms(self) -> u64 {
        self.0.timestamp_ms()
    }

    /// Milliseconds elapsed between key creation and `now_ms`; zero if the key is in the future.
    #[must_use]
    pub fn age_ms(self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms())
    }
}

impl fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrderingKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|_| ValidationError::InvalidOrderingKey(s.to_string()))
    }
}

impl TryFrom<String> for OrderingKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OrderingKey> for String {
    fn from(value: OrderingKey) -> Self {
        value.to_string()
    }
}
