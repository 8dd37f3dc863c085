//! Base domain types shared across the hub.
//!
//! This module defines strongly-typed domain values to prevent primitive
//! obsession and improve type safety throughout the codebase. Types here are
//! the ones reused by more than one hub component; component-specific types
//! live in that component's own `domain_types` module (see
//! [`crate::hub::domain_types`]).

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an agent (a logical identity that produces and
/// consumes messages).
///
/// A validated, non-empty string rather than a UUID: the wire protocol
/// lets callers pick their own human-readable agent ids (`"A"`, `"B"`,
/// `"scheduler"`), matching the data model's `agentId (string)` field.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct AgentId(String);

impl AgentId {
    /// Generates a synthetic agent id, e.g. for tests or system-authored
    /// messages that need a unique sender.
    #[must_use]
    pub fn generate() -> Self {
        Self::try_new(Uuid::new_v4().to_string()).unwrap_or_else(|_| {
            unreachable!("a UUID string always satisfies AgentId's length bounds")
        })
    }
}

/// Human-readable name of an agent.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct AgentName(String);

/// A monotonic message counter used in stats and throughput tracking.
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct MessageCount(u64);

impl MessageCount {
    /// The zero count.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns a new counter one higher than this one.
    #[must_use]
    pub fn increment(self) -> Self {
        Self::new(self.into_inner() + 1)
    }

    /// The count as a `usize`, for indexing and capacity checks.
    pub fn as_usize(&self) -> usize {
        self.into_inner() as usize
    }
}

/// Size in bytes of a message payload, bounded to keep memory use in a
/// single tracked message predictable.
#[nutype(
    validate(less_or_equal = 10_485_760), // 10MB max
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct MessageSize(usize);

impl MessageSize {
    /// Creates a message size from kilobytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting byte count exceeds the maximum
    /// allowed size (10MB).
    pub fn from_kb(kb: usize) -> Result<Self, MessageSizeError> {
        Self::try_new(kb * 1024)
    }

    /// The size as a `usize`.
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}
