use crate::key::Key;
use core::fmt;

/// Why a key could not be used to address a slot.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum KeyErrorReason {
  /// Sequence indices must be non-negative.
  Negative,
  /// Sequence indices must not exceed [`MAX_SEQUENCE_INDEX`](crate::MAX_SEQUENCE_INDEX).
  TooLarge,
  /// A string key in sequence mode did not parse as an integer.
  NotInteger,
}

impl fmt::Display for KeyErrorReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyErrorReason::Negative => f.write_str("sequence index is negative"),
      KeyErrorReason::TooLarge => {
        write!(f, "sequence index exceeds {}", crate::MAX_SEQUENCE_INDEX)
      }
      KeyErrorReason::NotInteger => f.write_str("sequence key is not an integer"),
    }
  }
}

/// Errors returned synchronously by registration. No aggregator state is mutated when one of these
/// is returned.
///
/// Diagnostic codes (prefix `RA`) are stable:
/// - `RA0001`: [`AggregateError::InvalidKey`]
/// - `RA0002`: [`AggregateError::Settled`]
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
  /// The key cannot address a slot in a sequence aggregator.
  #[error("invalid key `{key}`: {reason}")]
  InvalidKey { key: String, reason: KeyErrorReason },

  /// A new slot was requested after the first settlement while the aggregator rejects re-arming.
  #[error("cannot register `{key}`: aggregate has already settled")]
  Settled { key: Key },
}

impl AggregateError {
  pub(crate) fn invalid_key(key: impl fmt::Display, reason: KeyErrorReason) -> AggregateError {
    AggregateError::InvalidKey {
      key: key.to_string(),
      reason,
    }
  }

  /// Stable diagnostic code for this error variant.
  pub fn code(&self) -> &'static str {
    match self {
      AggregateError::InvalidKey { .. } => "RA0001",
      AggregateError::Settled { .. } => "RA0002",
    }
  }
}

pub type AggregateResult<T> = Result<T, AggregateError>;
