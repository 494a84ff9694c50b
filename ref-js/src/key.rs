use crate::error::AggregateError;
use crate::error::AggregateResult;
use crate::error::KeyErrorReason;
use crate::options::Shape;
use core::fmt;
use serde::Serialize;

/// The identity of a slot.
///
/// Sequence aggregators only ever hold [`Key::Index`] slots and mapping aggregators only ever hold
/// [`Key::Name`] slots. [`Key::Root`] is the aggregate's own slot and is shared by both shapes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
  Root,
  Index(u32),
  Name(String),
}

impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Key::Root => f.write_str("<root>"),
      Key::Index(index) => write!(f, "{index}"),
      Key::Name(name) => f.write_str(name),
    }
  }
}

/// Highest index a sequence aggregator accepts. Sequence containers are dense, so registering index
/// `n` allocates `n + 1` slots.
pub const MAX_SEQUENCE_INDEX: u32 = (1 << 20) - 1;

/// A key as supplied by a driver, before it has been checked against the aggregator's shape.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RawKey {
  Int(i64),
  Str(String),
}

impl RawKey {
  /// Normalizes this key for an aggregator of the given shape.
  ///
  /// Mapping keys are property names, so integers become their decimal string and `0` and `"0"`
  /// address the same slot. Sequence keys must be integers in `0..=MAX_SEQUENCE_INDEX`. Strings
  /// are accepted only when they are a plain decimal integer with an optional sign: surrounding
  /// whitespace, exponents, fractions and hex literals are all rejected as
  /// [`KeyErrorReason::NotInteger`].
  pub fn coerce(self, shape: Shape) -> AggregateResult<Key> {
    match (shape, self) {
      (Shape::Mapping, RawKey::Int(int)) => Ok(Key::Name(int.to_string())),
      (Shape::Mapping, RawKey::Str(name)) => Ok(Key::Name(name)),
      (Shape::Sequence, RawKey::Int(int)) => index_from_int(int),
      (Shape::Sequence, RawKey::Str(raw)) => match raw.parse::<i64>() {
        Ok(int) => index_from_int(int),
        Err(_) => Err(AggregateError::invalid_key(raw, KeyErrorReason::NotInteger)),
      },
    }
  }
}

fn index_from_int(int: i64) -> AggregateResult<Key> {
  if int < 0 {
    return Err(AggregateError::invalid_key(int, KeyErrorReason::Negative));
  }
  match u32::try_from(int) {
    Ok(index) if index <= MAX_SEQUENCE_INDEX => Ok(Key::Index(index)),
    _ => Err(AggregateError::invalid_key(int, KeyErrorReason::TooLarge)),
  }
}

impl fmt::Display for RawKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RawKey::Int(int) => write!(f, "{int}"),
      RawKey::Str(raw) => f.write_str(raw),
    }
  }
}

macro_rules! raw_key_from_int {
  ($($ty:ty),*) => {
    $(
      impl From<$ty> for RawKey {
        fn from(value: $ty) -> RawKey {
          RawKey::Int(value.into())
        }
      }
    )*
  };
}

raw_key_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for RawKey {
  fn from(value: u64) -> RawKey {
    RawKey::Int(i64::try_from(value).unwrap_or(i64::MAX))
  }
}

impl From<usize> for RawKey {
  fn from(value: usize) -> RawKey {
    RawKey::Int(i64::try_from(value).unwrap_or(i64::MAX))
  }
}

impl From<&str> for RawKey {
  fn from(value: &str) -> RawKey {
    RawKey::Str(value.to_string())
  }
}

impl From<String> for RawKey {
  fn from(value: String) -> RawKey {
    RawKey::Str(value)
  }
}

impl From<&String> for RawKey {
  fn from(value: &String) -> RawKey {
    RawKey::Str(value.clone())
  }
}
