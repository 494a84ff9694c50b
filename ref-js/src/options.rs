use serde::Serialize;

/// How an aggregator addresses and delivers its slots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
  /// Dense, integer-indexed; delivered as an ordered sequence with absent holes.
  Sequence,
  /// Arbitrary unique keys; delivered as a key to value map.
  Mapping,
}

/// What happens when slots are registered after the aggregate has already settled once.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RearmPolicy {
  /// New slots re-arm settlement. When the next wave fires, the teardown returned by the previous
  /// wave (if still held) is invoked before the settle callback runs again.
  #[default]
  TeardownStale,
  /// New slots are refused with [`AggregateError::Settled`](crate::AggregateError::Settled) once
  /// the first wave has fired.
  Reject,
}

/// Options controlling an aggregator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregatorOptions {
  pub shape: Shape,
  pub rearm: RearmPolicy,
}

impl AggregatorOptions {
  pub fn new(shape: Shape) -> Self {
    Self {
      shape,
      rearm: RearmPolicy::default(),
    }
  }

  pub fn with_rearm(mut self, rearm: RearmPolicy) -> Self {
    self.rearm = rearm;
    self
  }
}
