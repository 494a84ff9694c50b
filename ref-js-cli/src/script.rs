use ahash::HashMap;
use clap::ValueEnum;
use ref_js::{
  Aggregate, AggregateError, Aggregator, AggregatorOptions, Key, RawKey, RearmPolicy,
  ReleaseHandle, RootSetter, Setter, Shape, Slots, Teardown, WriteOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

#[derive(Clone, Copy, Debug, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShapeArg {
  Sequence,
  Mapping,
}

impl From<ShapeArg> for Shape {
  fn from(value: ShapeArg) -> Shape {
    match value {
      ShapeArg::Sequence => Shape::Sequence,
      ShapeArg::Mapping => Shape::Mapping,
    }
  }
}

#[derive(Clone, Copy, Debug, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RearmArg {
  TeardownStale,
  Reject,
}

impl From<RearmArg> for RearmPolicy {
  fn from(value: RearmArg) -> RearmPolicy {
    match value {
      RearmArg::TeardownStale => RearmPolicy::TeardownStale,
      RearmArg::Reject => RearmPolicy::Reject,
    }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ScriptKey {
  Int(i64),
  Str(String),
}

impl From<ScriptKey> for RawKey {
  fn from(value: ScriptKey) -> RawKey {
    match value {
      ScriptKey::Int(int) => RawKey::Int(int),
      ScriptKey::Str(raw) => RawKey::Str(raw),
    }
  }
}

/// One driver action.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Event {
  Register { key: ScriptKey },
  Set { key: ScriptKey, value: Value },
  Release { key: ScriptKey },
  RegisterRoot,
  SettleRoot,
  ReleaseRoot,
  Snapshot,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
  pub shape: Option<ShapeArg>,
  pub rearm: Option<RearmArg>,
  pub events: Vec<Event>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEntry {
  Settle {
    wave: usize,
    values: Aggregate<Value>,
  },
  Teardown {
    wave: usize,
  },
  Snapshot {
    values: Slots<Value>,
    pending: usize,
    mounted: usize,
  },
  Error {
    index: usize,
    code: &'static str,
    message: String,
  },
}

#[derive(Debug, Serialize)]
pub struct Report {
  pub schema_version: u32,
  pub shape: Shape,
  pub log: Vec<LogEntry>,
}

/// Problems with the script itself. These abort the replay.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
  #[error("event {index}: `{key}` has no setter; register it first")]
  UnknownSetter { index: usize, key: String },
  #[error("event {index}: `{key}` has no release handle; it was never settled or is already released")]
  UnknownHandle { index: usize, key: String },
  #[error("event {index}: {source}")]
  Key {
    index: usize,
    #[source]
    source: AggregateError,
  },
}

impl ScriptError {
  pub fn code(&self) -> &'static str {
    match self {
      ScriptError::UnknownSetter { .. } => "RC0003",
      ScriptError::UnknownHandle { .. } => "RC0004",
      ScriptError::Key { .. } => "RC0005",
    }
  }
}

struct Replay {
  refs: Aggregator<Value>,
  log: Rc<RefCell<Vec<LogEntry>>>,
  setters: HashMap<Key, Setter<Value>>,
  handles: HashMap<Key, ReleaseHandle<Value>>,
  root: Option<RootSetter<Value>>,
}

impl Replay {
  fn new(options: AggregatorOptions) -> Replay {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    let refs = Aggregator::with_options(options, move |refs: &Aggregator<Value>, values| {
      let wave = refs.waves();
      sink.borrow_mut().push(LogEntry::Settle { wave, values });
      let sink = sink.clone();
      Some(Box::new(move || sink.borrow_mut().push(LogEntry::Teardown { wave })) as Teardown)
    });
    Replay {
      refs,
      log,
      setters: HashMap::default(),
      handles: HashMap::default(),
      root: None,
    }
  }

  fn coerce(&self, index: usize, key: ScriptKey) -> Result<Key, ScriptError> {
    RawKey::from(key)
      .coerce(self.refs.shape())
      .map_err(|source| ScriptError::Key { index, source })
  }

  fn record_error(&self, index: usize, err: AggregateError) {
    debug!(index, code = err.code(), "aggregator rejected event");
    self.log.borrow_mut().push(LogEntry::Error {
      index,
      code: err.code(),
      message: err.to_string(),
    });
  }

  fn keep(&mut self, key: Key, outcome: WriteOutcome<Value>) {
    if let Some(handle) = outcome.into_release() {
      self.handles.insert(key, handle);
    }
  }

  fn apply(&mut self, index: usize, event: Event) -> Result<(), ScriptError> {
    match event {
      Event::Register { key } => match self.refs.register(key) {
        Ok(setter) => {
          self.setters.insert(setter.key().clone(), setter);
        }
        Err(err) => self.record_error(index, err),
      },
      Event::Set { key, value } => {
        let key = self.coerce(index, key)?;
        let outcome = self
          .setters
          .get(&key)
          .ok_or_else(|| ScriptError::UnknownSetter {
            index,
            key: key.to_string(),
          })?
          .set(value);
        self.keep(key, outcome);
      }
      Event::Release { key } => {
        let key = self.coerce(index, key)?;
        self.release(index, key)?;
      }
      Event::RegisterRoot => match self.refs.register_root() {
        Ok(root) => self.root = Some(root),
        Err(err) => self.record_error(index, err),
      },
      Event::SettleRoot => {
        let outcome = self
          .root
          .as_ref()
          .ok_or_else(|| ScriptError::UnknownSetter {
            index,
            key: Key::Root.to_string(),
          })?
          .settle();
        self.keep(Key::Root, outcome);
      }
      Event::ReleaseRoot => self.release(index, Key::Root)?,
      Event::Snapshot => {
        let entry = LogEntry::Snapshot {
          values: self.refs.snapshot(),
          pending: self.refs.pending(),
          mounted: self.refs.mounted(),
        };
        self.log.borrow_mut().push(entry);
      }
    }
    Ok(())
  }

  fn release(&mut self, index: usize, key: Key) -> Result<(), ScriptError> {
    let handle = self
      .handles
      .remove(&key)
      .ok_or_else(|| ScriptError::UnknownHandle {
        index,
        key: key.to_string(),
      })?;
    handle.release();
    Ok(())
  }
}

/// Replays `script` against a fresh aggregator and returns everything it observed.
pub fn replay(script: Script, options: AggregatorOptions) -> Result<Report, ScriptError> {
  let shape = options.shape;
  let mut replay = Replay::new(options);
  for (index, event) in script.events.into_iter().enumerate() {
    replay.apply(index, event)?;
  }
  let log = replay.log.take();
  Ok(Report {
    schema_version: 1,
    shape,
    log,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn script(json: &str) -> Script {
    serde_json::from_str(json).expect("valid script")
  }

  fn run(json: &str, shape: Shape) -> Report {
    replay(script(json), AggregatorOptions::new(shape)).expect("replay succeeds")
  }

  #[test]
  fn replays_sequence_density_example() {
    let report = run(
      r#"{"events": [
        {"op": "register", "key": 2},
        {"op": "register", "key": 0},
        {"op": "register", "key": 5},
        {"op": "set", "key": 2, "value": "a"},
        {"op": "set", "key": 0, "value": "b"},
        {"op": "set", "key": 5, "value": "c"}
      ]}"#,
      Shape::Sequence,
    );
    assert_eq!(report.log.len(), 1);
    let LogEntry::Settle { wave, values } = &report.log[0] else {
      panic!("expected settle entry, got {:?}", report.log[0]);
    };
    assert_eq!(*wave, 1);
    let json = serde_json::to_value(values).unwrap();
    assert_eq!(json, serde_json::json!(["b", null, "a", null, null, "c"]));
  }

  #[test]
  fn records_aggregator_errors_and_continues() {
    let report = run(
      r#"{"events": [
        {"op": "register", "key": -1},
        {"op": "register", "key": 0},
        {"op": "snapshot"}
      ]}"#,
      Shape::Sequence,
    );
    assert!(matches!(
      &report.log[0],
      LogEntry::Error { index: 0, code: "RA0001", .. }
    ));
    assert!(matches!(
      &report.log[1],
      LogEntry::Snapshot {
        pending: 1,
        mounted: 1,
        ..
      }
    ));
  }

  #[test]
  fn teardown_is_logged_after_last_release() {
    let report = run(
      r#"{"events": [
        {"op": "register", "key": "a"},
        {"op": "register_root"},
        {"op": "set", "key": "a", "value": {"id": 1}},
        {"op": "settle_root"},
        {"op": "release", "key": "a"},
        {"op": "release_root"}
      ]}"#,
      Shape::Mapping,
    );
    assert_eq!(report.log.len(), 2);
    assert!(matches!(report.log[0], LogEntry::Settle { wave: 1, .. }));
    assert!(matches!(report.log[1], LogEntry::Teardown { wave: 1 }));
  }

  #[test]
  fn releasing_twice_is_a_script_error() {
    let err = replay(
      script(
        r#"{"events": [
          {"op": "register", "key": "a"},
          {"op": "set", "key": "a", "value": 1},
          {"op": "release", "key": "a"},
          {"op": "release", "key": "a"}
        ]}"#,
      ),
      AggregatorOptions::new(Shape::Mapping),
    )
    .unwrap_err();
    assert!(matches!(err, ScriptError::UnknownHandle { index: 3, .. }));
    assert_eq!(err.code(), "RC0004");
  }

  #[test]
  fn set_without_register_is_a_script_error() {
    let err = replay(
      script(r#"{"events": [{"op": "set", "key": 0, "value": 1}]}"#),
      AggregatorOptions::new(Shape::Sequence),
    )
    .unwrap_err();
    assert!(matches!(err, ScriptError::UnknownSetter { index: 0, .. }));
  }

  #[test]
  fn reject_policy_is_reported_per_event() {
    let report = replay(
      script(
        r#"{"events": [
          {"op": "register", "key": 0},
          {"op": "set", "key": 0, "value": 1},
          {"op": "register", "key": 1}
        ]}"#,
      ),
      AggregatorOptions::new(Shape::Sequence).with_rearm(RearmPolicy::Reject),
    )
    .unwrap();
    assert!(matches!(
      &report.log[1],
      LogEntry::Error { index: 2, code: "RA0002", .. }
    ));
  }
}
