use crate::error::AggregateError;
use crate::error::AggregateResult;
use crate::key::Key;
use crate::key::RawKey;
use crate::options::AggregatorOptions;
use crate::options::RearmPolicy;
use crate::options::Shape;
use crate::slot::Aggregate;
use crate::slot::Slot;
use crate::slot::SlotState;
use crate::slot::Slots;
use crate::slot::Table;
use core::fmt;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;
use tracing::debug_span;
use tracing::trace;

/// Invoked once when every mounted slot has been released after a settlement.
pub type Teardown = Box<dyn FnOnce()>;

type OnSettle<T> = Box<dyn FnMut(&Aggregator<T>, Aggregate<T>) -> Option<Teardown>>;

struct State<T> {
  options: AggregatorOptions,
  table: Table<T>,
  root: Option<Slot<()>>,
  // Slots registered but not yet written.
  pending: usize,
  // Slots registered but not yet released.
  mounted: usize,
  waves: usize,
  teardown: Option<Teardown>,
  // A zero-crossing of `pending` happened while the settle callback was running.
  wave_queued: bool,
}

impl<T> State<T> {
  fn contains(&self, key: &Key) -> bool {
    match key {
      Key::Root => self.root.is_some(),
      _ => self.table.contains(key),
    }
  }

  /// Allocates a slot for `key` unless one already exists. Returns whether a slot was allocated.
  fn allocate(&mut self, key: &Key) -> AggregateResult<bool> {
    if self.contains(key) {
      return Ok(false);
    }
    if self.waves > 0 && self.options.rearm == RearmPolicy::Reject {
      return Err(AggregateError::Settled { key: key.clone() });
    }
    match key {
      Key::Root => self.root = Some(Slot::unwritten()),
      _ => self.table.insert(key),
    }
    self.pending += 1;
    self.mounted += 1;
    Ok(true)
  }

  /// Records a write. Returns `Some(true)` if this was the slot's first write.
  fn store(&mut self, key: &Key, value: Option<T>) -> Option<bool> {
    let first = match key {
      Key::Root => {
        let slot = self.root.as_mut()?;
        let first = slot.state.is_unwritten();
        slot.state = SlotState::Value(());
        first
      }
      _ => {
        let slot = self.table.slot_mut(key)?;
        let first = slot.state.is_unwritten();
        if let Some(value) = value {
          slot.state = SlotState::Value(value);
        }
        first
      }
    };
    if first {
      self.pending -= 1;
    }
    Some(first)
  }

  fn mark_released(&mut self, key: &Key) {
    let released = match key {
      Key::Root => self.root.as_mut().map(|slot| &mut slot.released),
      _ => self.table.slot_mut(key).map(|slot| &mut slot.released),
    };
    if let Some(released) = released {
      debug_assert!(!*released, "slot {key} released twice");
      *released = true;
    }
  }

  fn is_released(&self, key: &Key) -> bool {
    match (key, &self.table) {
      (Key::Root, _) => self.root.as_ref().is_some_and(|slot| slot.released),
      (Key::Index(index), Table::Sequence(slots)) => slots
        .get(*index as usize)
        .is_some_and(|slot| slot.released),
      (Key::Name(name), Table::Mapping(slots)) => {
        slots.get(name).is_some_and(|slot| slot.released)
      }
      _ => false,
    }
  }
}

struct Inner<T> {
  state: RefCell<State<T>>,
  // Taken out while it runs so that re-entrant calls can borrow `state`.
  on_settle: RefCell<Option<OnSettle<T>>>,
}

/// Merges refs from a dynamic set of child slots into one aggregate.
///
/// Every registered slot must receive a first value before the aggregate settles; the settle
/// callback then receives the whole container. Every settled slot hands out one
/// [`ReleaseHandle`]; once all of them have been released, the teardown returned by the settle
/// callback runs.
///
/// Cloning an `Aggregator` clones the handle, not the state.
pub struct Aggregator<T> {
  inner: Rc<Inner<T>>,
}

impl<T> Clone for Aggregator<T> {
  fn clone(&self) -> Self {
    Aggregator {
      inner: self.inner.clone(),
    }
  }
}

impl<T: Clone + 'static> Aggregator<T> {
  pub fn new<F>(shape: Shape, on_settle: F) -> Self
  where
    F: FnMut(&Aggregator<T>, Aggregate<T>) -> Option<Teardown> + 'static,
  {
    Self::with_options(AggregatorOptions::new(shape), on_settle)
  }

  pub fn sequence<F>(on_settle: F) -> Self
  where
    F: FnMut(&Aggregator<T>, Aggregate<T>) -> Option<Teardown> + 'static,
  {
    Self::new(Shape::Sequence, on_settle)
  }

  pub fn mapping<F>(on_settle: F) -> Self
  where
    F: FnMut(&Aggregator<T>, Aggregate<T>) -> Option<Teardown> + 'static,
  {
    Self::new(Shape::Mapping, on_settle)
  }

  pub fn with_options<F>(options: AggregatorOptions, on_settle: F) -> Self
  where
    F: FnMut(&Aggregator<T>, Aggregate<T>) -> Option<Teardown> + 'static,
  {
    let state = State {
      table: Table::new(options.shape),
      options,
      root: None,
      pending: 0,
      mounted: 0,
      waves: 0,
      teardown: None,
      wave_queued: false,
    };
    Aggregator {
      inner: Rc::new(Inner {
        state: RefCell::new(state),
        on_settle: RefCell::new(Some(Box::new(on_settle))),
      }),
    }
  }

  pub fn shape(&self) -> Shape {
    self.inner.state.borrow().options.shape
  }

  pub fn options(&self) -> AggregatorOptions {
    self.inner.state.borrow().options.clone()
  }

  /// Copies the current container. Holes stay [`SlotState::Hole`]; they are only normalized in the
  /// container delivered to the settle callback.
  pub fn snapshot(&self) -> Slots<T> {
    self.inner.state.borrow().table.snapshot()
  }

  /// Number of registered slots still waiting for their first value, root included.
  pub fn pending(&self) -> usize {
    self.inner.state.borrow().pending
  }

  /// Number of registered slots not yet released, root included.
  pub fn mounted(&self) -> usize {
    self.inner.state.borrow().mounted
  }

  /// Number of times the settle callback has fired.
  pub fn waves(&self) -> usize {
    self.inner.state.borrow().waves
  }

  pub fn has_root(&self) -> bool {
    self.inner.state.borrow().root.is_some()
  }

  /// Whether at least one wave has fired and no slot is waiting for a value.
  pub fn is_settled(&self) -> bool {
    let state = self.inner.state.borrow();
    state.waves > 0 && state.pending == 0
  }

  /// Whether the release handle of the slot for `key` has been consumed.
  pub fn is_released(&self, key: &Key) -> bool {
    self.inner.state.borrow().is_released(key)
  }

  /// Allocates the root slot on first call. Later calls return an equivalent setter without
  /// counting the slot again.
  pub fn register_root(&self) -> AggregateResult<RootSetter<T>> {
    let key = Key::Root;
    let allocated = self.inner.state.borrow_mut().allocate(&key)?;
    self.trace_registration(&key, allocated);
    Ok(RootSetter {
      inner: self.inner.clone(),
    })
  }

  /// Returns a setter for `key`, allocating its slot on first registration.
  ///
  /// Sequence aggregators reject keys that do not coerce to a non-negative `u32`; the container is
  /// left untouched in that case.
  pub fn register(&self, key: impl Into<RawKey>) -> AggregateResult<Setter<T>> {
    let key = {
      let mut state = self.inner.state.borrow_mut();
      let raw: RawKey = key.into();
      let key = raw.coerce(state.options.shape)?;
      let allocated = state.allocate(&key)?;
      drop(state);
      self.trace_registration(&key, allocated);
      key
    };
    Ok(Setter {
      inner: self.inner.clone(),
      key,
    })
  }

  fn trace_registration(&self, key: &Key, allocated: bool) {
    let state = self.inner.state.borrow();
    if allocated {
      trace!(
        key = %key,
        pending = state.pending,
        mounted = state.mounted,
        "allocated slot"
      );
    } else {
      trace!(key = %key, "slot already allocated");
    }
  }
}

impl<T> fmt::Debug for Aggregator<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.borrow();
    f.debug_struct("Aggregator")
      .field("shape", &state.options.shape)
      .field("pending", &state.pending)
      .field("mounted", &state.mounted)
      .field("waves", &state.waves)
      .field("has_root", &state.root.is_some())
      .finish()
  }
}

impl<T: Clone + 'static> Inner<T> {
  fn write(self: &Rc<Self>, key: &Key, value: Option<T>) -> WriteOutcome<T> {
    let stored = {
      let mut state = self.state.borrow_mut();
      let stored = state.store(key, value);
      stored.map(|first| (first, first && state.pending == 0, state.pending))
    };
    // Setters are only created after their slot is allocated and slots are never removed.
    let Some((first, settled, pending)) = stored else {
      debug_assert!(false, "write to unallocated slot {key}");
      return WriteOutcome::AlreadySettled;
    };
    if !first {
      trace!(key = %key, "updated settled slot");
      return WriteOutcome::AlreadySettled;
    }
    trace!(key = %key, pending, "slot settled");
    if settled {
      self.settle();
    }
    WriteOutcome::FirstSettle(ReleaseHandle {
      inner: self.clone(),
      key: key.clone(),
    })
  }

  fn settle(self: &Rc<Self>) {
    let Some(mut on_settle) = self.on_settle.borrow_mut().take() else {
      // The callback is running further up the stack; it fires this wave once it returns.
      self.state.borrow_mut().wave_queued = true;
      return;
    };
    let aggregator = Aggregator {
      inner: self.clone(),
    };
    loop {
      let (stale, wave) = {
        let mut state = self.state.borrow_mut();
        state.waves += 1;
        (state.teardown.take(), state.waves)
      };
      if let Some(stale) = stale {
        debug!(wave, "tearing down previous wave before re-settling");
        stale();
      }
      // The stale teardown may have written into the container.
      let (aggregate, shape) = {
        let state = self.state.borrow();
        (state.table.aggregate(), state.options.shape)
      };
      let teardown = {
        let span = debug_span!("settle", wave, ?shape, len = aggregate.len());
        let _guard = span.enter();
        let teardown = on_settle(&aggregator, aggregate);
        debug!(has_teardown = teardown.is_some(), "aggregate settled");
        teardown
      };
      let mut state = self.state.borrow_mut();
      state.teardown = teardown;
      let again = state.wave_queued && state.pending == 0;
      state.wave_queued = false;
      if !again {
        break;
      }
    }
    *self.on_settle.borrow_mut() = Some(on_settle);
  }

  fn release(&self, key: &Key) {
    let teardown = {
      let mut state = self.state.borrow_mut();
      state.mark_released(key);
      debug_assert!(state.mounted > 0, "release with no mounted slots");
      state.mounted = state.mounted.saturating_sub(1);
      trace!(key = %key, mounted = state.mounted, "slot released");
      if state.mounted == 0 {
        state.teardown.take()
      } else {
        None
      }
    };
    if let Some(teardown) = teardown {
      debug!("tearing down aggregate");
      teardown();
    }
  }
}

/// Writes values into one slot. Any number of setters may exist for the same slot.
pub struct Setter<T> {
  inner: Rc<Inner<T>>,
  key: Key,
}

impl<T> Setter<T> {
  pub fn key(&self) -> &Key {
    &self.key
  }
}

impl<T: Clone + 'static> Setter<T> {
  /// Stores `value` in the slot. Only the slot's first write counts towards settlement and yields a
  /// release handle; later writes just replace the stored value.
  pub fn set(&self, value: T) -> WriteOutcome<T> {
    self.inner.write(&self.key, Some(value))
  }
}

impl<T> Clone for Setter<T> {
  fn clone(&self) -> Self {
    Setter {
      inner: self.inner.clone(),
      key: self.key.clone(),
    }
  }
}

impl<T> fmt::Debug for Setter<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Setter").field("key", &self.key).finish()
  }
}

/// Settles the root slot, which carries no payload.
pub struct RootSetter<T> {
  inner: Rc<Inner<T>>,
}

impl<T: Clone + 'static> RootSetter<T> {
  pub fn settle(&self) -> WriteOutcome<T> {
    self.inner.write(&Key::Root, None)
  }
}

impl<T> Clone for RootSetter<T> {
  fn clone(&self) -> Self {
    RootSetter {
      inner: self.inner.clone(),
    }
  }
}

impl<T> fmt::Debug for RootSetter<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RootSetter").finish()
  }
}

/// Marks a settled slot as released. Only the first write to a slot produces one, and releasing
/// consumes it, so each slot is released at most once.
///
/// Dropping the handle without releasing leaves the slot mounted, and the aggregate is then never
/// torn down.
#[must_use = "dropping a release handle keeps its slot mounted forever"]
pub struct ReleaseHandle<T> {
  inner: Rc<Inner<T>>,
  key: Key,
}

impl<T> ReleaseHandle<T> {
  pub fn key(&self) -> &Key {
    &self.key
  }
}

impl<T: Clone + 'static> ReleaseHandle<T> {
  pub fn release(self) {
    self.inner.release(&self.key);
  }
}

impl<T> fmt::Debug for ReleaseHandle<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ReleaseHandle").field("key", &self.key).finish()
  }
}

/// Result of writing to a slot.
#[must_use]
#[derive(Debug)]
pub enum WriteOutcome<T> {
  /// The slot's first write.
  FirstSettle(ReleaseHandle<T>),
  /// The slot had already been written; only its value changed.
  AlreadySettled,
}

impl<T> WriteOutcome<T> {
  pub fn is_first_settle(&self) -> bool {
    matches!(self, WriteOutcome::FirstSettle(_))
  }

  pub fn into_release(self) -> Option<ReleaseHandle<T>> {
    match self {
      WriteOutcome::FirstSettle(handle) => Some(handle),
      WriteOutcome::AlreadySettled => None,
    }
  }
}
