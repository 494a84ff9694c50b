use crate::key::Key;
use crate::options::Shape;
use ahash::HashMap;
use serde::Serialize;

/// The observable state of one slot.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState<T> {
  /// A sequence index below the highest registered index that has never been registered itself.
  Hole,
  /// Registered, still waiting for its first value.
  Unwritten,
  /// Holds the most recently written value.
  Value(T),
}

impl<T> SlotState<T> {
  pub fn is_hole(&self) -> bool {
    matches!(self, SlotState::Hole)
  }

  pub fn is_unwritten(&self) -> bool {
    matches!(self, SlotState::Unwritten)
  }

  pub fn value(&self) -> Option<&T> {
    match self {
      SlotState::Value(value) => Some(value),
      _ => None,
    }
  }
}

/// A copy of an aggregator's container, as returned by
/// [`Aggregator::snapshot`](crate::Aggregator::snapshot).
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
#[serde(untagged)]
pub enum Slots<T> {
  Sequence(Vec<SlotState<T>>),
  Mapping(HashMap<String, SlotState<T>>),
}

impl<T> Slots<T> {
  pub fn len(&self) -> usize {
    match self {
      Slots::Sequence(slots) => slots.len(),
      Slots::Mapping(slots) => slots.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn get(&self, key: &Key) -> Option<&SlotState<T>> {
    match (self, key) {
      (Slots::Sequence(slots), Key::Index(index)) => slots.get(*index as usize),
      (Slots::Mapping(slots), Key::Name(name)) => slots.get(name),
      _ => None,
    }
  }
}

/// The settled container handed to the settle callback.
///
/// Sequence holes are delivered as `None`, which stays distinct from a `T` that itself represents an
/// absent value.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
#[serde(untagged)]
pub enum Aggregate<T> {
  Sequence(Vec<Option<T>>),
  Mapping(HashMap<String, T>),
}

impl<T> Aggregate<T> {
  pub fn as_sequence(&self) -> Option<&[Option<T>]> {
    match self {
      Aggregate::Sequence(values) => Some(values),
      Aggregate::Mapping(_) => None,
    }
  }

  pub fn as_mapping(&self) -> Option<&HashMap<String, T>> {
    match self {
      Aggregate::Mapping(values) => Some(values),
      Aggregate::Sequence(_) => None,
    }
  }

  pub fn len(&self) -> usize {
    match self {
      Aggregate::Sequence(values) => values.len(),
      Aggregate::Mapping(values) => values.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[derive(Debug)]
pub(crate) struct Slot<T> {
  pub state: SlotState<T>,
  pub released: bool,
}

impl<T> Slot<T> {
  pub fn hole() -> Self {
    Slot {
      state: SlotState::Hole,
      released: false,
    }
  }

  pub fn unwritten() -> Self {
    Slot {
      state: SlotState::Unwritten,
      released: false,
    }
  }
}

/// Backing storage for non-root slots.
#[derive(Debug)]
pub(crate) enum Table<T> {
  Sequence(Vec<Slot<T>>),
  Mapping(HashMap<String, Slot<T>>),
}

impl<T> Table<T> {
  pub fn new(shape: Shape) -> Self {
    match shape {
      Shape::Sequence => Table::Sequence(Vec::new()),
      Shape::Mapping => Table::Mapping(HashMap::default()),
    }
  }

  /// Returns the allocated slot for `key`. Holes are not allocated.
  pub fn slot_mut(&mut self, key: &Key) -> Option<&mut Slot<T>> {
    match (self, key) {
      (Table::Sequence(slots), Key::Index(index)) => slots
        .get_mut(*index as usize)
        .filter(|slot| !slot.state.is_hole()),
      (Table::Mapping(slots), Key::Name(name)) => slots.get_mut(name),
      _ => None,
    }
  }

  pub fn contains(&self, key: &Key) -> bool {
    match (self, key) {
      (Table::Sequence(slots), Key::Index(index)) => slots
        .get(*index as usize)
        .is_some_and(|slot| !slot.state.is_hole()),
      (Table::Mapping(slots), Key::Name(name)) => slots.contains_key(name),
      _ => false,
    }
  }

  /// Allocates an unwritten slot for `key`, back-filling holes in a sequence.
  pub fn insert(&mut self, key: &Key) {
    match (self, key) {
      (Table::Sequence(slots), Key::Index(index)) => {
        let index = *index as usize;
        if slots.len() <= index {
          slots.resize_with(index + 1, Slot::hole);
        }
        slots[index] = Slot::unwritten();
      }
      (Table::Mapping(slots), Key::Name(name)) => {
        slots.insert(name.clone(), Slot::unwritten());
      }
      // Keys are coerced to the table's shape before they get here.
      _ => debug_assert!(false, "key {key} does not address this table"),
    }
  }
}

impl<T: Clone> Table<T> {
  pub fn snapshot(&self) -> Slots<T> {
    match self {
      Table::Sequence(slots) => {
        Slots::Sequence(slots.iter().map(|slot| slot.state.clone()).collect())
      }
      Table::Mapping(slots) => Slots::Mapping(
        slots
          .iter()
          .map(|(name, slot)| (name.clone(), slot.state.clone()))
          .collect(),
      ),
    }
  }

  /// Builds the container delivered on settlement. Only called once no slot is unwritten.
  pub fn aggregate(&self) -> Aggregate<T> {
    match self {
      Table::Sequence(slots) => Aggregate::Sequence(
        slots
          .iter()
          .map(|slot| slot.state.value().cloned())
          .collect(),
      ),
      Table::Mapping(slots) => Aggregate::Mapping(
        slots
          .iter()
          .filter_map(|(name, slot)| slot.state.value().map(|value| (name.clone(), value.clone())))
          .collect(),
      ),
    }
  }
}
