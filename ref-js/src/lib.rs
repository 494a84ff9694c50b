//! Ref aggregation for composite UI nodes.
//!
//! A composite node often needs one ref that stands for many children: several named parts of one
//! component, or every item of a list. Children mount in any order and produce their refs
//! asynchronously, so the node cannot simply read them. An [`Aggregator`] hands each child a
//! [`Setter`] for its slot and calls back once with the whole container when every registered slot
//! has its first value. Each first write yields a [`ReleaseHandle`]; when every handle has been
//! released, the teardown returned by the settle callback runs.
//!
//! ```
//! use ref_js::{Aggregate, Aggregator};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let settled = Rc::new(RefCell::new(None));
//! let sink = settled.clone();
//! let refs = Aggregator::sequence(move |_, values: Aggregate<&'static str>| {
//!   *sink.borrow_mut() = Some(values);
//!   None
//! });
//! let second = refs.register(1).unwrap();
//! let first = refs.register(0).unwrap();
//! let _h1 = second.set("b");
//! assert!(settled.borrow().is_none());
//! let _h0 = first.set("a");
//! assert_eq!(
//!   settled.borrow().as_ref().unwrap().as_sequence(),
//!   Some(&[Some("a"), Some("b")][..]),
//! );
//! ```
//!
//! # Waves
//!
//! Settlement fires on each transition of the pending count from positive to zero, and teardown on
//! each transition of the mounted count from positive to zero. Registering new slots after a
//! settlement re-arms settlement; see [`RearmPolicy`] for what happens to the previous teardown.
//!
//! Everything is single-threaded and synchronous. No borrow is held while user callbacks run, so
//! callbacks may register, write, and release re-entrantly.

mod aggregator;
mod error;
mod key;
mod options;
mod slot;

pub use crate::aggregator::Aggregator;
pub use crate::aggregator::ReleaseHandle;
pub use crate::aggregator::RootSetter;
pub use crate::aggregator::Setter;
pub use crate::aggregator::Teardown;
pub use crate::aggregator::WriteOutcome;
pub use crate::error::AggregateError;
pub use crate::error::AggregateResult;
pub use crate::error::KeyErrorReason;
pub use crate::key::Key;
pub use crate::key::RawKey;
pub use crate::key::MAX_SEQUENCE_INDEX;
pub use crate::options::AggregatorOptions;
pub use crate::options::RearmPolicy;
pub use crate::options::Shape;
pub use crate::slot::Aggregate;
pub use crate::slot::SlotState;
pub use crate::slot::Slots;
