//! Algebraic building blocks for delta streams.
//!
//! Stateful operators accumulate deltas with `+=`, treat an input that was
//! not fed this step as a zero value, and undo an aborted step by adding
//! back the negation of whatever they applied.  [`MonoidValue`] and
//! [`GroupValue`] name exactly those capabilities, so operators like
//! `Integrate`, `Differentiate`, and `Union` are written once and work for
//! plain weights, [`ZSet`]s, and any other payload of the same shape.

#[macro_use]
mod zset_macro;
mod zset;

pub use zset::ZSet;

use num::Zero;
use std::ops::{Add, AddAssign, Neg};

/// Weight of a Z-set entry.
///
/// Signed, so a deletion is just a negative multiplicity; zero means the
/// element is absent, and Z-sets prune zero weights on every update.
pub type ZWeight = i64;

/// A payload that accumulates: addition with a zero element.
///
/// The zero value is also what a named input produces on steps it was not
/// fed.
pub trait MonoidValue: Clone + Add<Output = Self> + AddAssign + Zero + 'static {}

impl<T> MonoidValue for T where T: Clone + Add<Output = Self> + AddAssign + Zero + 'static {}

/// An accumulating payload whose updates can be retracted: applying `-x`
/// after `x` restores the previous state.  Stream retractions and the step
/// abort path both depend on this.
pub trait GroupValue: MonoidValue + Neg<Output = Self> {}

impl<T> GroupValue for T where T: MonoidValue + Neg<Output = Self> {}
