//! Stream operators.
//!
//! Each submodule pairs an operator implementation with the
//! [`Stream`](crate::circuit::Stream) extension methods that instantiate it.

pub mod aggregate;
pub mod differentiate;
pub mod distinct;
pub mod filter_map;
pub mod generator;
pub mod inspect;
pub mod integrate;
pub mod join;
pub mod semijoin;
pub mod union;

pub use aggregate::{global_group, group_by_columns, AggInputFunc, AggKind, AggSpec, Aggregate};
pub use differentiate::Differentiate;
pub use distinct::DistinctIncremental;
pub use filter_map::{Filter, FlatMap, Map};
pub use generator::Generator;
pub use inspect::Inspect;
pub use integrate::Integrate;
pub use join::{
    column_key, concat_rows, fingerprint_key, JoinAppendOnly, JoinFunc, JoinIndexed, JoinMode,
    KeyFunc,
};
pub use semijoin::SemiJoin;
pub use union::{Neg, Union};
