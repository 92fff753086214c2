//! The circuit: a dataflow graph of operators connected by streams,
//! executed one step at a time.

mod circuit_builder;
pub mod operator_traits;
pub(crate) mod schedule;

pub use circuit_builder::{Circuit, InputHandle, NodeId, Root, Stream};
