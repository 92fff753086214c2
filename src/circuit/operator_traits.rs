//! Common traits for circuit operators.
//!
//! An operator consumes one value from each of its input streams per step and
//! produces one output value.  Stateful operators additionally participate in
//! the step commit protocol: the scheduler evaluates every node, and only
//! once the whole step has succeeded asks operators to [`commit`] their
//! pending state changes.  If any node fails, already-evaluated operators
//! [`abort`] instead, restoring their pre-step state.
//!
//! [`commit`]: Operator::commit
//! [`abort`]: Operator::abort

use crate::error::StepError;
use std::borrow::Cow;

/// Trait bound on stream payloads.
pub trait Data: Clone + 'static {}

impl<T: Clone + 'static> Data for T {}

/// Minimal requirements for objects that can be schedulable circuit
/// operators.
pub trait Operator: 'static {
    fn name(&self) -> Cow<'static, str>;

    /// True for operators that own mutable state spanning steps.
    fn is_stateful(&self) -> bool {
        false
    }

    /// Make the current step's state changes permanent.
    fn commit(&mut self) {}

    /// Discard the current step's state changes because a later node failed;
    /// after this call the operator's state is as it was before the step.
    fn abort(&mut self) {}

    /// Return the operator to its initial state.
    fn reset(&mut self) {}
}

/// A source operator that injects values into a stream.  Sources are
/// evaluated first on every step and cannot fail.
pub trait SourceOperator<O>: Operator {
    fn eval(&mut self) -> O;
}

/// An operator with a single input stream.
pub trait UnaryOperator<I, O>: Operator {
    fn eval(&mut self, input: &I) -> Result<O, StepError>;
}

/// An operator with two input streams.
pub trait BinaryOperator<I1, I2, O>: Operator {
    fn eval(&mut self, left: &I1, right: &I2) -> Result<O, StepError>;
}

/// A sink: consumes its input and produces no output stream.  Sinks run
/// after every operator has been evaluated and committed; a failing sink is
/// recorded against that sink only and never aborts the step.
pub trait SinkOperator<I>: Operator {
    fn eval(&mut self, input: &I) -> Result<(), StepError>;
}
