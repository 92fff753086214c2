//! Sink operators that deliver stream values to user callbacks.

use crate::{
    circuit::{
        operator_traits::{Data, Operator, SinkOperator},
        NodeId, Stream,
    },
    error::StepError,
};
use std::{borrow::Cow, marker::PhantomData};

impl<D> Stream<D>
where
    D: Data,
{
    /// Apply `callback` to every value in the stream.
    ///
    /// The callback fires after the whole step has been evaluated and
    /// committed; an aborted step delivers nothing.
    pub fn inspect<F>(&self, mut callback: F) -> NodeId
    where
        F: FnMut(&D) + 'static,
    {
        self.output(move |value| {
            callback(value);
            Ok(())
        })
    }

    /// Like [`inspect`](Self::inspect) but the callback may fail.  A failing
    /// sink is recorded against that sink only; other sinks on the same
    /// stream still fire and circuit state is unaffected.
    pub fn output<F>(&self, callback: F) -> NodeId
    where
        F: FnMut(&D) -> Result<(), StepError> + 'static,
    {
        self.circuit().add_sink(Inspect::new(callback), self)
    }
}

/// Sink operator that consumes a stream of values of type `T` and applies a
/// user-provided callback to each input.
pub struct Inspect<T, F> {
    callback: F,
    phantom: PhantomData<T>,
}

impl<T, F> Inspect<T, F>
where
    F: FnMut(&T) -> Result<(), StepError>,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            phantom: PhantomData,
        }
    }
}

impl<T, F> Operator for Inspect<T, F>
where
    T: 'static,
    F: FnMut(&T) -> Result<(), StepError> + 'static,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from("Inspect")
    }
}

impl<T, F> SinkOperator<T> for Inspect<T, F>
where
    T: 'static,
    F: FnMut(&T) -> Result<(), StepError> + 'static,
{
    fn eval(&mut self, input: &T) -> Result<(), StepError> {
        (self.callback)(input)
    }
}
