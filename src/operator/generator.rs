//! Source operator that generates a stream of values by repeatedly calling
//! a user-provided closure.  Mostly useful in tests and examples.

use crate::circuit::operator_traits::{Operator, SourceOperator};
use std::borrow::Cow;

pub struct Generator<F> {
    generator: F,
}

impl<F> Generator<F> {
    /// Create a generator that produces the return value of `generator` on
    /// every step.
    pub fn new(generator: F) -> Self {
        Self { generator }
    }
}

impl<F> Operator for Generator<F>
where
    F: 'static,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from("Generator")
    }
}

impl<O, F> SourceOperator<O> for Generator<F>
where
    F: FnMut() -> O + 'static,
{
    fn eval(&mut self) -> O {
        (self.generator)()
    }
}
