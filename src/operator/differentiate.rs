//! Differentiation operator.

use crate::{
    algebra::GroupValue,
    circuit::{
        operator_traits::{Data, Operator, UnaryOperator},
        Stream,
    },
    error::StepError,
};
use std::borrow::Cow;

impl<D> Stream<D>
where
    D: GroupValue + Data,
{
    /// Differentiate the stream: the output at step `t` is
    /// `input[t] - input[t-1]`.  Inverse of
    /// [`integrate`](Stream::integrate).
    pub fn differentiate(&self) -> Stream<D> {
        self.circuit()
            .add_unary_operator(Differentiate::new(), self)
    }
}

/// Emits the difference between the current and the previous input value.
pub struct Differentiate<D> {
    previous: D,
    /// Output of the current step; subtracted back out of `previous` when
    /// the step aborts.
    last_output: Option<D>,
}

impl<D> Differentiate<D>
where
    D: GroupValue,
{
    pub fn new() -> Self {
        Self {
            previous: D::zero(),
            last_output: None,
        }
    }
}

impl<D> Default for Differentiate<D>
where
    D: GroupValue,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Operator for Differentiate<D>
where
    D: GroupValue,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from("Differentiate")
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn commit(&mut self) {
        self.last_output = None;
    }

    fn abort(&mut self) {
        if let Some(output) = self.last_output.take() {
            self.previous += -output;
        }
    }

    fn reset(&mut self) {
        self.previous = D::zero();
        self.last_output = None;
    }
}

impl<D> UnaryOperator<D, D> for Differentiate<D>
where
    D: GroupValue + Data,
{
    fn eval(&mut self, input: &D) -> Result<D, StepError> {
        let mut output = input.clone();
        output += -self.previous.clone();
        self.previous = input.clone();
        self.last_output = Some(output.clone());
        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use crate::{circuit::Root, operator::Generator, zset};
    use std::{cell::RefCell, rc::Rc};

    // Differentiation undoes integration: d(I(s)) == s.
    #[test]
    fn differentiate_inverts_integrate() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_clone = observed.clone();

        let inputs = vec![
            zset! { 1 => 1, 2 => 1 },
            zset! { 2 => -1, 3 => 2 },
            zset! {},
            zset! { 1 => -1 },
        ];
        let expected = inputs.clone();

        let (mut root, ()) = Root::build(|circuit| {
            let mut feed = inputs.into_iter();
            circuit
                .add_source(Generator::new(move || feed.next().unwrap()))
                .integrate()
                .differentiate()
                .inspect(move |delta| observed_clone.borrow_mut().push(delta.clone()));
            Ok(())
        })
        .unwrap();

        for _ in 0..4 {
            root.step().unwrap();
        }
        assert_eq!(observed.borrow().as_slice(), expected.as_slice());
    }
}
