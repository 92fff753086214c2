//! Integration operator.

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
    /// Integrate the stream: the output at step `t` is the sum of all inputs
    /// up to and including `t`.
    pub fn integrate(&self) -> Stream<D> {
        self.circuit().add_unary_operator(Integrate::new(), self)
    }
}

/// Maintains the running sum of its input stream.
///
/// The state update costs O(|delta|); the emitted value is a snapshot of the
/// integral.  Inverse of [`Differentiate`](crate::operator::Differentiate).
pub struct Integrate<D> {
    integral: D,
    /// Delta applied during the current step, kept until commit so an
    /// aborted step can subtract it back out.
    last_delta: Option<D>,
}

impl<D> Integrate<D>
where
    D: GroupValue,
{
    pub fn new() -> Self {
        Self {
            integral: D::zero(),
            last_delta: None,
        }
    }
}

impl<D> Default for Integrate<D>
where
    D: GroupValue,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Operator for Integrate<D>
where
    D: GroupValue,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from("Integrate")
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn commit(&mut self) {
        self.last_delta = None;
    }

    fn abort(&mut self) {
        if let Some(delta) = self.last_delta.take() {
            self.integral += -delta;
        }
    }

    fn reset(&mut self) {
        self.integral = D::zero();
        self.last_delta = None;
    }
}

impl<D> UnaryOperator<D, D> for Integrate<D>
where
    D: GroupValue + Data,
{
    fn eval(&mut self, delta: &D) -> Result<D, StepError> {
        self.integral += delta.clone();
        self.last_delta = Some(delta.clone());
        Ok(self.integral.clone())
    }
}

#[cfg(test)]
mod test {
    use crate::{circuit::Root, operator::Generator, zset};
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn integral_accumulates() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_clone = observed.clone();

        let (mut root, ()) = Root::build(|circuit| {
            let mut inputs = vec![
                zset! { "a" => 1 },
                zset! { "b" => 2 },
                zset! { "a" => -1 },
            ]
            .into_iter();
            circuit
                .add_source(Generator::new(move || inputs.next().unwrap()))
                .integrate()
                .inspect(move |total| observed_clone.borrow_mut().push(total.clone()));
            Ok(())
        })
        .unwrap();

        for _ in 0..3 {
            root.step().unwrap();
        }

        assert_eq!(
            observed.borrow().as_slice(),
            &[
                zset! { "a" => 1 },
                zset! { "a" => 1, "b" => 2 },
                zset! { "b" => 2 },
            ]
        );
    }

    #[test]
    fn scalar_integral() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_clone = observed.clone();

        let (mut root, ()) = Root::build(|circuit| {
            let mut n = 0i64;
            circuit
                .add_source(Generator::new(move || {
                    n += 1;
                    n
                }))
                .integrate()
                .inspect(move |total| observed_clone.borrow_mut().push(*total));
            Ok(())
        })
        .unwrap();

        for _ in 0..4 {
            root.step().unwrap();
        }
        assert_eq!(observed.borrow().as_slice(), &[1, 3, 6, 10]);
    }
}
