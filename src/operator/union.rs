//! Union and negation.
//!
//! On Z-sets, `UNION ALL` is exactly pointwise addition, so the operators
//! here work on any commutative group payload.  `UNION` (set semantics) is
//! union followed by incremental distinct and is assembled by the SQL
//! compiler.

use crate::{
    algebra::{GroupValue, MonoidValue},
    circuit::{
        operator_traits::{BinaryOperator, Data, Operator, UnaryOperator},
        Stream,
    },
    error::StepError,
};
use std::{borrow::Cow, marker::PhantomData};

impl<D> Stream<D>
where
    D: MonoidValue + Data,
{
    /// Pointwise sum of `self` and `other`.
    pub fn union(&self, other: &Self) -> Self {
        self.circuit().add_binary_operator(Union::new(), self, other)
    }
}

impl<D> Stream<D>
where
    D: GroupValue + Data,
{
    /// Negate every weight.
    pub fn neg(&self) -> Self {
        self.circuit().add_unary_operator(Neg::new(), self)
    }
}

/// Operator that computes the pointwise sum of its two input streams.
pub struct Union<D> {
    _type: PhantomData<D>,
}

impl<D> Union<D> {
    pub fn new() -> Self {
        Self { _type: PhantomData }
    }
}

impl<D> Default for Union<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Operator for Union<D>
where
    D: 'static,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from("Union")
    }
}

impl<D> BinaryOperator<D, D, D> for Union<D>
where
    D: MonoidValue + Data,
{
    fn eval(&mut self, left: &D, right: &D) -> Result<D, StepError> {
        Ok(left.clone() + right.clone())
    }
}

/// Operator that negates its input.
pub struct Neg<D> {
    _type: PhantomData<D>,
}

impl<D> Neg<D> {
    pub fn new() -> Self {
        Self { _type: PhantomData }
    }
}

impl<D> Default for Neg<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Operator for Neg<D>
where
    D: 'static,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from("Neg")
    }
}

impl<D> UnaryOperator<D, D> for Neg<D>
where
    D: GroupValue + Data,
{
    fn eval(&mut self, input: &D) -> Result<D, StepError> {
        Ok(-input.clone())
    }
}
