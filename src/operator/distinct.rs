//! Incremental distinct operator.

use crate::{
    algebra::{ZSet, ZWeight},
    circuit::{
        operator_traits::{Operator, UnaryOperator},
        Stream,
    },
    error::StepError,
};
use hashbrown::HashMap;
use std::{borrow::Cow, hash::Hash};

impl<D> Stream<ZSet<D>>
where
    D: Clone + Eq + Hash + 'static,
{
    /// Incremental distinct: treats the input stream as deltas of a
    /// relation and emits deltas of the distinct relation.
    ///
    /// Equivalent to `integrate().distinct().differentiate()` but touches
    /// only elements in the support of the current delta.
    pub fn distinct_incremental(&self) -> Stream<ZSet<D>> {
        self.circuit()
            .add_unary_operator(DistinctIncremental::new(), self)
    }
}

/// Maintains the integrated weight of every element seen so far and emits
/// `+1`/`-1` only when an element's weight transitions across zero:
///
/// * `+1` when the weight goes from non-positive to positive,
/// * `-1` when it goes from positive to non-positive.
///
/// The output is set-valued (all weights in `{-1, +1}`).
pub struct DistinctIncremental<D> {
    weights: HashMap<D, ZWeight>,
    /// Deltas applied during the current step, undone on abort.
    applied: Vec<(D, ZWeight)>,
}

impl<D> DistinctIncremental<D>
where
    D: Clone + Eq + Hash + 'static,
{
    pub fn new() -> Self {
        Self {
            weights: HashMap::new(),
            applied: Vec::new(),
        }
    }

    fn apply(&mut self, value: &D, delta: ZWeight) -> (ZWeight, ZWeight) {
        let old = self.weights.get(value).copied().unwrap_or(0);
        let new = old + delta;
        if new == 0 {
            self.weights.remove(value);
        } else {
            self.weights.insert(value.clone(), new);
        }
        self.applied.push((value.clone(), delta));
        (old, new)
    }
}

impl<D> Default for DistinctIncremental<D>
where
    D: Clone + Eq + Hash + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Operator for DistinctIncremental<D>
where
    D: Clone + Eq + Hash + 'static,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from("DistinctIncremental")
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn commit(&mut self) {
        self.applied.clear();
    }

    fn abort(&mut self) {
        while let Some((value, delta)) = self.applied.pop() {
            let old = self.weights.get(&value).copied().unwrap_or(0);
            let restored = old - delta;
            if restored == 0 {
                self.weights.remove(&value);
            } else {
                self.weights.insert(value, restored);
            }
        }
    }

    fn reset(&mut self) {
        self.weights.clear();
        self.applied.clear();
    }
}

impl<D> UnaryOperator<ZSet<D>, ZSet<D>> for DistinctIncremental<D>
where
    D: Clone + Eq + Hash + 'static,
{
    fn eval(&mut self, delta: &ZSet<D>) -> Result<ZSet<D>, StepError> {
        let mut output = ZSet::new();
        for (value, weight) in delta.entries() {
            let (old, new) = self.apply(value, weight);
            if old <= 0 && new > 0 {
                output.insert(value.clone(), 1);
            } else if old > 0 && new <= 0 {
                output.insert(value.clone(), -1);
            }
        }
        Ok(output)
    }
}
