//! Linear per-element operators: filter, map, and flat_map.
//!
//! All three commute with Z-set addition and therefore apply directly to
//! deltas, with no internal state.  Each comes in an infallible flavor for
//! embedding-API users and a `try_` flavor used by the SQL compiler, whose
//! compiled expressions can fail at runtime (overflow, type errors); a
//! failing expression aborts the step.

use crate::{
    algebra::ZSet,
    circuit::{
        operator_traits::{Operator, UnaryOperator},
        Stream,
    },
    error::StepError,
};
use std::{borrow::Cow, hash::Hash, marker::PhantomData};

impl<D> Stream<ZSet<D>>
where
    D: Clone + Eq + Hash + 'static,
{
    /// Retain elements satisfying `predicate`.
    pub fn filter<F>(&self, predicate: F) -> Stream<ZSet<D>>
    where
        F: Fn(&D) -> bool + 'static,
    {
        self.try_filter(move |value| Ok(predicate(value)))
    }

    /// Retain elements satisfying `predicate`; a predicate error aborts the
    /// step.
    pub fn try_filter<F>(&self, predicate: F) -> Stream<ZSet<D>>
    where
        F: Fn(&D) -> Result<bool, StepError> + 'static,
    {
        self.circuit()
            .add_unary_operator(Filter::new(predicate), self)
    }

    /// Project each element through `func`; weights of elements mapping to
    /// the same output merge.
    pub fn map<T, F>(&self, func: F) -> Stream<ZSet<T>>
    where
        T: Clone + Eq + Hash + 'static,
        F: Fn(&D) -> T + 'static,
    {
        self.try_map(move |value| Ok(func(value)))
    }

    pub fn try_map<T, F>(&self, func: F) -> Stream<ZSet<T>>
    where
        T: Clone + Eq + Hash + 'static,
        F: Fn(&D) -> Result<T, StepError> + 'static,
    {
        self.circuit().add_unary_operator(Map::new(func), self)
    }

    /// Emit zero or more outputs per element, each inheriting the element's
    /// weight.
    pub fn flat_map<T, I, F>(&self, func: F) -> Stream<ZSet<T>>
    where
        T: Clone + Eq + Hash + 'static,
        I: IntoIterator<Item = T> + 'static,
        F: Fn(&D) -> I + 'static,
    {
        self.try_flat_map(move |value| Ok(func(value)))
    }

    pub fn try_flat_map<T, I, F>(&self, func: F) -> Stream<ZSet<T>>
    where
        T: Clone + Eq + Hash + 'static,
        I: IntoIterator<Item = T> + 'static,
        F: Fn(&D) -> Result<I, StepError> + 'static,
    {
        self.circuit().add_unary_operator(FlatMap::new(func), self)
    }
}

/// Operator that filters a Z-set by a predicate on elements.
pub struct Filter<D, F> {
    predicate: F,
    _type: PhantomData<D>,
}

impl<D, F> Filter<D, F> {
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            _type: PhantomData,
        }
    }
}

impl<D, F> Operator for Filter<D, F>
where
    D: 'static,
    F: 'static,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from("Filter")
    }
}

impl<D, F> UnaryOperator<ZSet<D>, ZSet<D>> for Filter<D, F>
where
    D: Clone + Eq + Hash + 'static,
    F: Fn(&D) -> Result<bool, StepError> + 'static,
{
    fn eval(&mut self, input: &ZSet<D>) -> Result<ZSet<D>, StepError> {
        let mut output = ZSet::with_capacity(input.len());
        for (value, weight) in input.entries() {
            if (self.predicate)(value)? {
                output.insert(value.clone(), weight);
            }
        }
        Ok(output)
    }
}

/// Operator that projects Z-set elements through a function.
pub struct Map<D, T, F> {
    func: F,
    _type: PhantomData<(D, T)>,
}

impl<D, T, F> Map<D, T, F> {
    pub fn new(func: F) -> Self {
        Self {
            func,
            _type: PhantomData,
        }
    }
}

impl<D, T, F> Operator for Map<D, T, F>
where
    D: 'static,
    T: 'static,
    F: 'static,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from("Map")
    }
}

impl<D, T, F> UnaryOperator<ZSet<D>, ZSet<T>> for Map<D, T, F>
where
    D: Clone + Eq + Hash + 'static,
    T: Clone + Eq + Hash + 'static,
    F: Fn(&D) -> Result<T, StepError> + 'static,
{
    fn eval(&mut self, input: &ZSet<D>) -> Result<ZSet<T>, StepError> {
        let mut output = ZSet::with_capacity(input.len());
        for (value, weight) in input.entries() {
            output.insert((self.func)(value)?, weight);
        }
        Ok(output)
    }
}

/// Operator that expands each Z-set element to zero or more outputs.
pub struct FlatMap<D, T, F> {
    func: F,
    _type: PhantomData<(D, T)>,
}

impl<D, T, F> FlatMap<D, T, F> {
    pub fn new(func: F) -> Self {
        Self {
            func,
            _type: PhantomData,
        }
    }
}

impl<D, T, F> Operator for FlatMap<D, T, F>
where
    D: 'static,
    T: 'static,
    F: 'static,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from("FlatMap")
    }
}

impl<D, T, I, F> UnaryOperator<ZSet<D>, ZSet<T>> for FlatMap<D, T, F>
where
    D: Clone + Eq + Hash + 'static,
    T: Clone + Eq + Hash + 'static,
    I: IntoIterator<Item = T> + 'static,
    F: Fn(&D) -> Result<I, StepError> + 'static,
{
    fn eval(&mut self, input: &ZSet<D>) -> Result<ZSet<T>, StepError> {
        let mut output = ZSet::new();
        for (value, weight) in input.entries() {
            for out in (self.func)(value)? {
                output.insert(out, weight);
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use crate::{circuit::Root, operator::Generator, zset};

    #[test]
    fn filter_map_pipeline() {
        let (mut root, ()) = Root::build(|circuit| {
            let mut inputs = vec![
                zset! { 1 => 1, 2 => 1, 3 => -1, 4 => 2 },
                zset! { 5 => 1, 6 => 1 },
            ]
            .into_iter();
            let mut expected = vec![
                zset! { 20 => 1, 40 => 2 },
                zset! { 60 => 1 },
            ]
            .into_iter();

            circuit
                .add_source(Generator::new(move || inputs.next().unwrap()))
                .filter(|&n| n % 2 == 0)
                .map(|&n| n * 10)
                .inspect(move |delta| assert_eq!(delta, &expected.next().unwrap()));
            Ok(())
        })
        .unwrap();

        for _ in 0..2 {
            root.step().unwrap();
        }
    }

    #[test]
    fn flat_map_duplicates_weights() {
        let (mut root, ()) = Root::build(|circuit| {
            let mut inputs = vec![zset! { 3 => 2 }].into_iter();
            circuit
                .add_source(Generator::new(move || inputs.next().unwrap()))
                .flat_map(|&n| vec![n, -n])
                .inspect(|delta| assert_eq!(delta, &zset! { 3 => 2, -3 => 2 }));
            Ok(())
        })
        .unwrap();

        root.step().unwrap();
    }
}
