//! Z-sets: multisets with signed integer weights.

use crate::algebra::ZWeight;
use hashbrown::{hash_map, HashMap};
use num::Zero;
use std::{
    hash::Hash,
    iter::repeat,
    ops::{Add, AddAssign, Neg},
};

/// A Z-set is a set where each element carries a weight.
///
/// Weights are signed integers; an element with weight zero is absent, and
/// every operation prunes weights that reach zero.  A Z-set where all weights
/// are positive represents a multiset; a Z-set with weights in `{0, 1}`
/// represents a set.  Z-sets form a commutative group under pointwise
/// addition, which is what makes delta processing compositional: a change to
/// a relation is itself a Z-set, with insertions carrying positive and
/// deletions negative weights.
///
/// Element identity is the element's `Eq`/`Hash` implementation, i.e. rows
/// are compared structurally.  This is deliberate: a retraction
/// `(old_row, -1)` must never cancel against `(new_row, +1)` when only some
/// field changed.  Stores that need primary-key identity (join state, input
/// upsert stores) key their own maps by the extracted key instead.
#[derive(Clone, Debug)]
pub struct ZSet<D> {
    entries: HashMap<D, ZWeight>,
}

impl<D: Eq + Hash> PartialEq for ZSet<D> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<D: Eq + Hash> Eq for ZSet<D> {}

impl<D> Default for ZSet<D> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<D> ZSet<D>
where
    D: Clone + Eq + Hash + 'static,
{
    /// The empty Z-set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Build a Z-set from `(element, weight)` pairs, merging entries that
    /// share an element and pruning zeros.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (D, ZWeight)>,
    {
        let mut zset = Self::new();
        for (v, w) in pairs {
            zset.insert(v, w);
        }
        zset
    }

    /// Add `weight` to the weight of `value`, erasing the entry if the
    /// resulting weight is zero.
    pub fn insert(&mut self, value: D, weight: ZWeight) {
        if weight == 0 {
            return;
        }
        match self.entries.entry(value) {
            hash_map::Entry::Occupied(mut entry) => {
                *entry.get_mut() += weight;
                if *entry.get() == 0 {
                    entry.remove();
                }
            }
            hash_map::Entry::Vacant(entry) => {
                entry.insert(weight);
            }
        }
    }

    /// Number of distinct elements with nonzero weight.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current weight of `value`; zero when absent.
    pub fn weight_of(&self, value: &D) -> ZWeight {
        self.entries.get(value).copied().unwrap_or(0)
    }

    /// Sum of all weights.
    pub fn count(&self) -> ZWeight {
        self.entries.values().sum()
    }

    /// Pointwise sum with `other`.
    pub fn add_ref(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.add_assign_ref(other);
        result
    }

    pub fn add_assign_ref(&mut self, other: &Self) {
        for (v, &w) in other.entries.iter() {
            self.insert(v.clone(), w);
        }
    }

    /// Flip the sign of every weight.
    pub fn negate(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(v, &w)| (v.clone(), -w))
                .collect(),
        }
    }

    /// `self + (-other)`.
    pub fn subtract(&self, other: &Self) -> Self {
        let mut result = self.clone();
        for (v, &w) in other.entries.iter() {
            result.insert(v.clone(), -w);
        }
        result
    }

    /// Retain entries whose element satisfies `predicate`.
    ///
    /// Linear: `filter(a + b) == filter(a) + filter(b)`.
    pub fn filter<P>(&self, predicate: P) -> Self
    where
        P: Fn(&D) -> bool,
    {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(v, _)| predicate(v))
                .map(|(v, &w)| (v.clone(), w))
                .collect(),
        }
    }

    /// Project each element through `func`, merging weights of elements that
    /// map to the same output.  Linear.
    pub fn map<T, F>(&self, func: F) -> ZSet<T>
    where
        T: Clone + Eq + Hash + 'static,
        F: Fn(&D) -> T,
    {
        let mut result = ZSet::with_capacity(self.len());
        for (v, &w) in self.entries.iter() {
            result.insert(func(v), w);
        }
        result
    }

    /// Emit zero or more outputs per element, each inheriting the element's
    /// weight.  Linear.
    pub fn flat_map<T, I, F>(&self, func: F) -> ZSet<T>
    where
        T: Clone + Eq + Hash + 'static,
        I: IntoIterator<Item = T>,
        F: Fn(&D) -> I,
    {
        let mut result = ZSet::new();
        for (v, &w) in self.entries.iter() {
            for out in func(v) {
                result.insert(out, w);
            }
        }
        result
    }

    /// Weighted sum `Σ weight · func(element)`.  Linear.
    pub fn sum_by<F>(&self, func: F) -> ZWeight
    where
        F: Fn(&D) -> ZWeight,
    {
        self.entries.iter().map(|(v, &w)| w * func(v)).sum()
    }

    /// All `(element, weight)` pairs with nonzero weight.
    pub fn entries(&self) -> impl Iterator<Item = (&D, ZWeight)> {
        self.entries.iter().map(|(v, &w)| (v, w))
    }

    /// Elements with positive weight, each repeated `weight` times.
    /// Non-positive multiplicities are ignored.
    pub fn values(&self) -> impl Iterator<Item = &D> {
        self.entries
            .iter()
            .filter(|(_, &w)| w > 0)
            .flat_map(|(v, &w)| repeat(v).take(w as usize))
    }

    /// A Z-set that contains all elements with positive weight from `self`,
    /// with weights set to 1.
    pub fn distinct(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(_, &w)| w > 0)
                .map(|(v, _)| (v.clone(), 1))
                .collect(),
        }
    }
}

impl<D> Add for ZSet<D>
where
    D: Clone + Eq + Hash + 'static,
{
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl<D> AddAssign for ZSet<D>
where
    D: Clone + Eq + Hash + 'static,
{
    fn add_assign(&mut self, rhs: Self) {
        for (v, w) in rhs.entries {
            self.insert(v, w);
        }
    }
}

impl<D> Neg for ZSet<D>
where
    D: Clone + Eq + Hash + 'static,
{
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            entries: self.entries.into_iter().map(|(v, w)| (v, -w)).collect(),
        }
    }
}

impl<D> Zero for ZSet<D>
where
    D: Clone + Eq + Hash + 'static,
{
    fn zero() -> Self {
        Self::new()
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

impl<D> FromIterator<(D, ZWeight)> for ZSet<D>
where
    D: Clone + Eq + Hash + 'static,
{
    fn from_iter<I: IntoIterator<Item = (D, ZWeight)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

impl<'a, D> IntoIterator for &'a ZSet<D> {
    type Item = (&'a D, &'a ZWeight);
    type IntoIter = hash_map::Iter<'a, D, ZWeight>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl<D> IntoIterator for ZSet<D> {
    type Item = (D, ZWeight);
    type IntoIter = hash_map::IntoIter<D, ZWeight>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
