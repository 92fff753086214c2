//! Relational equi-join operators.
//!
//! Both implementations maintain the bilinear join identity incrementally:
//!
//! ```text
//! delta(A |><| B) = prev(A) |><| dB  +  dA |><| prev(B)  +  dA |><| dB
//! ```
//!
//! where `prev` is the integrated input before the current step.  The
//! update-capable [`JoinIndexed`] keys its per-side row stores by primary
//! key, which is what lets it turn a same-key insert into a retract+reinsert
//! pair; [`JoinAppendOnly`] drops that bookkeeping for insert-only inputs.

use crate::{
    algebra::{ZSet, ZWeight},
    circuit::{
        operator_traits::{BinaryOperator, Operator},
        Stream,
    },
    data::{Row, Value},
    error::StepError,
};
use hashbrown::{hash_map, HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, rc::Rc};

/// Extracts a key (join key or primary key) from a row.
pub type KeyFunc = Rc<dyn Fn(&Row) -> Value>;

/// Combines a matching pair of rows into an output row.
pub type JoinFunc = Rc<dyn Fn(&Row, &Row) -> Row>;

/// Which join implementation a compiled query should use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Hash-indexed, update-capable join.  The default.
    #[default]
    Indexed,
    /// Assumes no deletes and no primary-key overwrites.
    AppendOnly,
}

/// Key extractor reading one column.
pub fn column_key(index: usize) -> KeyFunc {
    Rc::new(move |row: &Row| row.col(index).clone())
}

/// Key extractor hashing the whole row; the default primary key for rows
/// without a declared one.
pub fn fingerprint_key() -> KeyFunc {
    Rc::new(|row: &Row| Value::Int(row.fingerprint() as i64))
}

/// Join function that concatenates the two rows.
pub fn concat_rows() -> JoinFunc {
    Rc::new(|left: &Row, right: &Row| left.concat(right))
}

impl Stream<ZSet<Row>> {
    /// Incremental inner equi-join using the update-capable indexed
    /// implementation, with structural primary keys and concatenated output
    /// rows.
    pub fn join<F1, F2>(&self, other: &Self, left_key: F1, right_key: F2) -> Self
    where
        F1: Fn(&Row) -> Value + 'static,
        F2: Fn(&Row) -> Value + 'static,
    {
        self.join_indexed(
            other,
            Rc::new(left_key),
            Rc::new(right_key),
            fingerprint_key(),
            fingerprint_key(),
            concat_rows(),
        )
    }

    /// Incremental inner equi-join with full control over key extraction
    /// and output construction.
    pub fn join_indexed(
        &self,
        other: &Self,
        left_key: KeyFunc,
        right_key: KeyFunc,
        left_pk: KeyFunc,
        right_pk: KeyFunc,
        join_func: JoinFunc,
    ) -> Self {
        self.circuit().add_binary_operator(
            JoinIndexed::new(left_key, right_key, left_pk, right_pk, join_func),
            self,
            other,
        )
    }

    /// Incremental inner equi-join for insert-only inputs.
    ///
    /// Cost per input row is O(matches); a retraction in either input aborts
    /// the step.
    pub fn join_append_only<F1, F2>(&self, other: &Self, left_key: F1, right_key: F2) -> Self
    where
        F1: Fn(&Row) -> Value + 'static,
        F2: Fn(&Row) -> Value + 'static,
    {
        self.circuit().add_binary_operator(
            JoinAppendOnly::new(Rc::new(left_key), Rc::new(right_key), concat_rows()),
            self,
            other,
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum SideId {
    Left,
    Right,
}

/// Per-side state of the indexed join.
///
/// Invariants: every primary key in an index bucket resolves to a row in
/// `rows`; every row appears in exactly one bucket, that of its current join
/// key; empty buckets are removed.
struct JoinSide {
    key: KeyFunc,
    pk: KeyFunc,
    rows: HashMap<Value, (Row, ZWeight)>,
    index: HashMap<Value, HashSet<Value>>,
}

impl JoinSide {
    fn new(key: KeyFunc, pk: KeyFunc) -> Self {
        Self {
            key,
            pk,
            rows: HashMap::new(),
            index: HashMap::new(),
        }
    }

    fn link(&mut self, pk: Value, row: &Row) {
        let join_key = (self.key)(row);
        self.index.entry(join_key).or_default().insert(pk);
    }

    fn unlink(&mut self, pk: &Value, row: &Row) {
        let join_key = (self.key)(row);
        if let Some(bucket) = self.index.get_mut(&join_key) {
            bucket.remove(pk);
            if bucket.is_empty() {
                self.index.remove(&join_key);
            }
        }
    }

    fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }
}

#[derive(Default)]
struct JoinUndo {
    /// First-touch snapshots of row-store entries mutated this step.
    rows: Vec<(SideId, Value, Option<(Row, ZWeight)>)>,
    row_touched: HashSet<(SideId, Value)>,
    /// First-touch snapshots of pair weights mutated this step.
    pairs: Vec<((Value, Value), ZWeight)>,
    pair_touched: HashSet<(Value, Value)>,
}

impl JoinUndo {
    fn clear(&mut self) {
        self.rows.clear();
        self.row_touched.clear();
        self.pairs.clear();
        self.pair_touched.clear();
    }
}

/// Update-capable hash-indexed join.
///
/// State per side: a row store (primary key to row and multiplicity) and a
/// join index (join key to the set of primary keys currently carrying it).
/// A result map keyed by `(left pk, right pk)` tracks the weight of each
/// emitted pair; its invariant is that the recorded weight always equals
/// the product of the two input multiplicities.
pub struct JoinIndexed {
    left: JoinSide,
    right: JoinSide,
    join_func: JoinFunc,
    pair_weights: HashMap<(Value, Value), ZWeight>,
    undo: JoinUndo,
}

impl JoinIndexed {
    pub fn new(
        left_key: KeyFunc,
        right_key: KeyFunc,
        left_pk: KeyFunc,
        right_pk: KeyFunc,
        join_func: JoinFunc,
    ) -> Self {
        Self {
            left: JoinSide::new(left_key, left_pk),
            right: JoinSide::new(right_key, right_pk),
            join_func,
            pair_weights: HashMap::new(),
            undo: JoinUndo::default(),
        }
    }

    fn apply(&mut self, side: SideId, row: &Row, weight: ZWeight, output: &mut ZSet<Row>) {
        let Self {
            left,
            right,
            join_func,
            pair_weights,
            undo,
        } = self;
        let (own, other) = match side {
            SideId::Left => (left, &*right),
            SideId::Right => (right, &*left),
        };

        let pk = (own.pk)(row);
        if undo.row_touched.insert((side, pk.clone())) {
            undo.rows
                .push((side, pk.clone(), own.rows.get(&pk).cloned()));
        }

        if weight < 0 {
            let (existing, multiplicity) = match own.rows.get(&pk) {
                Some(entry) => entry.clone(),
                None => {
                    tracing::trace!(%pk, "delete of absent row ignored");
                    return;
                }
            };
            // Never retract more units than are present.
            let applied = weight.max(-multiplicity);
            let join_key = (own.key)(&existing);
            emit_pairs(
                side,
                &pk,
                &existing,
                &join_key,
                applied,
                other,
                pair_weights,
                undo,
                join_func,
                output,
            );
            let remaining = multiplicity + applied;
            if remaining > 0 {
                own.rows.insert(pk, (existing, remaining));
            } else {
                own.rows.remove(&pk);
                own.unlink(&pk, &existing);
            }
        } else {
            match own.rows.get(&pk).cloned() {
                Some((existing, multiplicity)) if existing == *row => {
                    let join_key = (own.key)(row);
                    emit_pairs(
                        side,
                        &pk,
                        row,
                        &join_key,
                        weight,
                        other,
                        pair_weights,
                        undo,
                        join_func,
                        output,
                    );
                    own.rows.insert(pk, (existing, multiplicity + weight));
                }
                Some((existing, multiplicity)) => {
                    // Same primary key, different content: an update.
                    // Retract the old row in full, then insert the new one.
                    let old_key = (own.key)(&existing);
                    emit_pairs(
                        side,
                        &pk,
                        &existing,
                        &old_key,
                        -multiplicity,
                        other,
                        pair_weights,
                        undo,
                        join_func,
                        output,
                    );
                    own.unlink(&pk, &existing);

                    let new_key = (own.key)(row);
                    emit_pairs(
                        side,
                        &pk,
                        row,
                        &new_key,
                        weight,
                        other,
                        pair_weights,
                        undo,
                        join_func,
                        output,
                    );
                    own.link(pk.clone(), row);
                    own.rows.insert(pk, (row.clone(), weight));
                }
                None => {
                    let join_key = (own.key)(row);
                    emit_pairs(
                        side,
                        &pk,
                        row,
                        &join_key,
                        weight,
                        other,
                        pair_weights,
                        undo,
                        join_func,
                        output,
                    );
                    own.link(pk.clone(), row);
                    own.rows.insert(pk, (row.clone(), weight));
                }
            }
        }
    }
}

/// Emits the pair-weight updates caused by changing one side's multiplicity
/// of `row` by `units`, scanning only the opposite side's bucket for the
/// row's join key.
#[allow(clippy::too_many_arguments)]
fn emit_pairs(
    side: SideId,
    pk: &Value,
    row: &Row,
    join_key: &Value,
    units: ZWeight,
    other: &JoinSide,
    pair_weights: &mut HashMap<(Value, Value), ZWeight>,
    undo: &mut JoinUndo,
    join_func: &JoinFunc,
    output: &mut ZSet<Row>,
) {
    if units == 0 {
        return;
    }
    let bucket = match other.index.get(join_key) {
        Some(bucket) => bucket,
        None => return,
    };
    for other_pk in bucket {
        let (other_row, other_mult) = other
            .rows
            .get(other_pk)
            .expect("join index entry resolves to a stored row");
        let delta = units * *other_mult;
        if delta == 0 {
            continue;
        }

        let pair = match side {
            SideId::Left => (pk.clone(), other_pk.clone()),
            SideId::Right => (other_pk.clone(), pk.clone()),
        };
        if undo.pair_touched.insert(pair.clone()) {
            undo.pairs
                .push((pair.clone(), pair_weights.get(&pair).copied().unwrap_or(0)));
        }
        match pair_weights.entry(pair) {
            hash_map::Entry::Occupied(mut entry) => {
                *entry.get_mut() += delta;
                if *entry.get() == 0 {
                    entry.remove();
                }
            }
            hash_map::Entry::Vacant(entry) => {
                entry.insert(delta);
            }
        }

        let joined = match side {
            SideId::Left => (join_func)(row, other_row),
            SideId::Right => (join_func)(other_row, row),
        };
        output.insert(joined, delta);
    }
}

impl Operator for JoinIndexed {
    fn name(&self) -> Cow<'static, str> {
        Cow::from("JoinIndexed")
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn commit(&mut self) {
        self.undo.clear();
    }

    fn abort(&mut self) {
        for (pair, old) in self.undo.pairs.drain(..) {
            if old == 0 {
                self.pair_weights.remove(&pair);
            } else {
                self.pair_weights.insert(pair, old);
            }
        }
        let rows: Vec<_> = self.undo.rows.drain(..).collect();
        for (side, pk, old) in rows {
            let own = match side {
                SideId::Left => &mut self.left,
                SideId::Right => &mut self.right,
            };
            if let Some((row, _)) = own.rows.remove(&pk) {
                own.unlink(&pk, &row);
            }
            if let Some((row, multiplicity)) = old {
                own.link(pk.clone(), &row);
                own.rows.insert(pk, (row, multiplicity));
            }
        }
        self.undo.clear();
    }

    fn reset(&mut self) {
        self.left.clear();
        self.right.clear();
        self.pair_weights.clear();
        self.undo.clear();
    }
}

impl BinaryOperator<ZSet<Row>, ZSet<Row>, ZSet<Row>> for JoinIndexed {
    fn eval(
        &mut self,
        left_delta: &ZSet<Row>,
        right_delta: &ZSet<Row>,
    ) -> Result<ZSet<Row>, StepError> {
        let mut output = ZSet::new();

        // Deletes before inserts, so that an update arriving as a
        // retract+reinsert pair applies deterministically regardless of hash
        // iteration order.
        for (row, weight) in left_delta.entries().filter(|&(_, w)| w < 0) {
            self.apply(SideId::Left, row, weight, &mut output);
        }
        for (row, weight) in right_delta.entries().filter(|&(_, w)| w < 0) {
            self.apply(SideId::Right, row, weight, &mut output);
        }
        for (row, weight) in left_delta.entries().filter(|&(_, w)| w > 0) {
            self.apply(SideId::Left, row, weight, &mut output);
        }
        for (row, weight) in right_delta.entries().filter(|&(_, w)| w > 0) {
            self.apply(SideId::Right, row, weight, &mut output);
        }

        Ok(output)
    }
}

/// Append-only join: join key to rows, no primary keys, no deletions.
pub struct JoinAppendOnly {
    left_key: KeyFunc,
    right_key: KeyFunc,
    join_func: JoinFunc,
    left: HashMap<Value, Vec<(Row, ZWeight)>>,
    right: HashMap<Value, Vec<(Row, ZWeight)>>,
    /// Buckets appended to during the current step, newest last.
    appended: Vec<(SideId, Value)>,
}

impl JoinAppendOnly {
    pub fn new(left_key: KeyFunc, right_key: KeyFunc, join_func: JoinFunc) -> Self {
        Self {
            left_key,
            right_key,
            join_func,
            left: HashMap::new(),
            right: HashMap::new(),
            appended: Vec::new(),
        }
    }
}

impl Operator for JoinAppendOnly {
    fn name(&self) -> Cow<'static, str> {
        Cow::from("JoinAppendOnly")
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn commit(&mut self) {
        self.appended.clear();
    }

    fn abort(&mut self) {
        while let Some((side, key)) = self.appended.pop() {
            let store = match side {
                SideId::Left => &mut self.left,
                SideId::Right => &mut self.right,
            };
            if let Some(bucket) = store.get_mut(&key) {
                bucket.pop();
                if bucket.is_empty() {
                    store.remove(&key);
                }
            }
        }
    }

    fn reset(&mut self) {
        self.left.clear();
        self.right.clear();
        self.appended.clear();
    }
}

impl BinaryOperator<ZSet<Row>, ZSet<Row>, ZSet<Row>> for JoinAppendOnly {
    fn eval(
        &mut self,
        left_delta: &ZSet<Row>,
        right_delta: &ZSet<Row>,
    ) -> Result<ZSet<Row>, StepError> {
        if left_delta
            .entries()
            .chain(right_delta.entries())
            .any(|(_, w)| w < 0)
        {
            return Err(StepError::AppendOnlyRetraction);
        }

        let mut output = ZSet::new();

        // dB against prev(A), then append dB; dA then sees prev(B) + dB,
        // which yields exactly the three bilinear terms.
        for (row, weight) in right_delta.entries() {
            let key = (self.right_key)(row);
            if let Some(bucket) = self.left.get(&key) {
                for (left_row, left_weight) in bucket {
                    output.insert((self.join_func)(left_row, row), *left_weight * weight);
                }
            }
        }
        for (row, weight) in right_delta.entries() {
            let key = (self.right_key)(row);
            self.right
                .entry(key.clone())
                .or_default()
                .push((row.clone(), weight));
            self.appended.push((SideId::Right, key));
        }

        for (row, weight) in left_delta.entries() {
            let key = (self.left_key)(row);
            if let Some(bucket) = self.right.get(&key) {
                for (right_row, right_weight) in bucket {
                    output.insert((self.join_func)(row, right_row), weight * *right_weight);
                }
            }
        }
        for (row, weight) in left_delta.entries() {
            let key = (self.left_key)(row);
            self.left
                .entry(key.clone())
                .or_default()
                .push((row.clone(), weight));
            self.appended.push((SideId::Left, key));
        }

        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use crate::{
        algebra::ZSet,
        circuit::Root,
        data::Row,
        operator::Generator,
        row, zset,
    };
    use std::{cell::RefCell, rc::Rc};

    fn col(index: usize) -> impl Fn(&Row) -> crate::data::Value {
        move |row: &Row| row.col(index).clone()
    }

    // Orders(id, cid) joined with customers(cid, name) on cid.
    #[test]
    fn indexed_join_tracks_inserts_and_deletes() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_clone = observed.clone();

        let orders = vec![
            zset! { row![1, 100] => 1, row![2, 101] => 1 },
            zset! { row![3, 100] => 1 },
            zset! {},
        ];
        let customers = vec![
            zset! { row![100, "Alice"] => 1, row![101, "Bob"] => 1 },
            zset! {},
            zset! { row![100, "Alice"] => -1 },
        ];

        let (mut root, ()) = Root::build(|circuit| {
            let mut orders = orders.into_iter();
            let mut customers = customers.into_iter();
            let orders = circuit.add_source(Generator::new(move || orders.next().unwrap()));
            let customers = circuit.add_source(Generator::new(move || customers.next().unwrap()));

            orders
                .join(&customers, col(1), col(0))
                .inspect(move |delta| observed_clone.borrow_mut().push(delta.clone()));
            Ok(())
        })
        .unwrap();

        for _ in 0..3 {
            root.step().unwrap();
        }

        assert_eq!(
            observed.borrow().as_slice(),
            &[
                zset! {
                    row![1, 100, 100, "Alice"] => 1,
                    row![2, 101, 101, "Bob"] => 1,
                },
                zset! { row![3, 100, 100, "Alice"] => 1 },
                zset! {
                    row![1, 100, 100, "Alice"] => -1,
                    row![3, 100, 100, "Alice"] => -1,
                },
            ]
        );
    }

    // An insert reusing a primary key behaves as delete-then-insert.
    #[test]
    fn indexed_join_captures_updates_by_primary_key() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_clone = observed.clone();

        let left = vec![
            zset! { row![1, "red"] => 1 },
            zset! { row![1, "blue"] => 1 },
        ];
        let right = vec![
            zset! { row!["red", 10] => 1, row!["blue", 20] => 1 },
            zset! {},
        ];

        let (mut root, ()) = Root::build(|circuit| {
            let mut left = left.into_iter();
            let mut right = right.into_iter();
            let left = circuit.add_source(Generator::new(move || left.next().unwrap()));
            let right = circuit.add_source(Generator::new(move || right.next().unwrap()));

            left.join_indexed(
                &right,
                super::column_key(1),
                super::column_key(0),
                super::column_key(0),
                super::fingerprint_key(),
                super::concat_rows(),
            )
            .inspect(move |delta| observed_clone.borrow_mut().push(delta.clone()));
            Ok(())
        })
        .unwrap();

        for _ in 0..2 {
            root.step().unwrap();
        }

        assert_eq!(
            observed.borrow().as_slice(),
            &[
                zset! { row![1, "red", "red", 10] => 1 },
                zset! {
                    row![1, "red", "red", 10] => -1,
                    row![1, "blue", "blue", 20] => 1,
                },
            ]
        );
    }

    // The integrated output of the incremental join equals the join of the
    // integrated inputs after every step.
    #[test]
    fn join_bilinearity() {
        let left_steps = vec![
            zset! { row![1, "a"] => 1, row![2, "b"] => 2 },
            zset! { row![3, "a"] => 1 },
            zset! { row![1, "a"] => -1 },
            zset! { row![4, "c"] => 1 },
        ];
        let right_steps = vec![
            zset! { row!["a", 10] => 1 },
            zset! { row!["b", 20] => 1, row!["a", 30] => 1 },
            zset! { row!["a", 10] => -1 },
            zset! {},
        ];
        let steps = left_steps.len();

        let reference = {
            let left_steps = left_steps.clone();
            let right_steps = right_steps.clone();
            let mut left_total: ZSet<Row> = ZSet::new();
            let mut right_total: ZSet<Row> = ZSet::new();
            let mut per_step = Vec::new();
            for (l, r) in left_steps.into_iter().zip(right_steps) {
                left_total += l;
                right_total += r;
                let mut joined = ZSet::new();
                for (lrow, lw) in left_total.entries() {
                    for (rrow, rw) in right_total.entries() {
                        if lrow.col(1) == rrow.col(0) {
                            joined.insert(lrow.concat(rrow), lw * rw);
                        }
                    }
                }
                per_step.push(joined);
            }
            per_step
        };

        let (mut root, ()) = Root::build(|circuit| {
            let mut left = left_steps.into_iter();
            let mut right = right_steps.into_iter();
            let left = circuit.add_source(Generator::new(move || left.next().unwrap()));
            let right = circuit.add_source(Generator::new(move || right.next().unwrap()));

            let mut reference = reference.into_iter();
            left.join(&right, col(1), col(0))
                .integrate()
                .inspect(move |total| assert_eq!(total, &reference.next().unwrap()));
            Ok(())
        })
        .unwrap();

        for _ in 0..steps {
            root.step().unwrap();
        }
    }

    #[test]
    fn append_only_matches_indexed_on_insert_only_input() {
        let left_steps = vec![
            zset! { row![1, "x"] => 1 },
            zset! { row![2, "y"] => 1, row![3, "x"] => 1 },
            zset! { row![4, "z"] => 1 },
        ];
        let right_steps = vec![
            zset! { row!["x", 7] => 1 },
            zset! { row!["y", 8] => 1 },
            zset! { row!["x", 9] => 1 },
        ];
        let steps = left_steps.len();

        let (mut root, ()) = Root::build(|circuit| {
            let mut l1 = left_steps.clone().into_iter();
            let mut r1 = right_steps.clone().into_iter();
            let mut l2 = left_steps.into_iter();
            let mut r2 = right_steps.into_iter();

            let left_a = circuit.add_source(Generator::new(move || l1.next().unwrap()));
            let right_a = circuit.add_source(Generator::new(move || r1.next().unwrap()));
            let left_b = circuit.add_source(Generator::new(move || l2.next().unwrap()));
            let right_b = circuit.add_source(Generator::new(move || r2.next().unwrap()));

            let indexed = left_a.join(&right_a, col(1), col(0));
            let append_only = left_b.join_append_only(&right_b, col(1), col(0));

            indexed
                .union(&append_only.neg())
                .inspect(|difference| assert!(difference.is_empty()));
            Ok(())
        })
        .unwrap();

        for _ in 0..steps {
            root.step().unwrap();
        }
    }

    #[test]
    fn append_only_rejects_retractions() {
        let (mut root, ()) = Root::build(|circuit| {
            let left = circuit.add_source(Generator::new(|| zset! { row![1, "x"] => -1 }));
            let right = circuit.add_source(Generator::new(|| zset! {}));
            left.join_append_only(&right, col(1), col(0)).inspect(|_| {});
            Ok(())
        })
        .unwrap();

        assert!(root.step().is_err());
    }
}
