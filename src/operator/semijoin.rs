//! Semi-join and anti-join.
//!
//! Both are maintained with a per-join-key reference count of right-side
//! rows.  A left row is in the semi-join output while its key's count is
//! positive, and in the anti-join output while it is zero; transitions of
//! the count across zero emit the affected left rows with `+`/`-` weights.
//! The anti-join is what the SQL compiler uses to NULL-pad outer joins.

use crate::{
    algebra::{ZSet, ZWeight},
    circuit::{
        operator_traits::{BinaryOperator, Operator},
        Stream,
    },
    data::{Row, Value},
    error::StepError,
    operator::join::KeyFunc,
};
use hashbrown::{HashMap, HashSet};
use std::{borrow::Cow, rc::Rc};

impl Stream<ZSet<Row>> {
    /// Left rows that have at least one match on the right.
    pub fn semi_join<F1, F2>(&self, other: &Self, left_key: F1, right_key: F2) -> Self
    where
        F1: Fn(&Row) -> Value + 'static,
        F2: Fn(&Row) -> Value + 'static,
    {
        self.circuit().add_binary_operator(
            SemiJoin::semi(Rc::new(left_key), Rc::new(right_key)),
            self,
            other,
        )
    }

    /// Left rows that have no match on the right.
    pub fn anti_join<F1, F2>(&self, other: &Self, left_key: F1, right_key: F2) -> Self
    where
        F1: Fn(&Row) -> Value + 'static,
        F2: Fn(&Row) -> Value + 'static,
    {
        self.circuit().add_binary_operator(
            SemiJoin::anti(Rc::new(left_key), Rc::new(right_key)),
            self,
            other,
        )
    }
}

/// Reference-counted semi-/anti-join operator.
pub struct SemiJoin {
    /// Semi-join emits matched left rows; anti-join emits unmatched ones.
    emit_matched: bool,
    left_key: KeyFunc,
    right_key: KeyFunc,
    left: HashMap<Value, ZSet<Row>>,
    right_counts: HashMap<Value, ZWeight>,
    /// First-touch snapshots of reference counts mutated this step.
    undo_counts: Vec<(Value, ZWeight)>,
    counts_touched: HashSet<Value>,
    /// Left-store insertions performed this step.
    undo_left: Vec<(Value, Row, ZWeight)>,
}

impl SemiJoin {
    pub fn semi(left_key: KeyFunc, right_key: KeyFunc) -> Self {
        Self::new(true, left_key, right_key)
    }

    pub fn anti(left_key: KeyFunc, right_key: KeyFunc) -> Self {
        Self::new(false, left_key, right_key)
    }

    fn new(emit_matched: bool, left_key: KeyFunc, right_key: KeyFunc) -> Self {
        Self {
            emit_matched,
            left_key,
            right_key,
            left: HashMap::new(),
            right_counts: HashMap::new(),
            undo_counts: Vec::new(),
            counts_touched: HashSet::new(),
            undo_left: Vec::new(),
        }
    }

    fn count(&self, key: &Value) -> ZWeight {
        self.right_counts.get(key).copied().unwrap_or(0)
    }
}

impl Operator for SemiJoin {
    fn name(&self) -> Cow<'static, str> {
        Cow::from(if self.emit_matched {
            "SemiJoin"
        } else {
            "AntiJoin"
        })
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn commit(&mut self) {
        self.undo_counts.clear();
        self.counts_touched.clear();
        self.undo_left.clear();
    }

    fn abort(&mut self) {
        while let Some((key, row, weight)) = self.undo_left.pop() {
            let bucket = self.left.entry(key.clone()).or_default();
            bucket.insert(row, -weight);
            if bucket.is_empty() {
                self.left.remove(&key);
            }
        }
        for (key, old) in self.undo_counts.drain(..) {
            if old == 0 {
                self.right_counts.remove(&key);
            } else {
                self.right_counts.insert(key, old);
            }
        }
        self.counts_touched.clear();
    }

    fn reset(&mut self) {
        self.left.clear();
        self.right_counts.clear();
        self.undo_counts.clear();
        self.counts_touched.clear();
        self.undo_left.clear();
    }
}

impl BinaryOperator<ZSet<Row>, ZSet<Row>, ZSet<Row>> for SemiJoin {
    fn eval(
        &mut self,
        left_delta: &ZSet<Row>,
        right_delta: &ZSet<Row>,
    ) -> Result<ZSet<Row>, StepError> {
        let mut output = ZSet::new();

        // Right side first: a count transition re-emits or retracts every
        // left row already stored under that key.  Left rows arriving in the
        // same step are handled below, against the updated counts.
        for (row, weight) in right_delta.entries() {
            let key = (self.right_key)(row);
            let old = self.count(&key);
            let new = old + weight;

            if self.counts_touched.insert(key.clone()) {
                self.undo_counts.push((key.clone(), old));
            }
            if new == 0 {
                self.right_counts.remove(&key);
            } else {
                self.right_counts.insert(key.clone(), new);
            }

            let was_matched = old > 0;
            let is_matched = new > 0;
            if was_matched != is_matched {
                let sign = match (is_matched, self.emit_matched) {
                    (true, true) | (false, false) => 1,
                    _ => -1,
                };
                if let Some(bucket) = self.left.get(&key) {
                    for (left_row, left_weight) in bucket.entries() {
                        output.insert(left_row.clone(), sign * left_weight);
                    }
                }
            }
        }

        for (row, weight) in left_delta.entries() {
            let key = (self.left_key)(row);
            let matched = self.count(&key) > 0;
            if matched == self.emit_matched {
                output.insert(row.clone(), weight);
            }

            let bucket = self.left.entry(key.clone()).or_default();
            bucket.insert(row.clone(), weight);
            let emptied = bucket.is_empty();
            if emptied {
                self.left.remove(&key);
            }
            self.undo_left.push((key, row.clone(), weight));
        }

        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use crate::{circuit::Root, data::Row, operator::Generator, row, zset};
    use std::{cell::RefCell, rc::Rc};

    fn col(index: usize) -> impl Fn(&Row) -> crate::data::Value {
        move |row: &Row| row.col(index).clone()
    }

    #[test]
    fn anti_join_tracks_zero_transitions() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_clone = observed.clone();

        let left = vec![
            zset! { row![1, "a"] => 1, row![2, "b"] => 1 },
            zset! {},
            zset! { row![3, "a"] => 1 },
            zset! {},
        ];
        let right = vec![
            zset! { row!["a"] => 1 },
            zset! { row!["b"] => 1 },
            zset! {},
            zset! { row!["a"] => -1 },
        ];

        let (mut root, ()) = Root::build(|circuit| {
            let mut left = left.into_iter();
            let mut right = right.into_iter();
            let left = circuit.add_source(Generator::new(move || left.next().unwrap()));
            let right = circuit.add_source(Generator::new(move || right.next().unwrap()));
            left.anti_join(&right, col(1), col(0))
                .inspect(move |delta| observed_clone.borrow_mut().push(delta.clone()));
            Ok(())
        })
        .unwrap();

        for _ in 0..4 {
            root.step().unwrap();
        }

        assert_eq!(
            observed.borrow().as_slice(),
            &[
                // "a" is matched in the same step it arrives; only (2, b)
                // starts out unmatched.
                zset! { row![2, "b"] => 1 },
                // "b" becomes matched: retract.
                zset! { row![2, "b"] => -1 },
                // New left row under a matched key: nothing.
                zset! {},
                // Last "a" on the right disappears: both left "a" rows
                // surface.
                zset! { row![1, "a"] => 1, row![3, "a"] => 1 },
            ]
        );
    }

    #[test]
    fn semi_join_is_complement_of_anti_join() {
        let left = vec![
            zset! { row![1, "x"] => 1, row![2, "y"] => 1 },
            zset! { row![3, "z"] => 1 },
            zset! { row![1, "x"] => -1 },
        ];
        let right = vec![
            zset! { row!["x"] => 1 },
            zset! { row!["y"] => 1, row!["x"] => -1 },
            zset! { row!["z"] => 1 },
        ];
        let steps = left.len();

        let (mut root, ()) = Root::build(|circuit| {
            let mut l = left.clone().into_iter();
            let mut r = right.clone().into_iter();
            let left_stream = circuit.add_source(Generator::new(move || l.next().unwrap()));
            let right_stream = circuit.add_source(Generator::new(move || r.next().unwrap()));

            let semi = left_stream.semi_join(&right_stream, col(1), col(0));
            let anti = left_stream.anti_join(&right_stream, col(1), col(0));

            // semi + anti must always reproduce the left input.
            semi.union(&anti)
                .union(&left_stream.neg())
                .inspect(|difference| assert!(difference.is_empty()));
            Ok(())
        })
        .unwrap();

        for _ in 0..steps {
            root.step().unwrap();
        }
    }
}
