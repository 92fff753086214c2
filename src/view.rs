//! Materialized view subscribers.
//!
//! A [`MaterializedView`] integrates a view's output deltas into a keyed
//! store and exposes snapshot reads.  ORDER BY and LIMIT are presentation
//! concerns applied at read time, never operators in the circuit.

use crate::{
    algebra::{ZSet, ZWeight},
    circuit::Stream,
    data::Row,
};
use hashbrown::{hash_map, HashMap};
use std::{cell::RefCell, cmp::Ordering, rc::Rc};

#[derive(Clone, Copy, Debug)]
struct Slot {
    position: usize,
    weight: ZWeight,
}

struct ViewState {
    weights: HashMap<Row, Slot>,
    /// Rows in first-insertion order; deletions leave tombstones.
    slots: Vec<Option<Row>>,
    holes: usize,
    order_by: Vec<(usize, bool)>,
    limit: Option<usize>,
}

impl ViewState {
    fn new(order_by: Vec<(usize, bool)>, limit: Option<usize>) -> Self {
        Self {
            weights: HashMap::new(),
            slots: Vec::new(),
            holes: 0,
            order_by,
            limit,
        }
    }

    fn apply(&mut self, delta: &ZSet<Row>) {
        for (row, weight) in delta.entries() {
            match self.weights.entry(row.clone()) {
                hash_map::Entry::Occupied(mut entry) => {
                    let slot = entry.get_mut();
                    slot.weight += weight;
                    if slot.weight <= 0 {
                        let position = slot.position;
                        entry.remove();
                        self.slots[position] = None;
                        self.holes += 1;
                    }
                }
                hash_map::Entry::Vacant(entry) => {
                    if weight > 0 {
                        entry.insert(Slot {
                            position: self.slots.len(),
                            weight,
                        });
                        self.slots.push(Some(row.clone()));
                    } else {
                        tracing::trace!(?row, weight, "retraction of absent row ignored");
                    }
                }
            }
        }
        // Rewrite the slot array once tombstones outnumber live rows; this
        // keeps reads O(live) and is amortized O(n).
        if self.holes > self.slots.len() - self.holes {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let mut dense = Vec::with_capacity(self.slots.len() - self.holes);
        for slot in self.slots.drain(..).flatten() {
            if let Some(entry) = self.weights.get_mut(&slot) {
                entry.position = dense.len();
            }
            dense.push(Some(slot));
        }
        self.slots = dense;
        self.holes = 0;
    }

    fn values(&self) -> Vec<Row> {
        let mut rows = Vec::new();
        for row in self.slots.iter().flatten() {
            let weight = self.weights[row].weight;
            for _ in 0..weight {
                rows.push(row.clone());
            }
        }
        if !self.order_by.is_empty() {
            let keys = self.order_by.clone();
            rows.sort_by(|a, b| {
                for &(index, descending) in &keys {
                    let ordering = a.col(index).cmp(b.col(index));
                    let ordering = if descending { ordering.reverse() } else { ordering };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows
    }
}

/// Snapshot reader over a view's integrated contents.
///
/// Cheap to clone; all clones observe the same underlying store, which the
/// circuit's sink updates after every successful step.
#[derive(Clone)]
pub struct MaterializedView {
    state: Rc<RefCell<ViewState>>,
}

impl MaterializedView {
    /// Subscribe a fresh store to `stream` and return its reader.
    pub(crate) fn attach(
        stream: &Stream<ZSet<Row>>,
        order_by: Vec<(usize, bool)>,
        limit: Option<usize>,
    ) -> Self {
        let state = Rc::new(RefCell::new(ViewState::new(order_by, limit)));
        let sink_state = state.clone();
        stream.inspect(move |delta| sink_state.borrow_mut().apply(delta));
        Self { state }
    }

    /// Current contents in presentation order: declared ORDER BY (then
    /// LIMIT) if any, insertion order otherwise.  Rows appear once per unit
    /// of weight.
    pub fn values(&self) -> Vec<Row> {
        self.state.borrow().values()
    }

    /// Total number of rows, counting multiplicities (before LIMIT).
    pub fn count(&self) -> i64 {
        self.state
            .borrow()
            .weights
            .values()
            .map(|slot| slot.weight)
            .sum()
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.borrow_mut();
        state.weights.clear();
        state.slots.clear();
        state.holes = 0;
    }

    /// Weight of one row; zero when absent.
    pub fn weight_of(&self, row: &Row) -> ZWeight {
        self.state
            .borrow()
            .weights
            .get(row)
            .map_or(0, |slot| slot.weight)
    }
}

#[cfg(test)]
mod test {
    use super::MaterializedView;
    use crate::{circuit::Root, operator::Generator, row, zset};

    #[test]
    fn integrates_deltas_and_reads_in_insertion_order() {
        let (mut root, view) = Root::build(|circuit| {
            let mut inputs = vec![
                zset! { row![1, "a"] => 1, row![2, "b"] => 1 },
                zset! { row![1, "a"] => -1, row![3, "c"] => 2 },
            ]
            .into_iter();
            let stream = circuit.add_source(Generator::new(move || inputs.next().unwrap()));
            Ok(MaterializedView::attach(&stream, Vec::new(), None))
        })
        .unwrap();

        root.step().unwrap();
        assert_eq!(view.count(), 2);

        root.step().unwrap();
        assert_eq!(view.count(), 3);
        assert_eq!(
            view.values(),
            vec![row![2, "b"], row![3, "c"], row![3, "c"]]
        );
        assert_eq!(view.weight_of(&row![3, "c"]), 2);
        assert_eq!(view.weight_of(&row![1, "a"]), 0);
    }

    #[test]
    fn order_by_and_limit_apply_at_read_time() {
        let (mut root, view) = Root::build(|circuit| {
            let mut inputs = vec![zset! {
                row!["b", 2] => 1,
                row!["a", 3] => 1,
                row!["c", 1] => 1,
            }]
            .into_iter();
            let stream = circuit.add_source(Generator::new(move || inputs.next().unwrap()));
            // ORDER BY column 1 DESC LIMIT 2.
            Ok(MaterializedView::attach(&stream, vec![(1, true)], Some(2)))
        })
        .unwrap();

        root.step().unwrap();
        assert_eq!(view.values(), vec![row!["a", 3], row!["b", 2]]);
        // LIMIT applies to the read, not to the store.
        assert_eq!(view.count(), 3);
    }

    #[test]
    fn heavy_deletion_triggers_compaction() {
        let (mut root, view) = Root::build(|circuit| {
            let mut step = 0i64;
            let stream = circuit.add_source(Generator::new(move || {
                step += 1;
                if step == 1 {
                    (0..100).map(|n| (row![n], 1)).collect()
                } else {
                    (0..99).map(|n| (row![n], -1)).collect()
                }
            }));
            Ok(MaterializedView::attach(&stream, Vec::new(), None))
        })
        .unwrap();

        root.step().unwrap();
        assert_eq!(view.count(), 100);
        root.step().unwrap();
        assert_eq!(view.count(), 1);
        assert_eq!(view.values(), vec![row![99]]);
    }
}
