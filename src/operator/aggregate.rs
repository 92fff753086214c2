//! Aggregation operators.
//!
//! [`Aggregate`] maintains per-group running state (counts, sums, and
//! value multisets for MIN/MAX) and re-emits a group's output row whenever
//! the group changes: the previously emitted row is retracted with weight
//! `-1` and the new row inserted with `+1`.  Output deltas are keyed by the
//! full output row content, so a changed aggregate value never cancels
//! against its own retraction.
//!
//! `COUNT` and `SUM` without GROUP BY are linear and available as the
//! stateless [`count`](Stream::count) / [`sum_by`](Stream::sum_by) stream
//! combinators; the SQL compiler instead routes global aggregates through
//! `Aggregate` with the empty group key so that scalar views retract and
//! re-emit like any other view.

use crate::{
    algebra::{ZSet, ZWeight},
    circuit::{
        operator_traits::{Operator, UnaryOperator},
        Stream,
    },
    data::{Row, Value},
    error::StepError,
};
use hashbrown::{HashMap, HashSet};
use std::{borrow::Cow, collections::BTreeMap, hash::Hash, marker::PhantomData, rc::Rc};

/// Extracts the group key from an input row.
pub type GroupFunc = Rc<dyn Fn(&Row) -> Row>;

/// Evaluates the aggregated expression on an input row.
pub type AggInputFunc = Rc<dyn Fn(&Row) -> Result<Value, StepError>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// One aggregate output column.
#[derive(Clone)]
pub struct AggSpec {
    pub kind: AggKind,
    /// `None` is `COUNT(*)`; for every other kind an input is required.
    pub input: Option<AggInputFunc>,
}

impl AggSpec {
    pub fn count_star() -> Self {
        Self {
            kind: AggKind::Count,
            input: None,
        }
    }

    pub fn new(kind: AggKind, input: AggInputFunc) -> Self {
        Self {
            kind,
            input: Some(input),
        }
    }
}

/// Group key extractor reading a fixed set of columns.
pub fn group_by_columns(indices: Vec<usize>) -> GroupFunc {
    Rc::new(move |row: &Row| indices.iter().map(|&i| row.col(i).clone()).collect())
}

/// Group key for global aggregates: every row lands in the empty group.
pub fn global_group() -> GroupFunc {
    Rc::new(|_: &Row| Row::default())
}

/// Running sum over a numeric column.  Integer and float contributions are
/// tracked separately so retracting a float never perturbs exact integer
/// sums; `rows` counts non-NULL inputs by weight.
#[derive(Clone, Debug, Default)]
struct NumAcc {
    int: i64,
    float: f64,
    float_seen: bool,
    rows: ZWeight,
}

impl NumAcc {
    fn apply(&mut self, value: &Value, weight: ZWeight) -> Result<(), StepError> {
        match value {
            Value::Null => Ok(()),
            Value::Int(i) => {
                let product = i.checked_mul(weight).ok_or(StepError::IntegerOverflow)?;
                self.int = self
                    .int
                    .checked_add(product)
                    .ok_or(StepError::IntegerOverflow)?;
                self.rows += weight;
                Ok(())
            }
            Value::Double(d) => {
                self.float += d.0 * weight as f64;
                self.float_seen = true;
                self.rows += weight;
                Ok(())
            }
            other => Err(StepError::TypeMismatch {
                op: "aggregate",
                left: "numeric",
                right: other.type_name(),
            }),
        }
    }

    fn sum(&self) -> Value {
        if self.rows <= 0 {
            Value::Null
        } else if self.float_seen {
            Value::double(self.int as f64 + self.float)
        } else {
            Value::Int(self.int)
        }
    }

    fn avg(&self) -> Value {
        if self.rows <= 0 {
            Value::Null
        } else {
            Value::double((self.int as f64 + self.float) / self.rows as f64)
        }
    }
}

#[derive(Clone, Debug)]
enum AggAcc {
    Count { rows: ZWeight },
    Sum(NumAcc),
    Avg(NumAcc),
    /// Multiset of live values; the extremum is read from the edge, so
    /// deleting the current extremum advances to the next one.
    Min(BTreeMap<Value, ZWeight>),
    Max(BTreeMap<Value, ZWeight>),
}

impl AggAcc {
    fn new(kind: AggKind) -> Self {
        match kind {
            AggKind::Count => Self::Count { rows: 0 },
            AggKind::Sum => Self::Sum(NumAcc::default()),
            AggKind::Avg => Self::Avg(NumAcc::default()),
            AggKind::Min => Self::Min(BTreeMap::new()),
            AggKind::Max => Self::Max(BTreeMap::new()),
        }
    }

    fn apply(&mut self, spec: &AggSpec, row: &Row, weight: ZWeight) -> Result<(), StepError> {
        match self {
            Self::Count { rows } => {
                match &spec.input {
                    // COUNT(*) counts rows, COUNT(expr) non-NULL values.
                    None => *rows += weight,
                    Some(input) => {
                        if !input(row)?.is_null() {
                            *rows += weight;
                        }
                    }
                }
                Ok(())
            }
            Self::Sum(acc) | Self::Avg(acc) => {
                let input = spec.input.as_ref().expect("SUM/AVG carry an input");
                acc.apply(&input(row)?, weight)
            }
            Self::Min(values) | Self::Max(values) => {
                let input = spec.input.as_ref().expect("MIN/MAX carry an input");
                let value = input(row)?;
                if !value.is_null() {
                    let entry = values.entry(value.clone()).or_insert(0);
                    *entry += weight;
                    if *entry <= 0 {
                        values.remove(&value);
                    }
                }
                Ok(())
            }
        }
    }

    fn output(&self) -> Value {
        match self {
            Self::Count { rows } => Value::Int(*rows),
            Self::Sum(acc) => acc.sum(),
            Self::Avg(acc) => acc.avg(),
            Self::Min(values) => values
                .keys()
                .next()
                .cloned()
                .unwrap_or(Value::Null),
            Self::Max(values) => values
                .keys()
                .next_back()
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

#[derive(Clone, Debug)]
struct GroupState {
    /// Sum of input weights in this group; positive means the group is live.
    count: ZWeight,
    accs: Vec<AggAcc>,
    /// The only output currently accounted for; a new output must be
    /// preceded by its retraction.
    last_output: Option<Row>,
}

impl GroupState {
    fn new(specs: &[AggSpec]) -> Self {
        Self {
            count: 0,
            accs: specs.iter().map(|spec| AggAcc::new(spec.kind)).collect(),
            last_output: None,
        }
    }

    fn output_row(&self, group_key: &Row) -> Row {
        group_key
            .values()
            .iter()
            .cloned()
            .chain(self.accs.iter().map(AggAcc::output))
            .collect()
    }
}

impl Stream<ZSet<Row>> {
    /// GROUP BY aggregation: one output row per live group, retracted and
    /// re-emitted whenever the group's aggregates change.
    pub fn aggregate(&self, group: GroupFunc, specs: Vec<AggSpec>) -> Self {
        self.circuit()
            .add_unary_operator(Aggregate::new(group, specs), self)
    }
}

/// GROUP BY aggregation with per-group running state.
pub struct Aggregate {
    group: GroupFunc,
    specs: Vec<AggSpec>,
    groups: HashMap<Row, GroupState>,
    /// First-touch snapshots of group entries mutated this step.
    undo: Vec<(Row, Option<GroupState>)>,
    touched: HashSet<Row>,
}

impl Aggregate {
    pub fn new(group: GroupFunc, specs: Vec<AggSpec>) -> Self {
        Self {
            group,
            specs,
            groups: HashMap::new(),
            undo: Vec::new(),
            touched: HashSet::new(),
        }
    }
}

impl Operator for Aggregate {
    fn name(&self) -> Cow<'static, str> {
        Cow::from("Aggregate")
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn commit(&mut self) {
        self.undo.clear();
        self.touched.clear();
    }

    fn abort(&mut self) {
        for (key, old) in self.undo.drain(..) {
            match old {
                Some(state) => {
                    self.groups.insert(key, state);
                }
                None => {
                    self.groups.remove(&key);
                }
            }
        }
        self.touched.clear();
    }

    fn reset(&mut self) {
        self.groups.clear();
        self.undo.clear();
        self.touched.clear();
    }
}

impl UnaryOperator<ZSet<Row>, ZSet<Row>> for Aggregate {
    fn eval(&mut self, delta: &ZSet<Row>) -> Result<ZSet<Row>, StepError> {
        let Self {
            group,
            specs,
            groups,
            undo,
            touched,
        } = self;

        // Affected groups first, so each group is processed exactly once.
        let mut by_group: HashMap<Row, Vec<(&Row, ZWeight)>> = HashMap::new();
        for (row, weight) in delta.entries() {
            by_group.entry(group(row)).or_default().push((row, weight));
        }

        let mut output = ZSet::new();
        for (group_key, entries) in by_group {
            if touched.insert(group_key.clone()) {
                undo.push((group_key.clone(), groups.get(&group_key).cloned()));
            }
            let state = groups
                .entry(group_key.clone())
                .or_insert_with(|| GroupState::new(specs));

            for (row, weight) in entries {
                state.count += weight;
                for (spec, acc) in specs.iter().zip(state.accs.iter_mut()) {
                    acc.apply(spec, row, weight)?;
                }
            }

            if let Some(old) = state.last_output.take() {
                output.insert(old, -1);
            }
            if state.count > 0 {
                let new = state.output_row(&group_key);
                output.insert(new.clone(), 1);
                state.last_output = Some(new);
            } else {
                groups.remove(&group_key);
            }
        }

        Ok(output)
    }
}

/// Linear scalar combinators: deltas in, scalar deltas out.
impl<D> Stream<ZSet<D>>
where
    D: Clone + Eq + Hash + 'static,
{
    /// Sum of delta weights; integrate for the running cardinality.
    pub fn count(&self) -> Stream<ZWeight> {
        self.circuit().add_unary_operator(CountDelta::new(), self)
    }

    /// Weighted sum `Σ weight · func(element)` of the delta.
    pub fn sum_by<F>(&self, func: F) -> Stream<ZWeight>
    where
        F: Fn(&D) -> ZWeight + 'static,
    {
        self.circuit()
            .add_unary_operator(SumDelta::new(func), self)
    }
}

/// Emits the sum of input delta weights.  Linear.
pub struct CountDelta<D> {
    _type: PhantomData<D>,
}

impl<D> CountDelta<D> {
    pub fn new() -> Self {
        Self { _type: PhantomData }
    }
}

impl<D> Default for CountDelta<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Operator for CountDelta<D>
where
    D: 'static,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from("CountDelta")
    }
}

impl<D> UnaryOperator<ZSet<D>, ZWeight> for CountDelta<D>
where
    D: Clone + Eq + Hash + 'static,
{
    fn eval(&mut self, delta: &ZSet<D>) -> Result<ZWeight, StepError> {
        Ok(delta.count())
    }
}

/// Emits the weighted sum of a function of the input delta.  Linear.
pub struct SumDelta<D, F> {
    func: F,
    _type: PhantomData<D>,
}

impl<D, F> SumDelta<D, F> {
    pub fn new(func: F) -> Self {
        Self {
            func,
            _type: PhantomData,
        }
    }
}

impl<D, F> Operator for SumDelta<D, F>
where
    D: 'static,
    F: 'static,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from("SumDelta")
    }
}

impl<D, F> UnaryOperator<ZSet<D>, ZWeight> for SumDelta<D, F>
where
    D: Clone + Eq + Hash + 'static,
    F: Fn(&D) -> ZWeight + 'static,
{
    fn eval(&mut self, delta: &ZSet<D>) -> Result<ZWeight, StepError> {
        Ok(delta.sum_by(&self.func))
    }
}

#[cfg(test)]
mod test {
    use super::{global_group, group_by_columns, AggKind, AggSpec};
    use crate::{circuit::Root, data::{Row, Value}, operator::Generator, row, zset};
    use std::{cell::RefCell, rc::Rc};

    fn column_input(index: usize) -> AggSpec {
        AggSpec::new(
            AggKind::Sum,
            Rc::new(move |row: &Row| Ok(row.col(index).clone())),
        )
    }

    fn spec(kind: AggKind, index: usize) -> AggSpec {
        AggSpec::new(
            kind,
            Rc::new(move |row: &Row| Ok(row.col(index).clone())),
        )
    }

    // sales(region, amt) grouped by region with SUM(amt).
    #[test]
    fn group_by_sum_retracts_and_reemits() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_clone = observed.clone();

        let inputs = vec![
            zset! { row!["NA", 100] => 1, row!["NA", 200] => 1, row!["EU", 150] => 1 },
            zset! { row!["NA", 50] => 1 },
            zset! { row!["EU", 150] => -1 },
        ];

        let (mut root, ()) = Root::build(|circuit| {
            let mut feed = inputs.into_iter();
            circuit
                .add_source(Generator::new(move || feed.next().unwrap()))
                .aggregate(group_by_columns(vec![0]), vec![column_input(1)])
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
                zset! { row!["NA", 300] => 1, row!["EU", 150] => 1 },
                zset! { row!["NA", 300] => -1, row!["NA", 350] => 1 },
                // Group purged: retraction only.
                zset! { row!["EU", 150] => -1 },
            ]
        );
    }

    // Deleting the current extremum must advance MIN to the next live value.
    #[test]
    fn min_survives_deletion_of_extremum() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_clone = observed.clone();

        let inputs = vec![
            zset! { row!["g", 5] => 1, row!["g", 3] => 1, row!["g", 9] => 1 },
            zset! { row!["g", 3] => -1 },
            zset! { row!["g", 5] => -1 },
        ];

        let (mut root, ()) = Root::build(|circuit| {
            let mut feed = inputs.into_iter();
            circuit
                .add_source(Generator::new(move || feed.next().unwrap()))
                .aggregate(group_by_columns(vec![0]), vec![spec(AggKind::Min, 1)])
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
                zset! { row!["g", 3] => 1 },
                zset! { row!["g", 3] => -1, row!["g", 5] => 1 },
                zset! { row!["g", 5] => -1, row!["g", 9] => 1 },
            ]
        );
    }

    #[test]
    fn global_aggregates_use_the_empty_group() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_clone = observed.clone();

        let inputs = vec![
            zset! { row![1, 10] => 1, row![2, 20] => 1, row![3, 30] => 1 },
            zset! { row![4, 40] => 1 },
        ];

        let (mut root, ()) = Root::build(|circuit| {
            let mut feed = inputs.into_iter();
            circuit
                .add_source(Generator::new(move || feed.next().unwrap()))
                .aggregate(
                    global_group(),
                    vec![column_input(1), AggSpec::count_star()],
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
                zset! { row![60, 3] => 1 },
                zset! { row![60, 3] => -1, row![100, 4] => 1 },
            ]
        );
    }

    #[test]
    fn count_ignores_nulls_only_with_an_argument() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_clone = observed.clone();

        let (mut root, ()) = Root::build(|circuit| {
            let mut feed = vec![zset! {
                Row::new(vec![Value::from("a"), Value::Null]) => 1,
                row!["a", 1] => 1,
            }]
            .into_iter();
            circuit
                .add_source(Generator::new(move || feed.next().unwrap()))
                .aggregate(
                    group_by_columns(vec![0]),
                    vec![
                        AggSpec::count_star(),
                        AggSpec::new(
                            AggKind::Count,
                            Rc::new(|row: &Row| Ok(row.col(1).clone())),
                        ),
                    ],
                )
                .inspect(move |delta| observed_clone.borrow_mut().push(delta.clone()));
            Ok(())
        })
        .unwrap();

        root.step().unwrap();
        assert_eq!(
            observed.borrow().as_slice(),
            &[zset! { row!["a", 2, 1] => 1 }]
        );
    }

    #[test]
    fn avg_tracks_running_ratio() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_clone = observed.clone();

        let inputs = vec![
            zset! { row!["g", 10] => 1, row!["g", 20] => 1 },
            zset! { row!["g", 30] => 1 },
        ];

        let (mut root, ()) = Root::build(|circuit| {
            let mut feed = inputs.into_iter();
            circuit
                .add_source(Generator::new(move || feed.next().unwrap()))
                .aggregate(group_by_columns(vec![0]), vec![spec(AggKind::Avg, 1)])
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
                zset! { row!["g", 15.0] => 1 },
                zset! { row!["g", 15.0] => -1, row!["g", 20.0] => 1 },
            ]
        );
    }

    #[test]
    fn linear_count_and_sum() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let observed_clone = observed.clone();

        let inputs = vec![
            zset! { 10i64 => 1, 20 => 1, 30 => 1 },
            zset! { 40 => 1 },
            zset! { 10 => -1 },
        ];

        let (mut root, ()) = Root::build(|circuit| {
            let mut feed = inputs.into_iter();
            let source = circuit.add_source(Generator::new(move || feed.next().unwrap()));
            let sums = source.sum_by(|&v| v).integrate();
            sums.inspect(move |total| observed_clone.borrow_mut().push(*total));
            source.count().integrate().inspect(|_| {});
            Ok(())
        })
        .unwrap();

        for _ in 0..3 {
            root.step().unwrap();
        }
        assert_eq!(observed.borrow().as_slice(), &[60, 100, 90]);
    }
}
