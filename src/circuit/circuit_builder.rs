//! API to construct circuits.
//!
//! A circuit is a dataflow graph of operators connected by streams.  Adding
//! an operator yields a handle to its output stream that can be used as
//! input to further operators.  Streams are synchronous: each one holds at
//! most one value, produced and consumed within the same step.
//!
//! # Examples
//!
//! ```
//! use deltaflow::{operator::Generator, Root};
//!
//! let (mut root, _) = Root::build(|circuit| {
//!     let mut n = 0;
//!     let source = circuit.add_source(Generator::new(move || {
//!         n += 1;
//!         n
//!     }));
//!     source.inspect(|n| println!("tick: {}", n));
//!     Ok(())
//! })
//! .unwrap();
//!
//! root.step().unwrap();
//! ```

use crate::{
    algebra::MonoidValue,
    circuit::{
        operator_traits::{
            BinaryOperator, Data, Operator, SinkOperator, SourceOperator, UnaryOperator,
        },
        schedule::Schedule,
    },
    error::{CompileError, StepError},
};
use hashbrown::HashMap;
use std::{
    borrow::Cow,
    cell::RefCell,
    fmt::{self, Debug, Display, Write},
    rc::Rc,
};

/// Id of an operator, unique within a circuit.  Ids are handed out in
/// registration order, which is also the order sinks fire in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct NodeId(pub(crate) usize);

impl Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NodeId(")?;
        Debug::fmt(&self.0, f)?;
        f.write_char(')')
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char('n')?;
        Debug::fmt(&self.0, f)
    }
}

/// A stream stores the output of an operator.  Circuits are synchronous,
/// meaning that each value is produced and consumed in the same step, so
/// there is at most one value in the stream at any time.
pub struct Stream<D> {
    /// Id of the operator that writes to this stream.
    id: NodeId,
    /// Circuit that this stream belongs to.
    circuit: Circuit,
    /// The value slot, shared with the producing node and all consumers.
    slot: Rc<RefCell<Option<D>>>,
}

impl<D> Clone for Stream<D> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            circuit: self.circuit.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<D> Stream<D> {
    fn new(circuit: Circuit, id: NodeId) -> Self {
        Self {
            id,
            circuit,
            slot: Rc::new(RefCell::new(None)),
        }
    }

    /// Id of the operator that writes to this stream.
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    /// The circuit this stream belongs to.
    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }
}

/// Reads the current value of a stream slot, panicking if the producing node
/// has not run yet.  The scheduler's topological order makes that
/// unreachable.
fn read_slot<D, R>(slot: &RefCell<Option<D>>, func: impl FnOnce(&D) -> R) -> R {
    let value = slot.borrow();
    func(value
        .as_ref()
        .expect("operator scheduled before its input is ready"))
}

/// Node in a circuit: an operator plus its input and output stream slots.
trait Node {
    fn id(&self) -> NodeId;
    fn name(&self) -> Cow<'static, str>;
    fn is_sink(&self) -> bool {
        false
    }

    /// Evaluate the operator: read one value from each input slot, write the
    /// output slot.
    fn eval(&mut self) -> Result<(), StepError>;

    fn commit(&mut self);
    fn abort(&mut self);
    fn reset(&mut self);
    fn clear_slot(&mut self);
}

struct SourceNode<O, Op> {
    operator: Op,
    output: Rc<RefCell<Option<O>>>,
    id: NodeId,
}

impl<O, Op> Node for SourceNode<O, Op>
where
    Op: SourceOperator<O>,
{
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> Cow<'static, str> {
        self.operator.name()
    }

    fn eval(&mut self) -> Result<(), StepError> {
        *self.output.borrow_mut() = Some(self.operator.eval());
        Ok(())
    }

    fn commit(&mut self) {
        self.operator.commit();
    }

    fn abort(&mut self) {
        self.operator.abort();
    }

    fn reset(&mut self) {
        self.operator.reset();
    }

    fn clear_slot(&mut self) {
        *self.output.borrow_mut() = None;
    }
}

/// A named input: values are staged through an [`InputHandle`] and surface
/// in the input's output stream on the next step.  Steps that were not fed
/// see the empty (zero) value.
struct InputNode<D> {
    pending: Rc<RefCell<Option<D>>>,
    output: Rc<RefCell<Option<D>>>,
    name: String,
    id: NodeId,
}

impl<D> Node for InputNode<D>
where
    D: MonoidValue,
{
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> Cow<'static, str> {
        Cow::from(format!("Input({})", self.name))
    }

    fn eval(&mut self) -> Result<(), StepError> {
        let delta = self.pending.borrow_mut().take().unwrap_or_else(D::zero);
        *self.output.borrow_mut() = Some(delta);
        Ok(())
    }

    fn commit(&mut self) {}

    fn abort(&mut self) {}

    fn reset(&mut self) {
        *self.pending.borrow_mut() = None;
    }

    fn clear_slot(&mut self) {
        *self.output.borrow_mut() = None;
    }
}

struct UnaryNode<I, O, Op> {
    operator: Op,
    input: Rc<RefCell<Option<I>>>,
    output: Rc<RefCell<Option<O>>>,
    id: NodeId,
}

impl<I, O, Op> Node for UnaryNode<I, O, Op>
where
    Op: UnaryOperator<I, O>,
{
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> Cow<'static, str> {
        self.operator.name()
    }

    fn eval(&mut self) -> Result<(), StepError> {
        let operator = &mut self.operator;
        let output = read_slot(&self.input, |input| operator.eval(input))?;
        *self.output.borrow_mut() = Some(output);
        Ok(())
    }

    fn commit(&mut self) {
        self.operator.commit();
    }

    fn abort(&mut self) {
        self.operator.abort();
    }

    fn reset(&mut self) {
        self.operator.reset();
    }

    fn clear_slot(&mut self) {
        *self.output.borrow_mut() = None;
    }
}

struct BinaryNode<I1, I2, O, Op> {
    operator: Op,
    left: Rc<RefCell<Option<I1>>>,
    right: Rc<RefCell<Option<I2>>>,
    output: Rc<RefCell<Option<O>>>,
    id: NodeId,
}

impl<I1, I2, O, Op> Node for BinaryNode<I1, I2, O, Op>
where
    Op: BinaryOperator<I1, I2, O>,
{
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> Cow<'static, str> {
        self.operator.name()
    }

    fn eval(&mut self) -> Result<(), StepError> {
        let operator = &mut self.operator;
        let left = &self.left;
        let output = read_slot(&self.right, |right| {
            read_slot(left, |left| operator.eval(left, right))
        })?;
        *self.output.borrow_mut() = Some(output);
        Ok(())
    }

    fn commit(&mut self) {
        self.operator.commit();
    }

    fn abort(&mut self) {
        self.operator.abort();
    }

    fn reset(&mut self) {
        self.operator.reset();
    }

    fn clear_slot(&mut self) {
        *self.output.borrow_mut() = None;
    }
}

struct SinkNode<I, Op> {
    operator: Op,
    input: Rc<RefCell<Option<I>>>,
    id: NodeId,
}

impl<I, Op> Node for SinkNode<I, Op>
where
    Op: SinkOperator<I>,
{
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> Cow<'static, str> {
        self.operator.name()
    }

    fn is_sink(&self) -> bool {
        true
    }

    fn eval(&mut self) -> Result<(), StepError> {
        let operator = &mut self.operator;
        read_slot(&self.input, |input| operator.eval(input))
    }

    fn commit(&mut self) {
        self.operator.commit();
    }

    fn abort(&mut self) {
        self.operator.abort();
    }

    fn reset(&mut self) {
        self.operator.reset();
    }

    fn clear_slot(&mut self) {}
}

/// Feeds deltas to a named circuit input.
///
/// Values sent between two steps accumulate by addition; a step consumes the
/// staged value and leaves the handle empty.
pub struct InputHandle<D> {
    pending: Rc<RefCell<Option<D>>>,
}

impl<D> Clone for InputHandle<D> {
    fn clone(&self) -> Self {
        Self {
            pending: self.pending.clone(),
        }
    }
}

impl<D> InputHandle<D>
where
    D: MonoidValue,
{
    /// Stage `delta` for the next step.
    pub fn send(&self, delta: D) {
        let mut pending = self.pending.borrow_mut();
        *pending = Some(match pending.take() {
            Some(mut staged) => {
                staged += delta;
                staged
            }
            None => delta,
        });
    }

    /// Discard anything staged but not yet consumed by a step.
    pub fn clear(&self) {
        *self.pending.borrow_mut() = None;
    }
}

struct CircuitInner {
    nodes: Vec<Box<dyn Node>>,
    edges: Vec<(NodeId, NodeId)>,
    inputs: HashMap<String, NodeId>,
    /// Invalidated whenever a node is added; rebuilt lazily by `step`.
    schedule: Option<Schedule>,
    /// Sink failures recorded during the most recent step.
    sink_failures: Vec<(NodeId, StepError)>,
}

/// A handle to a circuit under construction.
///
/// Handles are cheaply cloneable and shared by every [`Stream`] of the
/// circuit.  Operators may be added at any time before a step; the execution
/// schedule is recomputed lazily.
pub struct Circuit {
    inner: Rc<RefCell<CircuitInner>>,
}

impl Clone for Circuit {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Circuit {
    fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(CircuitInner {
                nodes: Vec::new(),
                edges: Vec::new(),
                inputs: HashMap::new(),
                schedule: None,
                sink_failures: Vec::new(),
            })),
        }
    }

    fn allocate_id(inner: &CircuitInner) -> NodeId {
        NodeId(inner.nodes.len())
    }

    fn assert_same_circuit<D>(&self, stream: &Stream<D>) {
        assert!(
            Rc::ptr_eq(&self.inner, &stream.circuit.inner),
            "stream belongs to a different circuit"
        );
    }

    /// Declare a named input keyed by the payload's structural identity.
    /// The returned stream carries the staged delta on every step, or the
    /// zero value for steps the input was not fed.
    pub fn add_input<D>(&self, name: &str) -> Result<(Stream<D>, InputHandle<D>), CompileError>
    where
        D: MonoidValue,
    {
        let mut inner = self.inner.borrow_mut();
        if inner.inputs.contains_key(name) {
            return Err(CompileError::DuplicateTable(name.to_owned()));
        }

        let id = Self::allocate_id(&inner);
        let stream = Stream::new(self.clone(), id);
        let handle = InputHandle {
            pending: Rc::new(RefCell::new(None)),
        };
        inner.nodes.push(Box::new(InputNode {
            pending: handle.pending.clone(),
            output: stream.slot.clone(),
            name: name.to_owned(),
            id,
        }));
        inner.inputs.insert(name.to_owned(), id);
        inner.schedule = None;

        Ok((stream, handle))
    }

    /// Add a source operator to the circuit.  See [`SourceOperator`].
    pub fn add_source<O, Op>(&self, operator: Op) -> Stream<O>
    where
        O: Data,
        Op: SourceOperator<O>,
    {
        let mut inner = self.inner.borrow_mut();
        let id = Self::allocate_id(&inner);
        let stream = Stream::new(self.clone(), id);
        inner.nodes.push(Box::new(SourceNode {
            operator,
            output: stream.slot.clone(),
            id,
        }));
        inner.schedule = None;
        stream
    }

    /// Add a unary operator wired to `input`.  See [`UnaryOperator`].
    pub fn add_unary_operator<I, O, Op>(&self, operator: Op, input: &Stream<I>) -> Stream<O>
    where
        I: Data,
        O: Data,
        Op: UnaryOperator<I, O>,
    {
        self.assert_same_circuit(input);
        let mut inner = self.inner.borrow_mut();
        let id = Self::allocate_id(&inner);
        let stream = Stream::new(self.clone(), id);
        inner.nodes.push(Box::new(UnaryNode {
            operator,
            input: input.slot.clone(),
            output: stream.slot.clone(),
            id,
        }));
        inner.edges.push((input.id, id));
        inner.schedule = None;
        stream
    }

    /// Add a binary operator wired to `left` and `right`.
    /// See [`BinaryOperator`].
    pub fn add_binary_operator<I1, I2, O, Op>(
        &self,
        operator: Op,
        left: &Stream<I1>,
        right: &Stream<I2>,
    ) -> Stream<O>
    where
        I1: Data,
        I2: Data,
        O: Data,
        Op: BinaryOperator<I1, I2, O>,
    {
        self.assert_same_circuit(left);
        self.assert_same_circuit(right);
        let mut inner = self.inner.borrow_mut();
        let id = Self::allocate_id(&inner);
        let stream = Stream::new(self.clone(), id);
        inner.nodes.push(Box::new(BinaryNode {
            operator,
            left: left.slot.clone(),
            right: right.slot.clone(),
            output: stream.slot.clone(),
            id,
        }));
        inner.edges.push((left.id, id));
        inner.edges.push((right.id, id));
        inner.schedule = None;
        stream
    }

    /// Subscribe a sink operator to `input`.  Sinks on the same stream fire
    /// in registration order, after all operators have run.
    pub fn add_sink<I, Op>(&self, operator: Op, input: &Stream<I>) -> NodeId
    where
        I: Data,
        Op: SinkOperator<I>,
    {
        self.assert_same_circuit(input);
        let mut inner = self.inner.borrow_mut();
        let id = Self::allocate_id(&inner);
        inner.nodes.push(Box::new(SinkNode {
            operator,
            input: input.slot.clone(),
            id,
        }));
        inner.edges.push((input.id, id));
        inner.schedule = None;
        id
    }
}

/// A circuit ready for execution.
///
/// `Root` drives the step protocol: evaluate every node in topological
/// order, commit stateful operators, then fire sinks.  A failing node aborts
/// the step, rolling already-evaluated operators back, so integrated state
/// is exactly as it was before the step.
pub struct Root {
    circuit: Circuit,
}

impl Root {
    pub fn new() -> Self {
        Self {
            circuit: Circuit::new(),
        }
    }

    /// Construct a circuit through `constructor` and wrap it for execution.
    /// The constructor's return value is handed back to the caller, which is
    /// how input handles and streams escape the closure.
    pub fn build<F, T>(constructor: F) -> Result<(Self, T), CompileError>
    where
        F: FnOnce(&Circuit) -> Result<T, CompileError>,
    {
        let root = Self::new();
        let token = constructor(&root.circuit)?;
        Ok((root, token))
    }

    /// Handle for adding further operators; used by the SQL compiler to
    /// grow the circuit between steps.
    pub fn circuit(&self) -> Circuit {
        self.circuit.clone()
    }

    /// Execute one step: every operator runs exactly once, after all of its
    /// upstream operators, then sinks fire in registration order.
    pub fn step(&mut self) -> Result<(), StepError> {
        let mut inner = self.circuit.inner.borrow_mut();
        let inner = &mut *inner;

        if inner.schedule.is_none() {
            inner.schedule = Some(Schedule::prepare(
                inner.nodes.len(),
                &inner.edges,
                |id| inner.nodes[id.0].is_sink(),
            ));
        }
        let schedule = inner.schedule.as_ref().unwrap();
        tracing::debug!(operators = schedule.order().len(), sinks = schedule.sinks().len(), "step");

        let mut evaluated = Vec::with_capacity(schedule.order().len());
        let mut failure = None;
        for &id in schedule.order() {
            match inner.nodes[id.0].eval() {
                Ok(()) => evaluated.push(id),
                Err(error) => {
                    let operator = inner.nodes[id.0].name();
                    tracing::debug!(node = %id, %operator, %error, "step aborted");
                    // The failing node may have applied part of its state
                    // changes before erroring; it aborts along with the
                    // nodes that ran before it.
                    evaluated.push(id);
                    failure = Some(error);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            for &id in &evaluated {
                inner.nodes[id.0].abort();
            }
            for node in inner.nodes.iter_mut() {
                node.clear_slot();
            }
            return Err(error);
        }

        for &id in schedule.order() {
            inner.nodes[id.0].commit();
        }

        inner.sink_failures.clear();
        for &id in schedule.sinks() {
            if let Err(error) = inner.nodes[id.0].eval() {
                let operator = inner.nodes[id.0].name();
                tracing::warn!(node = %id, %operator, %error, "sink failed");
                inner.sink_failures.push((id, error));
            }
        }

        for node in inner.nodes.iter_mut() {
            node.clear_slot();
        }
        Ok(())
    }

    /// Reset every stateful operator to its initial state and clear staged
    /// inputs and intermediate values.
    pub fn reset(&mut self) {
        let mut inner = self.circuit.inner.borrow_mut();
        for node in inner.nodes.iter_mut() {
            node.reset();
            node.clear_slot();
        }
        inner.sink_failures.clear();
    }

    /// Sink failures recorded during the most recent step.
    pub fn sink_failures(&self) -> Vec<(NodeId, StepError)> {
        self.circuit.inner.borrow().sink_failures.clone()
    }
}

impl Default for Root {
    fn default() -> Self {
        Self::new()
    }
}
