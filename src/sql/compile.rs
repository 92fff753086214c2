//! Compilation of SQL statements into circuit operators.
//!
//! Compilation is two-phase.  Planning resolves every name and expression
//! against a shadow catalog and produces a small plan tree; nothing touches
//! the circuit, so a failing statement leaves no trace.  Instantiation then
//! walks the plans, adding inputs and operators.  [`Program`] ties the two
//! to a [`Root`] circuit and owns the per-table upsert stores.

use crate::{
    algebra::ZSet,
    circuit::{NodeId, Root, Stream},
    data::{Row, Value},
    error::{CompileError, StepError},
    input::{DeltaOp, UpsertHandle},
    operator::{
        aggregate::{global_group, group_by_columns, AggKind, AggSpec},
        join::{column_key, concat_rows, fingerprint_key, JoinMode, KeyFunc},
    },
    sql::{
        ast::{
            AggFunc, ColumnRef, CreateTable, CreateView, Expr, JoinKind, Select, SelectItem,
            SetExpr, SqlType, Statement, TableRef,
        },
        expr::{compile_expr, compile_with, display_ref, CompiledExpr, Schema},
        parser,
    },
    view::MaterializedView,
};
use hashbrown::HashMap;
use std::rc::Rc;

/// Resolved query plan; every expression is compiled and every name is an
/// index by the time a plan exists.
enum PlanNode {
    Table(String),
    View(String),
    Filter {
        input: Box<PlanNode>,
        predicate: CompiledExpr,
    },
    Project {
        input: Box<PlanNode>,
        exprs: Vec<CompiledExpr>,
    },
    Join {
        kind: JoinKind,
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        /// Column index of the join key on each side; `None` for CROSS.
        on: Option<(usize, usize)>,
        left_pk: Option<usize>,
        right_pk: Option<usize>,
        left_width: usize,
        right_width: usize,
    },
    Aggregate {
        input: Box<PlanNode>,
        group_cols: Vec<usize>,
        specs: Vec<PlanAgg>,
    },
    Union {
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        all: bool,
    },
}

struct PlanAgg {
    kind: AggKind,
    input: Option<CompiledExpr>,
}

enum PlannedStatement {
    Table {
        name: String,
        schema: Schema,
        types: Vec<SqlType>,
        pk_index: usize,
    },
    View {
        name: String,
        plan: PlanNode,
        schema: Schema,
        order_by: Vec<(usize, bool)>,
        limit: Option<usize>,
    },
}

#[derive(Clone)]
struct TableShape {
    schema: Schema,
    types: Vec<SqlType>,
    pk_index: usize,
}

/// Catalog used during planning: the program's current relations plus the
/// ones earlier statements of the same batch will create.
struct ShadowCatalog {
    tables: HashMap<String, TableShape>,
    views: HashMap<String, Schema>,
}

impl ShadowCatalog {
    fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name) || self.views.contains_key(name)
    }

    /// Resolve a FROM source to a plan leaf, its schema qualified by the
    /// visible name, and its primary-key column when it has one.
    fn resolve_source(
        &self,
        table: &TableRef,
    ) -> Result<(PlanNode, Schema, Option<usize>), CompileError> {
        if let Some(shape) = self.tables.get(&table.name) {
            let schema =
                Schema::from_names(Some(table.visible_name()), &shape.schema.column_names());
            return Ok((
                PlanNode::Table(table.name.clone()),
                schema,
                Some(shape.pk_index),
            ));
        }
        if let Some(view_schema) = self.views.get(&table.name) {
            let schema =
                Schema::from_names(Some(table.visible_name()), &view_schema.column_names());
            return Ok((PlanNode::View(table.name.clone()), schema, None));
        }
        Err(CompileError::UnknownRelation(table.name.clone()))
    }
}

fn agg_kind(func: AggFunc) -> AggKind {
    match func {
        AggFunc::Count => AggKind::Count,
        AggFunc::Sum => AggKind::Sum,
        AggFunc::Avg => AggKind::Avg,
        AggFunc::Min => AggKind::Min,
        AggFunc::Max => AggKind::Max,
    }
}

fn item_name(expr: &Expr, index: usize) -> String {
    match expr {
        Expr::Column(column) => column.column.clone(),
        Expr::Aggregate { func, .. } => match func {
            AggFunc::Count => "count".to_owned(),
            AggFunc::Sum => "sum".to_owned(),
            AggFunc::Avg => "avg".to_owned(),
            AggFunc::Min => "min".to_owned(),
            AggFunc::Max => "max".to_owned(),
        },
        _ => format!("col{}", index),
    }
}

fn plan_statement(
    statement: &Statement,
    shadow: &mut ShadowCatalog,
) -> Result<PlannedStatement, CompileError> {
    match statement {
        Statement::CreateTable(table) => plan_create_table(table, shadow),
        Statement::CreateView(view) => plan_create_view(view, shadow),
    }
}

fn plan_create_table(
    table: &CreateTable,
    shadow: &mut ShadowCatalog,
) -> Result<PlannedStatement, CompileError> {
    if shadow.contains(&table.name) {
        return Err(CompileError::DuplicateTable(table.name.clone()));
    }
    let mut names: Vec<&str> = Vec::with_capacity(table.columns.len());
    for column in &table.columns {
        if names.contains(&column.name.as_str()) {
            return Err(CompileError::DuplicateColumn(column.name.clone()));
        }
        names.push(&column.name);
    }
    let pk_columns: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.primary_key)
        .map(|(i, _)| i)
        .collect();
    let pk_index = match pk_columns.as_slice() {
        [] => 0,
        [index] => *index,
        _ => {
            return Err(CompileError::Unsupported(
                "more than one PRIMARY KEY column".to_owned(),
            ))
        }
    };

    let schema = Schema::from_names(None, &names);
    let types: Vec<SqlType> = table.columns.iter().map(|c| c.ty).collect();
    shadow.tables.insert(
        table.name.clone(),
        TableShape {
            schema: schema.clone(),
            types: types.clone(),
            pk_index,
        },
    );
    Ok(PlannedStatement::Table {
        name: table.name.clone(),
        schema,
        types,
        pk_index,
    })
}

fn plan_create_view(
    view: &CreateView,
    shadow: &mut ShadowCatalog,
) -> Result<PlannedStatement, CompileError> {
    if shadow.contains(&view.name) {
        return Err(CompileError::DuplicateView(view.name.clone()));
    }
    let (plan, schema) = plan_set_expr(&view.query.body, shadow)?;

    let mut order_by = Vec::with_capacity(view.query.order_by.len());
    for key in &view.query.order_by {
        order_by.push((schema.resolve_name(&key.column)?, key.descending));
    }

    let bare_schema = Schema::from_names(None, &schema.column_names());
    shadow.views.insert(view.name.clone(), bare_schema.clone());
    Ok(PlannedStatement::View {
        name: view.name.clone(),
        plan,
        schema: bare_schema,
        order_by,
        limit: view.query.limit,
    })
}

fn plan_set_expr(
    body: &SetExpr,
    shadow: &ShadowCatalog,
) -> Result<(PlanNode, Schema), CompileError> {
    match body {
        SetExpr::Select(select) => plan_select(select, shadow),
        SetExpr::Union { all, left, right } => {
            let (left_plan, left_schema) = plan_set_expr(left, shadow)?;
            let (right_plan, right_schema) = plan_set_expr(right, shadow)?;
            if left_schema.len() != right_schema.len() {
                return Err(CompileError::UnionArity {
                    left: left_schema.len(),
                    right: right_schema.len(),
                });
            }
            Ok((
                PlanNode::Union {
                    left: Box::new(left_plan),
                    right: Box::new(right_plan),
                    all: *all,
                },
                left_schema,
            ))
        }
    }
}

fn plan_select(select: &Select, shadow: &ShadowCatalog) -> Result<(PlanNode, Schema), CompileError> {
    let (mut node, mut schema, left_pk) = shadow.resolve_source(&select.from)?;

    if let Some(join) = &select.join {
        let (right_node, right_schema, right_pk) = shadow.resolve_source(&join.table)?;
        let on = match (join.kind, &join.on) {
            (JoinKind::Cross, None) => None,
            (JoinKind::Cross, Some(_)) => {
                return Err(CompileError::Unsupported(
                    "CROSS JOIN does not take ON".to_owned(),
                ))
            }
            (_, None) => {
                return Err(CompileError::Unsupported(
                    "JOIN requires an ON clause".to_owned(),
                ))
            }
            (_, Some((first, second))) => {
                // `ON a.x = b.y` in either order.
                match (schema.resolve(first), right_schema.resolve(second)) {
                    (Ok(left), Ok(right)) => Some((left, right)),
                    (first_err, _) => {
                        match (schema.resolve(second), right_schema.resolve(first)) {
                            (Ok(left), Ok(right)) => Some((left, right)),
                            _ => {
                                return Err(first_err.err().unwrap_or_else(|| {
                                    CompileError::UnknownColumn(display_ref(second))
                                }))
                            }
                        }
                    }
                }
            }
        };
        let joined_schema = schema.join(&right_schema);
        node = PlanNode::Join {
            kind: join.kind,
            left: Box::new(node),
            right: Box::new(right_node),
            on,
            left_pk,
            right_pk,
            left_width: schema.len(),
            right_width: right_schema.len(),
        };
        schema = joined_schema;
    }

    if let Some(predicate) = &select.selection {
        if predicate.contains_aggregate() {
            return Err(CompileError::MisplacedAggregate("WHERE"));
        }
        node = PlanNode::Filter {
            input: Box::new(node),
            predicate: compile_expr(predicate, &schema)?,
        };
    }

    let has_aggregates = !select.group_by.is_empty()
        || select.having.is_some()
        || select.projection.iter().any(|item| match item {
            SelectItem::Wildcard => false,
            SelectItem::Expr { expr, .. } => expr.contains_aggregate(),
        });

    if has_aggregates {
        plan_aggregation(select, node, &schema)
    } else {
        plan_projection(select, node, schema)
    }
}

/// Plain projection; `SELECT *` alone compiles to nothing at all.
fn plan_projection(
    select: &Select,
    node: PlanNode,
    schema: Schema,
) -> Result<(PlanNode, Schema), CompileError> {
    if let [SelectItem::Wildcard] = select.projection.as_slice() {
        return Ok((node, schema));
    }

    let mut exprs = Vec::new();
    let mut names = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard => {
                for (index, column) in schema.columns().iter().enumerate() {
                    exprs.push(CompiledExpr::Column(index));
                    names.push(column.name.clone());
                }
            }
            SelectItem::Expr { expr, alias } => {
                exprs.push(compile_expr(expr, &schema)?);
                names.push(
                    alias
                        .clone()
                        .unwrap_or_else(|| item_name(expr, names.len())),
                );
            }
        }
    }

    Ok((
        PlanNode::Project {
            input: Box::new(node),
            exprs,
        },
        Schema::from_names(None, &names),
    ))
}

/// GROUP BY (or global) aggregation: the aggregate operator emits rows laid
/// out as group columns followed by one slot per distinct aggregate call;
/// HAVING filters that layout and the projection maps it to the SELECT list.
fn plan_aggregation(
    select: &Select,
    node: PlanNode,
    input_schema: &Schema,
) -> Result<(PlanNode, Schema), CompileError> {
    let mut group_cols = Vec::with_capacity(select.group_by.len());
    for column in &select.group_by {
        group_cols.push(input_schema.resolve(column)?);
    }

    // Aggregate calls discovered while compiling the SELECT list and HAVING
    // share this slot table, deduplicated structurally.
    let mut slots: Vec<(AggFunc, Option<Expr>)> = Vec::new();

    let compile_over_groups = |expr: &Expr,
                                   slots: &mut Vec<(AggFunc, Option<Expr>)>|
     -> Result<CompiledExpr, CompileError> {
        let group_count = group_cols.len();
        compile_with(
            expr,
            &mut |column: &ColumnRef| {
                let index = input_schema.resolve(column)?;
                group_cols
                    .iter()
                    .position(|&g| g == index)
                    .ok_or_else(|| CompileError::UngroupedColumn(display_ref(column)))
            },
            &mut |func, arg| {
                let key = (func, arg.cloned());
                let position = match slots.iter().position(|slot| *slot == key) {
                    Some(position) => position,
                    None => {
                        slots.push(key);
                        slots.len() - 1
                    }
                };
                Ok(group_count + position)
            },
        )
    };

    let mut output_exprs = Vec::new();
    let mut names = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard => {
                // Every input column would have to be grouped; spell them out.
                for (index, column) in input_schema.columns().iter().enumerate() {
                    let position = group_cols.iter().position(|&g| g == index).ok_or_else(
                        || CompileError::UngroupedColumn(column.name.clone()),
                    )?;
                    output_exprs.push(CompiledExpr::Column(position));
                    names.push(column.name.clone());
                }
            }
            SelectItem::Expr { expr, alias } => {
                output_exprs.push(compile_over_groups(expr, &mut slots)?);
                names.push(
                    alias
                        .clone()
                        .unwrap_or_else(|| item_name(expr, names.len())),
                );
            }
        }
    }

    let having = select
        .having
        .as_ref()
        .map(|expr| compile_over_groups(expr, &mut slots))
        .transpose()?;

    let mut specs = Vec::with_capacity(slots.len());
    for (func, arg) in &slots {
        let input = arg
            .as_ref()
            .map(|expr| {
                compile_with(
                    expr,
                    &mut |column| input_schema.resolve(column),
                    &mut |_, _| {
                        Err(CompileError::Unsupported(
                            "nested aggregate function".to_owned(),
                        ))
                    },
                )
            })
            .transpose()?;
        specs.push(PlanAgg {
            kind: agg_kind(*func),
            input,
        });
    }

    let mut node = PlanNode::Aggregate {
        input: Box::new(node),
        group_cols,
        specs,
    };
    if let Some(predicate) = having {
        node = PlanNode::Filter {
            input: Box::new(node),
            predicate,
        };
    }
    let node = PlanNode::Project {
        input: Box::new(node),
        exprs: output_exprs,
    };
    Ok((node, Schema::from_names(None, &names)))
}

struct TableMeta {
    schema: Schema,
    stream: Stream<ZSet<Row>>,
}

struct ViewMeta {
    schema: Schema,
    stream: Stream<ZSet<Row>>,
    order_by: Vec<(usize, bool)>,
    limit: Option<usize>,
}

/// A compiled SQL program over one circuit: named table inputs, named view
/// outputs, and the step loop between them.
pub struct Program {
    root: Root,
    join_mode: JoinMode,
    tables: HashMap<String, TableMeta>,
    handles: HashMap<String, UpsertHandle>,
    views: HashMap<String, ViewMeta>,
    materialized: Vec<MaterializedView>,
}

impl Program {
    pub fn new() -> Self {
        Self {
            root: Root::new(),
            join_mode: JoinMode::default(),
            tables: HashMap::new(),
            handles: HashMap::new(),
            views: HashMap::new(),
            materialized: Vec::new(),
        }
    }

    /// Join implementation hint for subsequently compiled inner joins.
    /// Outer joins always use the indexed variant.
    pub fn set_join_mode(&mut self, mode: JoinMode) {
        self.join_mode = mode;
    }

    /// Compile a batch of `;`-separated statements.  Returns the names of
    /// the views created.  On error, neither the catalog nor the circuit is
    /// modified.
    pub fn compile(&mut self, sql: &str) -> Result<Vec<String>, CompileError> {
        let statements = parser::parse_statements(sql)?;

        let mut shadow = ShadowCatalog {
            tables: self
                .tables
                .iter()
                .map(|(name, meta)| {
                    (
                        name.clone(),
                        TableShape {
                            schema: meta.schema.clone(),
                            types: self.handles[name].types().to_vec(),
                            pk_index: self.handles[name].pk_index(),
                        },
                    )
                })
                .collect(),
            views: self
                .views
                .iter()
                .map(|(name, meta)| (name.clone(), meta.schema.clone()))
                .collect(),
        };

        let mut planned = Vec::with_capacity(statements.len());
        for statement in &statements {
            planned.push(plan_statement(statement, &mut shadow)?);
        }
        tracing::debug!(statements = planned.len(), "compiling batch");

        let circuit = self.root.circuit();
        let mut created = Vec::new();
        for plan in planned {
            match plan {
                PlannedStatement::Table {
                    name,
                    schema,
                    types,
                    pk_index,
                } => {
                    let (stream, input) = circuit.add_input::<ZSet<Row>>(&name)?;
                    let handle =
                        UpsertHandle::new(name.clone(), input, schema.clone(), types, pk_index);
                    self.tables.insert(name.clone(), TableMeta { schema, stream });
                    self.handles.insert(name, handle);
                }
                PlannedStatement::View {
                    name,
                    plan,
                    schema,
                    order_by,
                    limit,
                } => {
                    let stream = self.instantiate(&plan);
                    tracing::debug!(view = %name, columns = schema.len(), "view compiled");
                    self.views.insert(
                        name.clone(),
                        ViewMeta {
                            schema,
                            stream,
                            order_by,
                            limit,
                        },
                    );
                    created.push(name);
                }
            }
        }
        Ok(created)
    }

    fn instantiate(&self, node: &PlanNode) -> Stream<ZSet<Row>> {
        match node {
            PlanNode::Table(name) => self.tables[name.as_str()].stream.clone(),
            PlanNode::View(name) => self.views[name.as_str()].stream.clone(),
            PlanNode::Filter { input, predicate } => {
                let input = self.instantiate(input);
                let predicate = predicate.clone();
                input.try_filter(move |row| predicate.eval_bool(row))
            }
            PlanNode::Project { input, exprs } => {
                let input = self.instantiate(input);
                let exprs = exprs.clone();
                input.try_map(move |row| {
                    let mut values = Vec::with_capacity(exprs.len());
                    for expr in &exprs {
                        values.push(expr.eval(row)?);
                    }
                    Ok(Row::new(values))
                })
            }
            PlanNode::Join {
                kind,
                left,
                right,
                on,
                left_pk,
                right_pk,
                left_width,
                right_width,
            } => {
                let left_stream = self.instantiate(left);
                let right_stream = self.instantiate(right);
                self.instantiate_join(
                    *kind,
                    &left_stream,
                    &right_stream,
                    *on,
                    *left_pk,
                    *right_pk,
                    *left_width,
                    *right_width,
                )
            }
            PlanNode::Aggregate {
                input,
                group_cols,
                specs,
            } => {
                let input = self.instantiate(input);
                let specs = specs
                    .iter()
                    .map(|spec| match &spec.input {
                        None => AggSpec::count_star(),
                        Some(expr) => {
                            let expr = expr.clone();
                            AggSpec::new(spec.kind, Rc::new(move |row: &Row| expr.eval(row)))
                        }
                    })
                    .collect();
                let group = if group_cols.is_empty() {
                    global_group()
                } else {
                    group_by_columns(group_cols.clone())
                };
                input.aggregate(group, specs)
            }
            PlanNode::Union { left, right, all } => {
                let union = self.instantiate(left).union(&self.instantiate(right));
                if *all {
                    union
                } else {
                    union.distinct_incremental()
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn instantiate_join(
        &self,
        kind: JoinKind,
        left: &Stream<ZSet<Row>>,
        right: &Stream<ZSet<Row>>,
        on: Option<(usize, usize)>,
        left_pk: Option<usize>,
        right_pk: Option<usize>,
        left_width: usize,
        right_width: usize,
    ) -> Stream<ZSet<Row>> {
        let (left_key, right_key) = match on {
            Some((left_col, right_col)) => (column_key(left_col), column_key(right_col)),
            // CROSS JOIN: everything shares one bucket.
            None => (constant_key(), constant_key()),
        };
        let left_pk = left_pk.map(column_key).unwrap_or_else(fingerprint_key);
        let right_pk = right_pk.map(column_key).unwrap_or_else(fingerprint_key);

        let matched = match (kind, self.join_mode) {
            (JoinKind::Inner | JoinKind::Cross, JoinMode::AppendOnly) => {
                let lk = left_key.clone();
                let rk = right_key.clone();
                left.join_append_only(right, move |row| lk(row), move |row| rk(row))
            }
            _ => left.join_indexed(
                right,
                left_key.clone(),
                right_key.clone(),
                left_pk,
                right_pk,
                concat_rows(),
            ),
        };

        match kind {
            JoinKind::Inner | JoinKind::Cross => matched,
            JoinKind::Left => {
                let lk = left_key;
                let rk = right_key;
                let padded = left
                    .anti_join(right, move |row| lk(row), move |row| rk(row))
                    .map(move |row: &Row| pad_right(row, right_width));
                matched.union(&padded)
            }
            JoinKind::Right => {
                let lk = left_key;
                let rk = right_key;
                let padded = right
                    .anti_join(left, move |row| rk(row), move |row| lk(row))
                    .map(move |row: &Row| pad_left(row, left_width));
                matched.union(&padded)
            }
        }
    }

    /// Subscribe a sink to a view's delta stream.
    pub fn subscribe<F>(&mut self, view: &str, mut sink: F) -> Result<NodeId, CompileError>
    where
        F: FnMut(&ZSet<Row>) + 'static,
    {
        let meta = self
            .views
            .get(view)
            .ok_or_else(|| CompileError::UnknownRelation(view.to_owned()))?;
        Ok(meta.stream.inspect(move |delta| sink(delta)))
    }

    /// Maintain the view's contents incrementally and return a snapshot
    /// reader; ORDER BY and LIMIT of the view definition apply at read time.
    pub fn materialize(&mut self, view: &str) -> Result<MaterializedView, CompileError> {
        let meta = self
            .views
            .get(view)
            .ok_or_else(|| CompileError::UnknownRelation(view.to_owned()))?;
        let materialized =
            MaterializedView::attach(&meta.stream, meta.order_by.clone(), meta.limit);
        self.materialized.push(materialized.clone());
        Ok(materialized)
    }

    /// Run one step over wire-format deltas.  Tables not mentioned see an
    /// empty delta.  On error the step is a no-op: circuit state and the
    /// upsert stores are as they were before the call.
    pub fn step<'a, I>(&mut self, inputs: I) -> Result<(), StepError>
    where
        I: IntoIterator<Item = (&'a str, Vec<DeltaOp>)>,
    {
        let mut fed = Vec::new();
        let staged = (|| {
            for (table, ops) in inputs {
                let handle = self
                    .handles
                    .get_mut(table)
                    .ok_or_else(|| StepError::UnknownInput(table.to_owned()))?;
                handle.apply(&ops)?;
                fed.push(table.to_owned());
            }
            Ok(())
        })();
        if let Err(error) = staged {
            for table in &fed {
                if let Some(handle) = self.handles.get_mut(table.as_str()) {
                    handle.abort();
                }
            }
            return Err(error);
        }

        self.run_step()
    }

    /// Run one step over raw Z-set deltas, bypassing the upsert stores.
    pub fn step_zsets<'a, I>(&mut self, inputs: I) -> Result<(), StepError>
    where
        I: IntoIterator<Item = (&'a str, ZSet<Row>)>,
    {
        for (table, delta) in inputs {
            let handle = self
                .handles
                .get(table)
                .ok_or_else(|| StepError::UnknownInput(table.to_owned()))?;
            handle.send_raw(delta);
        }
        self.run_step()
    }

    fn run_step(&mut self) -> Result<(), StepError> {
        match self.root.step() {
            Ok(()) => {
                for handle in self.handles.values_mut() {
                    handle.commit();
                }
                Ok(())
            }
            Err(error) => {
                for handle in self.handles.values_mut() {
                    handle.abort();
                }
                Err(error)
            }
        }
    }

    /// Reset every operator, upsert store, and materialized view to initial
    /// state.  The catalog and circuit structure are kept.
    pub fn reset(&mut self) {
        self.root.reset();
        for handle in self.handles.values_mut() {
            handle.reset();
        }
        for view in &self.materialized {
            view.clear();
        }
    }

    /// Sink failures recorded during the most recent step.
    pub fn sink_failures(&self) -> Vec<(NodeId, StepError)> {
        self.root.sink_failures()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn view_names(&self) -> Vec<String> {
        self.views.keys().cloned().collect()
    }

    pub fn view_schema(&self, view: &str) -> Option<&Schema> {
        self.views.get(view).map(|meta| &meta.schema)
    }

    pub fn table_schema(&self, table: &str) -> Option<&Schema> {
        self.tables.get(table).map(|meta| &meta.schema)
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

fn constant_key() -> KeyFunc {
    Rc::new(|_: &Row| Value::Int(0))
}

fn pad_right(row: &Row, width: usize) -> Row {
    let mut values = row.values().to_vec();
    values.extend(std::iter::repeat(Value::Null).take(width));
    Row::new(values)
}

fn pad_left(row: &Row, width: usize) -> Row {
    let mut values = vec![Value::Null; width];
    values.extend_from_slice(row.values());
    Row::new(values)
}

#[cfg(test)]
mod test {
    use super::Program;
    use crate::{
        algebra::ZSet,
        data::Row,
        error::{CompileError, StepError},
        input::DeltaOp,
        operator::JoinMode,
        row, zset,
    };
    use serde_json::json;
    use std::{cell::RefCell, rc::Rc};

    fn inserts(rows: Vec<serde_json::Value>) -> Vec<DeltaOp> {
        rows.into_iter().map(|row| DeltaOp::Insert { row }).collect()
    }

    fn capture(program: &mut Program, view: &str) -> Rc<RefCell<Vec<ZSet<Row>>>> {
        let deltas = Rc::new(RefCell::new(Vec::new()));
        let sink = deltas.clone();
        program
            .subscribe(view, move |delta| sink.borrow_mut().push(delta.clone()))
            .unwrap();
        deltas
    }

    // Filter view over a table with primary-key updates.
    #[test]
    fn filter_view_tracks_updates() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, status TEXT); \
                 CREATE VIEW active AS SELECT * FROM users WHERE status = 'active'",
            )
            .unwrap();
        let deltas = capture(&mut program, "active");
        let active = program.materialize("active").unwrap();

        program
            .step([(
                "users",
                inserts(vec![
                    json!([1, "active"]),
                    json!([2, "inactive"]),
                    json!([3, "active"]),
                ]),
            )])
            .unwrap();
        assert_eq!(
            deltas.borrow()[0],
            zset! { row![1, "active"] => 1, row![3, "active"] => 1 }
        );

        // Updating row 2 synthesizes the retract+reinsert pair; only the
        // reinsert passes the filter.
        program
            .step([("users", vec![DeltaOp::Update { row: json!([2, "active"]) }])])
            .unwrap();
        assert_eq!(deltas.borrow()[1], zset! { row![2, "active"] => 1 });
        assert_eq!(active.count(), 3);

        program
            .step([("users", vec![DeltaOp::Delete { key: json!(1) }])])
            .unwrap();
        assert_eq!(deltas.borrow()[2], zset! { row![1, "active"] => -1 });
        assert_eq!(active.count(), 2);
    }

    // Global SUM: the scalar view retracts and re-emits its single row.
    #[test]
    fn global_sum_view() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE nums (id INTEGER PRIMARY KEY, v INTEGER); \
                 CREATE VIEW s AS SELECT SUM(v) FROM nums",
            )
            .unwrap();
        let deltas = capture(&mut program, "s");
        let view = program.materialize("s").unwrap();

        program
            .step([(
                "nums",
                inserts(vec![json!([1, 10]), json!([2, 20]), json!([3, 30])]),
            )])
            .unwrap();
        assert_eq!(deltas.borrow()[0], zset! { row![60] => 1 });

        program
            .step([("nums", inserts(vec![json!([4, 40])]))])
            .unwrap();
        assert_eq!(
            deltas.borrow()[1],
            zset! { row![60] => -1, row![100] => 1 }
        );
        assert_eq!(view.values(), vec![row![100]]);
    }

    // GROUP BY with retraction of the old aggregate row and group purge.
    #[test]
    fn group_by_sum_view() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE sales (id INTEGER PRIMARY KEY, region TEXT, amt INTEGER); \
                 CREATE VIEW g AS SELECT region, SUM(amt) AS total FROM sales GROUP BY region",
            )
            .unwrap();
        let deltas = capture(&mut program, "g");

        program
            .step([(
                "sales",
                inserts(vec![
                    json!([1, "NA", 100]),
                    json!([2, "NA", 200]),
                    json!([3, "EU", 150]),
                ]),
            )])
            .unwrap();
        assert_eq!(
            deltas.borrow()[0],
            zset! { row!["NA", 300] => 1, row!["EU", 150] => 1 }
        );

        program
            .step([("sales", inserts(vec![json!([4, "NA", 50])]))])
            .unwrap();
        assert_eq!(
            deltas.borrow()[1],
            zset! { row!["NA", 300] => -1, row!["NA", 350] => 1 }
        );

        program
            .step([("sales", vec![DeltaOp::Delete { key: json!(3) }])])
            .unwrap();
        assert_eq!(deltas.borrow()[2], zset! { row!["EU", 150] => -1 });
    }

    // Orders joined with customers, including the retraction cascade when a
    // customer disappears.
    #[test]
    fn inner_join_view() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE customers (cid INTEGER PRIMARY KEY, name TEXT); \
                 CREATE TABLE orders (id INTEGER PRIMARY KEY, cid INTEGER); \
                 CREATE VIEW v AS SELECT o.id, c.name FROM orders o \
                 INNER JOIN customers c ON o.cid = c.cid",
            )
            .unwrap();
        let deltas = capture(&mut program, "v");

        program
            .step([
                (
                    "customers",
                    inserts(vec![json!([100, "Alice"]), json!([101, "Bob"])]),
                ),
                ("orders", inserts(vec![json!([1, 100]), json!([2, 101])])),
            ])
            .unwrap();
        assert_eq!(
            deltas.borrow()[0],
            zset! { row![1, "Alice"] => 1, row![2, "Bob"] => 1 }
        );

        program
            .step([("orders", inserts(vec![json!([3, 100])]))])
            .unwrap();
        assert_eq!(deltas.borrow()[1], zset! { row![3, "Alice"] => 1 });

        program
            .step([("customers", vec![DeltaOp::Delete { key: json!(100) }])])
            .unwrap();
        assert_eq!(
            deltas.borrow()[2],
            zset! { row![1, "Alice"] => -1, row![3, "Alice"] => -1 }
        );
    }

    #[test]
    fn left_join_pads_unmatched_rows_with_nulls() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE orders (id INTEGER PRIMARY KEY, cid INTEGER); \
                 CREATE TABLE customers (cid INTEGER PRIMARY KEY, name TEXT); \
                 CREATE VIEW v AS SELECT o.id, c.name FROM orders o \
                 LEFT JOIN customers c ON o.cid = c.cid",
            )
            .unwrap();
        let view = program.materialize("v").unwrap();

        program
            .step([("orders", inserts(vec![json!([1, 100])]))])
            .unwrap();
        let padded = Row::new(vec![crate::Value::Int(1), crate::Value::Null]);
        assert_eq!(view.values(), vec![padded.clone()]);

        // The matching customer arrives: padded row out, joined row in.
        program
            .step([("customers", inserts(vec![json!([100, "Alice"])]))])
            .unwrap();
        assert_eq!(view.values(), vec![row![1, "Alice"]]);
        assert_eq!(view.weight_of(&padded), 0);
    }

    #[test]
    fn union_deduplicates_and_union_all_does_not() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE a (id INTEGER PRIMARY KEY, name TEXT); \
                 CREATE TABLE b (id INTEGER PRIMARY KEY, name TEXT); \
                 CREATE VIEW dedup AS SELECT name FROM a UNION SELECT name FROM b; \
                 CREATE VIEW everything AS SELECT name FROM a UNION ALL SELECT name FROM b",
            )
            .unwrap();
        let dedup = program.materialize("dedup").unwrap();
        let everything = program.materialize("everything").unwrap();

        program
            .step([
                ("a", inserts(vec![json!([1, "x"])])),
                ("b", inserts(vec![json!([1, "x"]), json!([2, "y"])])),
            ])
            .unwrap();
        assert_eq!(dedup.count(), 2);
        assert_eq!(dedup.weight_of(&row!["x"]), 1);
        assert_eq!(everything.count(), 3);
        assert_eq!(everything.weight_of(&row!["x"]), 2);
    }

    #[test]
    fn having_filters_aggregate_groups() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE sales (id INTEGER PRIMARY KEY, region TEXT, amt INTEGER); \
                 CREATE VIEW big AS SELECT region, SUM(amt) AS total FROM sales \
                 GROUP BY region HAVING SUM(amt) > 100",
            )
            .unwrap();
        let view = program.materialize("big").unwrap();

        program
            .step([(
                "sales",
                inserts(vec![json!([1, "NA", 80]), json!([2, "EU", 150])]),
            )])
            .unwrap();
        assert_eq!(view.values(), vec![row!["EU", 150]]);

        // NA crosses the threshold.
        program
            .step([("sales", inserts(vec![json!([3, "NA", 40])]))])
            .unwrap();
        assert_eq!(view.weight_of(&row!["NA", 120]), 1);
    }

    #[test]
    fn order_by_and_limit_shape_reads_only() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, amt INTEGER); \
                 CREATE VIEW top2 AS SELECT id, amt FROM t ORDER BY amt DESC LIMIT 2",
            )
            .unwrap();
        let view = program.materialize("top2").unwrap();

        program
            .step([(
                "t",
                inserts(vec![json!([1, 10]), json!([2, 30]), json!([3, 20])]),
            )])
            .unwrap();
        assert_eq!(view.values(), vec![row![2, 30], row![3, 20]]);
        // The store itself is unlimited.
        assert_eq!(view.count(), 3);
    }

    #[test]
    fn scalar_functions_case_and_like() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, amt INTEGER); \
                 CREATE VIEW v AS SELECT UPPER(name) AS name, \
                 CASE WHEN amt >= 100 THEN 'big' ELSE 'small' END AS size \
                 FROM t WHERE name LIKE 'a%'",
            )
            .unwrap();
        let view = program.materialize("v").unwrap();

        program
            .step([(
                "t",
                inserts(vec![
                    json!([1, "apple", 120]),
                    json!([2, "Avocado", 10]),
                    json!([3, "banana", 500]),
                ]),
            )])
            .unwrap();
        assert_eq!(view.weight_of(&row!["APPLE", "big"]), 1);
        assert_eq!(view.weight_of(&row!["AVOCADO", "small"]), 1);
        assert_eq!(view.count(), 2);
    }

    #[test]
    fn views_compose() -> anyhow::Result<()> {
        let mut program = Program::new();
        program.compile(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER); \
             CREATE VIEW evens AS SELECT id, v FROM t WHERE v / 2 * 2 = v; \
             CREATE VIEW total AS SELECT SUM(v) FROM evens",
        )?;
        let view = program.materialize("total")?;

        program.step([(
            "t",
            inserts(vec![json!([1, 2]), json!([2, 3]), json!([3, 4])]),
        )])?;
        assert_eq!(view.values(), vec![row![6]]);
        Ok(())
    }

    #[test]
    fn cross_join_pairs_everything() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE colors (c TEXT PRIMARY KEY); \
                 CREATE TABLE sizes (s TEXT PRIMARY KEY); \
                 CREATE VIEW combos AS SELECT * FROM colors CROSS JOIN sizes",
            )
            .unwrap();
        let view = program.materialize("combos").unwrap();

        program
            .step([
                ("colors", inserts(vec![json!(["red"]), json!(["blue"])])),
                ("sizes", inserts(vec![json!(["S"]), json!(["M"])])),
            ])
            .unwrap();
        assert_eq!(view.count(), 4);
        assert_eq!(view.weight_of(&row!["red", "M"]), 1);
    }

    #[test]
    fn append_only_mode_matches_indexed_results() {
        let mut program = Program::new();
        program.set_join_mode(JoinMode::AppendOnly);
        program
            .compile(
                "CREATE TABLE l (id INTEGER PRIMARY KEY, k TEXT); \
                 CREATE TABLE r (k TEXT PRIMARY KEY, v INTEGER); \
                 CREATE VIEW j AS SELECT l.id, r.v FROM l INNER JOIN r ON l.k = r.k",
            )
            .unwrap();
        let view = program.materialize("j").unwrap();

        program
            .step([
                ("l", inserts(vec![json!([1, "x"]), json!([2, "y"])])),
                ("r", inserts(vec![json!(["x", 10])])),
            ])
            .unwrap();
        program
            .step([("r", inserts(vec![json!(["y", 20])]))])
            .unwrap();
        assert_eq!(view.count(), 2);
        assert_eq!(view.weight_of(&row![2, 20]), 1);
    }

    // A step error must leave integrated state and the upsert stores exactly
    // as they were before the step.
    #[test]
    fn failed_step_rolls_everything_back() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE nums (id INTEGER PRIMARY KEY, v INTEGER); \
                 CREATE VIEW s AS SELECT SUM(v) FROM nums",
            )
            .unwrap();
        let view = program.materialize("s").unwrap();

        program
            .step([("nums", inserts(vec![json!([1, i64::MAX])]))])
            .unwrap();
        assert_eq!(view.values(), vec![row![i64::MAX]]);

        // Overflows the running sum: the step aborts, nothing is delivered.
        let error = program
            .step([("nums", inserts(vec![json!([2, 1])]))])
            .unwrap_err();
        assert_eq!(error, StepError::IntegerOverflow);
        assert_eq!(view.values(), vec![row![i64::MAX]]);

        // The engine is still consistent: a valid delta applies cleanly.
        program
            .step([("nums", inserts(vec![json!([3, -5])]))])
            .unwrap();
        assert_eq!(view.values(), vec![row![i64::MAX - 5]]);
    }

    #[test]
    fn compile_errors_leave_the_program_untouched() {
        let mut program = Program::new();
        program
            .compile("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)")
            .unwrap();

        // Second statement is bad: the first must not take effect either.
        let error = program
            .compile(
                "CREATE TABLE u (id INTEGER); \
                 CREATE VIEW broken AS SELECT missing FROM t",
            )
            .unwrap_err();
        assert!(matches!(error, CompileError::UnknownColumn(_)));
        assert!(matches!(
            program.step([("u", vec![])]),
            Err(StepError::UnknownInput(_))
        ));

        // The surviving table still works.
        program
            .compile("CREATE VIEW v AS SELECT v FROM t")
            .unwrap();
        program
            .step([("t", inserts(vec![json!([1, 7])]))])
            .unwrap();
    }

    #[test]
    fn rejects_bad_schemas() {
        let mut program = Program::new();
        program
            .compile("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)")
            .unwrap();

        assert!(matches!(
            program.compile("CREATE TABLE t (x INTEGER)"),
            Err(CompileError::DuplicateTable(_))
        ));
        assert!(matches!(
            program.compile("CREATE VIEW v AS SELECT * FROM missing"),
            Err(CompileError::UnknownRelation(_))
        ));
        assert!(matches!(
            program.compile("CREATE VIEW v AS SELECT id, SUM(v) FROM t"),
            Err(CompileError::UngroupedColumn(_))
        ));
        assert!(matches!(
            program.compile("CREATE VIEW v AS SELECT id FROM t WHERE SUM(v) > 1"),
            Err(CompileError::MisplacedAggregate(_))
        ));
        assert!(matches!(
            program.compile(
                "CREATE VIEW v AS SELECT id FROM t UNION SELECT id, v FROM t"
            ),
            Err(CompileError::UnionArity { .. })
        ));
    }

    // Feeding a delta and then its negation leaves every view exactly where
    // it started.
    #[test]
    fn retraction_symmetry_over_raw_deltas() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE sales (id INTEGER PRIMARY KEY, region TEXT, amt INTEGER); \
                 CREATE VIEW g AS SELECT region, SUM(amt) AS total FROM sales GROUP BY region",
            )
            .unwrap();
        let view = program.materialize("g").unwrap();

        program
            .step_zsets([("sales", zset! { row![1, "NA", 100] => 1 })])
            .unwrap();
        assert_eq!(view.values(), vec![row!["NA", 100]]);

        let delta = zset! { row![2, "NA", 50] => 1, row![3, "EU", 70] => 1 };
        program.step_zsets([("sales", delta.clone())]).unwrap();
        program.step_zsets([("sales", delta.negate())]).unwrap();

        assert_eq!(view.values(), vec![row!["NA", 100]]);
        assert_eq!(view.count(), 1);
    }

    // step(empty) emits the empty delta on every view.
    #[test]
    fn empty_steps_produce_empty_deltas() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER); \
                 CREATE VIEW s AS SELECT SUM(v) FROM t; \
                 CREATE VIEW f AS SELECT * FROM t WHERE v > 0",
            )
            .unwrap();
        let sums = capture(&mut program, "s");
        let filtered = capture(&mut program, "f");

        program.step([]).unwrap();
        program.step([("t", vec![])]).unwrap();

        assert!(sums.borrow().iter().all(ZSet::is_empty));
        assert!(filtered.borrow().iter().all(ZSet::is_empty));
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut program = Program::new();
        program
            .compile(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER); \
                 CREATE VIEW s AS SELECT SUM(v) FROM t",
            )
            .unwrap();
        let view = program.materialize("s").unwrap();

        program
            .step([("t", inserts(vec![json!([1, 5])]))])
            .unwrap();
        assert_eq!(view.count(), 1);

        program.reset();
        assert_eq!(view.count(), 0);

        // After reset the same primary key inserts as new.
        program
            .step([("t", inserts(vec![json!([1, 7])]))])
            .unwrap();
        assert_eq!(view.values(), vec![row![7]]);
    }
}
