//! Compiled row expressions.
//!
//! Name resolution happens once, at view-compilation time: column references
//! become positional indexes and LIKE patterns become anchored
//! case-insensitive regexes.  Evaluation is then a pure function of the row
//! that can only fail on runtime arithmetic (overflow, division by zero) or
//! type errors, which abort the step.
//!
//! Predicate semantics are strict: a comparison involving NULL is false,
//! arithmetic involving NULL is NULL.

use crate::{
    data::{Row, Value},
    error::{CompileError, StepError},
    sql::ast::{AggFunc, BinaryOp, ColumnRef, Expr, ScalarFunc, SqlType, UnaryOp},
};
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;

/// Column layout of a stream of rows.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    columns: Vec<ColumnInfo>,
}

#[derive(Clone, Debug)]
pub struct ColumnInfo {
    pub name: String,
    /// Table name or alias the column is reachable through, if any.
    pub table: Option<String>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self { columns }
    }

    /// Schema of a base table or subquery output: every column qualified by
    /// the same source name.
    pub fn from_names<S: AsRef<str>>(table: Option<&str>, names: &[S]) -> Self {
        Self {
            columns: names
                .iter()
                .map(|name| ColumnInfo {
                    name: name.as_ref().to_owned(),
                    table: table.map(str::to_owned),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Concatenated schema of a join output.
    pub fn join(&self, other: &Schema) -> Schema {
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().cloned());
        Schema { columns }
    }

    /// Resolve a possibly-qualified column reference to an index.
    pub fn resolve(&self, column: &ColumnRef) -> Result<usize, CompileError> {
        let matches: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, info)| {
                info.name == column.column
                    && column
                        .table
                        .as_ref()
                        .map_or(true, |t| info.table.as_deref() == Some(t.as_str()))
            })
            .map(|(index, _)| index)
            .collect();
        match matches.as_slice() {
            [index] => Ok(*index),
            [] => Err(CompileError::UnknownColumn(display_ref(column))),
            _ => Err(CompileError::AmbiguousColumn(display_ref(column))),
        }
    }

    /// Resolve an output column by bare name (ORDER BY keys).
    pub fn resolve_name(&self, name: &str) -> Result<usize, CompileError> {
        self.resolve(&ColumnRef::bare(name))
    }
}

pub(crate) fn display_ref(column: &ColumnRef) -> String {
    match &column.table {
        Some(table) => format!("{}.{}", table, column.column),
        None => column.column.clone(),
    }
}

/// An expression with all names resolved, ready to evaluate against rows.
#[derive(Clone, Debug)]
pub enum CompiledExpr {
    Column(usize),
    Literal(Value),
    Binary {
        op: BinaryOp,
        left: Box<CompiledExpr>,
        right: Box<CompiledExpr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<CompiledExpr>,
    },
    IsNull {
        expr: Box<CompiledExpr>,
        negated: bool,
    },
    Between {
        expr: Box<CompiledExpr>,
        low: Box<CompiledExpr>,
        high: Box<CompiledExpr>,
        negated: bool,
    },
    InList {
        expr: Box<CompiledExpr>,
        list: Vec<CompiledExpr>,
        negated: bool,
    },
    Like {
        expr: Box<CompiledExpr>,
        regex: Regex,
        negated: bool,
    },
    Case {
        operand: Option<Box<CompiledExpr>>,
        branches: Vec<(CompiledExpr, CompiledExpr)>,
        else_branch: Option<Box<CompiledExpr>>,
    },
    Cast {
        expr: Box<CompiledExpr>,
        ty: SqlType,
    },
    Call {
        func: ScalarFunc,
        args: Vec<CompiledExpr>,
    },
}

/// Compile an expression that may not contain aggregate calls.
pub fn compile_expr(expr: &Expr, schema: &Schema) -> Result<CompiledExpr, CompileError> {
    compile_with(
        expr,
        &mut |column| schema.resolve(column),
        &mut |_, _| Err(CompileError::MisplacedAggregate("scalar")),
    )
}

/// Compile an expression with pluggable column and aggregate resolution.
///
/// The aggregation compiler uses this to rewrite aggregate calls into
/// references to aggregate output slots and to restrict bare columns to
/// grouped ones.
pub fn compile_with(
    expr: &Expr,
    resolve_column: &mut dyn FnMut(&ColumnRef) -> Result<usize, CompileError>,
    resolve_aggregate: &mut dyn FnMut(AggFunc, Option<&Expr>) -> Result<usize, CompileError>,
) -> Result<CompiledExpr, CompileError> {
    let compiled = match expr {
        Expr::Column(column) => CompiledExpr::Column(resolve_column(column)?),
        Expr::Literal(value) => CompiledExpr::Literal(value.clone()),
        Expr::Binary { op, left, right } => CompiledExpr::Binary {
            op: *op,
            left: Box::new(compile_with(left, resolve_column, resolve_aggregate)?),
            right: Box::new(compile_with(right, resolve_column, resolve_aggregate)?),
        },
        Expr::Unary { op, expr } => CompiledExpr::Unary {
            op: *op,
            expr: Box::new(compile_with(expr, resolve_column, resolve_aggregate)?),
        },
        Expr::IsNull { expr, negated } => CompiledExpr::IsNull {
            expr: Box::new(compile_with(expr, resolve_column, resolve_aggregate)?),
            negated: *negated,
        },
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => CompiledExpr::Between {
            expr: Box::new(compile_with(expr, resolve_column, resolve_aggregate)?),
            low: Box::new(compile_with(low, resolve_column, resolve_aggregate)?),
            high: Box::new(compile_with(high, resolve_column, resolve_aggregate)?),
            negated: *negated,
        },
        Expr::InList {
            expr,
            list,
            negated,
        } => CompiledExpr::InList {
            expr: Box::new(compile_with(expr, resolve_column, resolve_aggregate)?),
            list: list
                .iter()
                .map(|item| compile_with(item, resolve_column, resolve_aggregate))
                .collect::<Result<_, _>>()?,
            negated: *negated,
        },
        Expr::Like {
            expr,
            pattern,
            negated,
        } => CompiledExpr::Like {
            expr: Box::new(compile_with(expr, resolve_column, resolve_aggregate)?),
            regex: like_regex(pattern)?,
            negated: *negated,
        },
        Expr::Case {
            operand,
            branches,
            else_branch,
        } => CompiledExpr::Case {
            operand: operand
                .as_deref()
                .map(|op| compile_with(op, resolve_column, resolve_aggregate).map(Box::new))
                .transpose()?,
            branches: branches
                .iter()
                .map(|(when, then)| {
                    Ok((
                        compile_with(when, resolve_column, resolve_aggregate)?,
                        compile_with(then, resolve_column, resolve_aggregate)?,
                    ))
                })
                .collect::<Result<_, CompileError>>()?,
            else_branch: else_branch
                .as_deref()
                .map(|e| compile_with(e, resolve_column, resolve_aggregate).map(Box::new))
                .transpose()?,
        },
        Expr::Cast { expr, ty } => CompiledExpr::Cast {
            expr: Box::new(compile_with(expr, resolve_column, resolve_aggregate)?),
            ty: *ty,
        },
        Expr::Call { func, args } => {
            check_arity(*func, args.len())?;
            CompiledExpr::Call {
                func: *func,
                args: args
                    .iter()
                    .map(|arg| compile_with(arg, resolve_column, resolve_aggregate))
                    .collect::<Result<_, _>>()?,
            }
        }
        Expr::Aggregate { func, arg } => {
            CompiledExpr::Column(resolve_aggregate(*func, arg.as_deref())?)
        }
    };
    Ok(compiled)
}

fn check_arity(func: ScalarFunc, arity: usize) -> Result<(), CompileError> {
    let ok = match func {
        ScalarFunc::Upper | ScalarFunc::Lower => arity == 1,
        ScalarFunc::Substring => arity == 2 || arity == 3,
        ScalarFunc::Coalesce => arity >= 1,
    };
    if ok {
        Ok(())
    } else {
        Err(CompileError::Unsupported(format!(
            "wrong number of arguments ({}) to {:?}",
            arity, func
        )))
    }
}

/// Translate a LIKE pattern to an anchored case-insensitive regex:
/// `%` matches any sequence, `_` any single character.
fn like_regex(pattern: &str) -> Result<Regex, CompileError> {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    RegexBuilder::new(&regex)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| CompileError::Unsupported(format!("LIKE pattern: {}", e)))
}

impl CompiledExpr {
    pub fn eval(&self, row: &Row) -> Result<Value, StepError> {
        match self {
            Self::Column(index) => Ok(row.col(*index).clone()),
            Self::Literal(value) => Ok(value.clone()),
            Self::Binary { op, left, right } => {
                eval_binary(*op, &left.eval(row)?, &right.eval(row)?)
            }
            Self::Unary { op, expr } => {
                let value = expr.eval(row)?;
                match op {
                    UnaryOp::Neg => value.checked_neg(),
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                }
            }
            Self::IsNull { expr, negated } => {
                Ok(Value::Bool(expr.eval(row)?.is_null() != *negated))
            }
            Self::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let value = expr.eval(row)?;
                let low = low.eval(row)?;
                let high = high.eval(row)?;
                let within = matches!(
                    value.sql_cmp(&low),
                    Some(Ordering::Greater) | Some(Ordering::Equal)
                ) && matches!(
                    value.sql_cmp(&high),
                    Some(Ordering::Less) | Some(Ordering::Equal)
                );
                Ok(Value::Bool(within != *negated))
            }
            Self::InList {
                expr,
                list,
                negated,
            } => {
                let value = expr.eval(row)?;
                let mut found = false;
                for item in list {
                    if value.sql_cmp(&item.eval(row)?) == Some(Ordering::Equal) {
                        found = true;
                        break;
                    }
                }
                Ok(Value::Bool(found != *negated))
            }
            Self::Like {
                expr,
                regex,
                negated,
            } => {
                let matched = match expr.eval(row)? {
                    Value::Text(text) => regex.is_match(&text),
                    _ => false,
                };
                Ok(Value::Bool(matched != *negated))
            }
            Self::Case {
                operand,
                branches,
                else_branch,
            } => {
                let operand = operand.as_deref().map(|op| op.eval(row)).transpose()?;
                for (when, then) in branches {
                    let hit = match &operand {
                        Some(target) => {
                            target.sql_cmp(&when.eval(row)?) == Some(Ordering::Equal)
                        }
                        None => truthy(&when.eval(row)?),
                    };
                    if hit {
                        return then.eval(row);
                    }
                }
                match else_branch {
                    Some(branch) => branch.eval(row),
                    None => Ok(Value::Null),
                }
            }
            Self::Cast { expr, ty } => cast(&expr.eval(row)?, *ty),
            Self::Call { func, args } => eval_call(*func, args, row),
        }
    }

    /// Evaluate as a predicate: only `TRUE` passes; NULL and non-boolean
    /// results are false.
    pub fn eval_bool(&self, row: &Row) -> Result<bool, StepError> {
        Ok(truthy(&self.eval(row)?))
    }
}

fn truthy(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

fn eval_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, StepError> {
    match op {
        BinaryOp::Add => left.checked_add(right),
        BinaryOp::Sub => left.checked_sub(right),
        BinaryOp::Mul => left.checked_mul(right),
        BinaryOp::Div => left.checked_div(right),
        BinaryOp::And => Ok(Value::Bool(truthy(left) && truthy(right))),
        BinaryOp::Or => Ok(Value::Bool(truthy(left) || truthy(right))),
        BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt
        | BinaryOp::GtEq => {
            let matched = match left.sql_cmp(right) {
                None => false,
                Some(ordering) => match op {
                    BinaryOp::Eq => ordering == Ordering::Equal,
                    BinaryOp::NotEq => ordering != Ordering::Equal,
                    BinaryOp::Lt => ordering == Ordering::Less,
                    BinaryOp::LtEq => ordering != Ordering::Greater,
                    BinaryOp::Gt => ordering == Ordering::Greater,
                    BinaryOp::GtEq => ordering != Ordering::Less,
                    _ => unreachable!(),
                },
            };
            Ok(Value::Bool(matched))
        }
    }
}

fn cast(value: &Value, ty: SqlType) -> Result<Value, StepError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let from = value.type_name();
    let bad = || StepError::BadCast {
        from,
        to: ty.name(),
    };
    match ty {
        SqlType::Integer => match value {
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Double(d) => Ok(Value::Int(d.0 as i64)),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Text(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| bad()),
            Value::Null => Ok(Value::Null),
        },
        SqlType::Double => match value {
            Value::Int(i) => Ok(Value::double(*i as f64)),
            Value::Double(d) => Ok(Value::Double(*d)),
            Value::Text(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::double)
                .map_err(|_| bad()),
            _ => Err(bad()),
        },
        SqlType::Text => Ok(Value::Text(value.to_string())),
        SqlType::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Int(i) => Ok(Value::Bool(*i != 0)),
            Value::Text(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" => Ok(Value::Bool(true)),
                "false" | "f" => Ok(Value::Bool(false)),
                _ => Err(bad()),
            },
            _ => Err(bad()),
        },
    }
}

fn eval_call(func: ScalarFunc, args: &[CompiledExpr], row: &Row) -> Result<Value, StepError> {
    match func {
        ScalarFunc::Upper | ScalarFunc::Lower => {
            let value = args[0].eval(row)?;
            match value {
                Value::Null => Ok(Value::Null),
                Value::Text(s) => Ok(Value::Text(if func == ScalarFunc::Upper {
                    s.to_uppercase()
                } else {
                    s.to_lowercase()
                })),
                other => Err(StepError::TypeMismatch {
                    op: "string function",
                    left: "TEXT",
                    right: other.type_name(),
                }),
            }
        }
        ScalarFunc::Substring => {
            let value = args[0].eval(row)?;
            let start = args[1].eval(row)?;
            let length = match args.get(2) {
                Some(arg) => Some(arg.eval(row)?),
                None => None,
            };
            let (text, start) = match (&value, &start) {
                (Value::Null, _) | (_, Value::Null) => return Ok(Value::Null),
                (Value::Text(text), Value::Int(start)) => (text, *start),
                _ => {
                    return Err(StepError::TypeMismatch {
                        op: "SUBSTRING",
                        left: value.type_name(),
                        right: start.type_name(),
                    })
                }
            };
            // SQL substrings are 1-based.
            let skip = start.max(1) as usize - 1;
            let taken: String = match length {
                None => text.chars().skip(skip).collect(),
                Some(Value::Null) => return Ok(Value::Null),
                Some(Value::Int(len)) => {
                    text.chars().skip(skip).take(len.max(0) as usize).collect()
                }
                Some(other) => {
                    return Err(StepError::TypeMismatch {
                        op: "SUBSTRING",
                        left: "INTEGER",
                        right: other.type_name(),
                    })
                }
            };
            Ok(Value::Text(taken))
        }
        ScalarFunc::Coalesce => {
            for arg in args {
                let value = arg.eval(row)?;
                if !value.is_null() {
                    return Ok(value);
                }
            }
            Ok(Value::Null)
        }
    }
}
