//! Table input handles and the delta wire format.
//!
//! Producers describe changes as [`DeltaOp`]s: `insert` and `update` carry
//! the full new row, `delete` carries only the primary key.  The
//! [`UpsertHandle`] keeps a per-table row store keyed by primary key and
//! turns an update (or an insert that reuses a live key) into the
//! retract-and-reinsert pair the circuit expects.  Z-set deltas flowing
//! through the circuit stay keyed by structural row identity; only this
//! store uses primary-key identity.  Mixing the two would let an update's
//! retraction cancel against its reinsert.

use crate::{
    algebra::ZSet,
    circuit::InputHandle,
    data::{Row, Value},
    error::StepError,
    sql::ast::SqlType,
    sql::expr::Schema,
};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One change to a base table, as supplied by a producer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum DeltaOp {
    /// Insert a full row; a live row with the same primary key is replaced.
    Insert { row: JsonValue },
    /// Same semantics as `Insert`; the separate tag mirrors producer intent.
    Update { row: JsonValue },
    /// Delete by primary key.
    Delete { key: JsonValue },
}

/// Feeds wire-format deltas to one table input.
///
/// Store mutations are staged: [`commit`](Self::commit) makes them permanent
/// after a successful step, [`abort`](Self::abort) restores the pre-step
/// store when the step fails, keeping the store consistent with the
/// circuit's integrated state.
pub struct UpsertHandle {
    table: String,
    input: InputHandle<ZSet<Row>>,
    schema: Schema,
    types: Vec<SqlType>,
    pk_index: usize,
    rows: HashMap<Value, Row>,
    /// Pre-step values of keys touched since the last commit.
    staged: Vec<(Value, Option<Row>)>,
}

impl UpsertHandle {
    pub(crate) fn new(
        table: String,
        input: InputHandle<ZSet<Row>>,
        schema: Schema,
        types: Vec<SqlType>,
        pk_index: usize,
    ) -> Self {
        Self {
            table,
            input,
            schema,
            types,
            pk_index,
            rows: HashMap::new(),
            staged: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn types(&self) -> &[SqlType] {
        &self.types
    }

    pub(crate) fn pk_index(&self) -> usize {
        self.pk_index
    }

    /// Number of live rows in the primary-key store.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn bad_input(&self, message: impl Into<String>) -> StepError {
        StepError::BadInput {
            table: self.table.clone(),
            message: message.into(),
        }
    }

    /// Decode and apply a batch of wire ops, staging the synthesized Z-set
    /// delta on the underlying input.  On error nothing is staged and the
    /// store is untouched.
    pub fn apply(&mut self, ops: &[DeltaOp]) -> Result<(), StepError> {
        let mut delta = ZSet::new();
        let mut undo = Vec::with_capacity(ops.len());

        let result = (|| {
            for op in ops {
                match op {
                    DeltaOp::Insert { row } | DeltaOp::Update { row } => {
                        let row = self.decode_row(row)?;
                        let key = row.col(self.pk_index).clone();
                        if key.is_null() {
                            return Err(self.bad_input("NULL primary key"));
                        }
                        let previous = self.rows.insert(key.clone(), row.clone());
                        if let Some(previous) = &previous {
                            delta.insert(previous.clone(), -1);
                        }
                        delta.insert(row, 1);
                        undo.push((key, previous));
                    }
                    DeltaOp::Delete { key } => {
                        let key = self.decode_key(key)?;
                        match self.rows.remove(&key) {
                            Some(previous) => {
                                delta.insert(previous.clone(), -1);
                                undo.push((key, Some(previous)));
                            }
                            None => {
                                tracing::warn!(table = %self.table, %key, "delete of unknown key ignored");
                            }
                        }
                    }
                }
            }
            Ok(())
        })();

        if let Err(error) = result {
            // Roll the store back to the state before this batch.
            for (key, previous) in undo.into_iter().rev() {
                match previous {
                    Some(row) => {
                        self.rows.insert(key, row);
                    }
                    None => {
                        self.rows.remove(&key);
                    }
                }
            }
            return Err(error);
        }

        self.staged.extend(undo);
        self.input.send(delta);
        Ok(())
    }

    /// Stage a raw Z-set delta, bypassing the primary-key store.
    pub fn send_raw(&self, delta: ZSet<Row>) {
        self.input.send(delta);
    }

    pub(crate) fn commit(&mut self) {
        self.staged.clear();
    }

    pub(crate) fn abort(&mut self) {
        while let Some((key, previous)) = self.staged.pop() {
            match previous {
                Some(row) => {
                    self.rows.insert(key, row);
                }
                None => {
                    self.rows.remove(&key);
                }
            }
        }
        self.input.clear();
    }

    pub(crate) fn reset(&mut self) {
        self.rows.clear();
        self.staged.clear();
        self.input.clear();
    }

    fn decode_row(&self, json: &JsonValue) -> Result<Row, StepError> {
        let values = match json {
            JsonValue::Array(items) => {
                if items.len() != self.types.len() {
                    return Err(self.bad_input(format!(
                        "row has {} values, table has {} columns",
                        items.len(),
                        self.types.len()
                    )));
                }
                items
                    .iter()
                    .zip(&self.types)
                    .map(|(item, ty)| self.decode_value(item, *ty))
                    .collect::<Result<Vec<_>, _>>()?
            }
            JsonValue::Object(fields) => self
                .schema
                .columns()
                .iter()
                .zip(&self.types)
                .map(|(column, ty)| match fields.get(&column.name) {
                    None => Ok(Value::Null),
                    Some(field) => self.decode_value(field, *ty),
                })
                .collect::<Result<Vec<_>, _>>()?,
            other => {
                return Err(self.bad_input(format!("row must be an array or object, got {}", other)))
            }
        };
        Ok(Row::new(values))
    }

    fn decode_key(&self, json: &JsonValue) -> Result<Value, StepError> {
        self.decode_value(json, self.types[self.pk_index])
    }

    fn decode_value(&self, json: &JsonValue, ty: SqlType) -> Result<Value, StepError> {
        let mismatch =
            |json: &JsonValue| self.bad_input(format!("expected {}, got {}", ty.name(), json));
        match json {
            JsonValue::Null => Ok(Value::Null),
            JsonValue::Bool(b) => match ty {
                SqlType::Boolean => Ok(Value::Bool(*b)),
                _ => Err(mismatch(json)),
            },
            JsonValue::Number(n) => match ty {
                SqlType::Integer => n.as_i64().map(Value::Int).ok_or_else(|| mismatch(json)),
                SqlType::Double => n.as_f64().map(Value::double).ok_or_else(|| mismatch(json)),
                _ => Err(mismatch(json)),
            },
            JsonValue::String(s) => match ty {
                SqlType::Text => Ok(Value::Text(s.clone())),
                _ => Err(mismatch(json)),
            },
            other => Err(mismatch(other)),
        }
    }
}
