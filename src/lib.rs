//! Incremental view maintenance over Z-set streams.
//!
//! `deltaflow` maintains SQL-defined views over base tables by processing
//! only changes: every table update enters the circuit as a [`ZSet`] delta,
//! flows through incremental operators (filter, map, join, distinct, GROUP
//! BY aggregation), and leaves as the exact delta of each view's contents.
//! Integrating a view's output deltas always equals evaluating the view's
//! definition over the integrated inputs.
//!
//! The two entry points are [`Program`], which compiles a SQL fragment into
//! a circuit and drives it with wire-format deltas, and [`Root`], the raw
//! circuit-construction API for hand-built dataflow.
//!
//! ```
//! use deltaflow::{DeltaOp, Program};
//! use serde_json::json;
//!
//! let mut program = Program::new();
//! program
//!     .compile(
//!         "CREATE TABLE users (id INTEGER PRIMARY KEY, status TEXT); \
//!          CREATE VIEW active AS SELECT * FROM users WHERE status = 'active'",
//!     )
//!     .unwrap();
//! let active = program.materialize("active").unwrap();
//!
//! program
//!     .step([(
//!         "users",
//!         vec![
//!             DeltaOp::Insert { row: json!([1, "active"]) },
//!             DeltaOp::Insert { row: json!([2, "inactive"]) },
//!         ],
//!     )])
//!     .unwrap();
//! assert_eq!(active.count(), 1);
//! ```

pub mod algebra;
pub mod circuit;
pub mod data;
pub mod error;
pub mod freshness;
pub mod input;
pub mod operator;
pub mod sql;
pub mod view;

pub use algebra::{ZSet, ZWeight};
pub use circuit::{Circuit, InputHandle, NodeId, Root, Stream};
pub use data::{Row, Value};
pub use error::{CompileError, Error, ParseError, StepError};
pub use freshness::{DropReason, FreshnessConfig, FreshnessQueue, FreshnessStats};
pub use input::{DeltaOp, UpsertHandle};
pub use operator::JoinMode;
pub use sql::Program;
pub use view::MaterializedView;
