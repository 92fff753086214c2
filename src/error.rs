//! Error taxonomy.
//!
//! Errors are split along the lifecycle of a circuit: [`ParseError`] and
//! [`CompileError`] are construction-time failures that leave the circuit
//! unmodified, while [`StepError`] aborts the current step and rolls every
//! stateful operator back to its pre-step state.

use thiserror::Error;

/// Top-level error type returned by the embedding API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Step(#[from] StepError),
}

/// SQL text could not be turned into a statement list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The parser got stuck; `near` is a prefix of the offending input.
    #[error("syntax error near `{near}`")]
    Syntax { near: String },

    /// A statement parsed, but was followed by garbage.
    #[error("unexpected trailing input: `{0}`")]
    Trailing(String),
}

/// A statement was rejected while being translated into circuit nodes.
///
/// Compilation is transactional: when any statement of a batch fails, no
/// nodes are added to the circuit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("unknown table or view `{0}`")]
    UnknownRelation(String),

    #[error("unknown column `{0}`")]
    UnknownColumn(String),

    #[error("ambiguous column `{0}`")]
    AmbiguousColumn(String),

    #[error("table `{0}` already exists")]
    DuplicateTable(String),

    #[error("view `{0}` already exists")]
    DuplicateView(String),

    #[error("column `{0}` declared twice")]
    DuplicateColumn(String),

    #[error("UNION arms produce {left} and {right} columns")]
    UnionArity { left: usize, right: usize },

    #[error("aggregate function in {0} clause")]
    MisplacedAggregate(&'static str),

    #[error("column `{0}` is neither grouped nor aggregated")]
    UngroupedColumn(String),

    #[error("the operator graph contains a cycle")]
    Cycle,

    #[error("{0}")]
    Unsupported(String),
}

/// Evaluation of one step failed.
///
/// The step's delta is discarded, no sink fires, and integrated state is as
/// it was before the step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("unknown input `{0}`")]
    UnknownInput(String),

    #[error("integer arithmetic overflowed")]
    IntegerOverflow,

    #[error("division by zero")]
    DivisionByZero,

    #[error("cannot apply `{op}` to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("cannot cast {from} value to {to}")]
    BadCast {
        from: &'static str,
        to: &'static str,
    },

    #[error("append-only join received a retraction")]
    AppendOnlyRetraction,

    /// A wire-format delta did not fit the table schema.
    #[error("bad input for table `{table}`: {message}")]
    BadInput { table: String, message: String },

    /// Raised by user-supplied sink callbacks; recorded per sink and never
    /// aborts the step.
    #[error("sink failed: {0}")]
    Sink(String),
}
