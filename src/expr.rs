//! Scalar expressions for schema-evolution projections.
//!
//! A compiled projection holds one [`ScalarExpr`] per new column. The
//! expression vocabulary is deliberately small: field references, casts
//! resolved at compile time, typed literals, sequence next-values, and
//! zero-argument scalar calls. Evaluation threads a [`QueryContext`] so
//! sequence expressions advance and function expressions observe their
//! environment.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::GroupShiftError;
use crate::row::Row;
use crate::schema::SequenceId;
use crate::types::{CastFn, ScalarOp, TypeClass, Value};

/// Source of next-values for identity columns.
///
/// Implemented by the store; sequence state is transactional like any
/// other store mutation.
pub trait SequenceService: Send + Sync {
    fn next_value(&self, seq: SequenceId) -> Result<i64, GroupShiftError>;
}

/// Evaluation environment for projections and default expressions.
pub struct QueryContext {
    now: DateTime<Utc>,
    current_user: String,
    sequences: Arc<dyn SequenceService>,
}

impl QueryContext {
    pub fn new(sequences: Arc<dyn SequenceService>) -> Self {
        QueryContext {
            now: Utc::now(),
            current_user: "system".to_string(),
            sequences,
        }
    }

    /// Pin the context clock (default-function evaluation is stable
    /// within one statement).
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.current_user = user.into();
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

/// Why an expression failed on a particular row.
///
/// Domain failures get the owning column's identity attached by the
/// transformer; engine failures pass through.
#[derive(Debug)]
pub enum EvalError {
    Domain(String),
    Engine(GroupShiftError),
}

impl From<GroupShiftError> for EvalError {
    fn from(e: GroupShiftError) -> Self {
        EvalError::Engine(e)
    }
}

/// One compiled scalar expression.
#[derive(Clone)]
pub enum ScalarExpr {
    /// The old row's field at this position.
    Field(usize),
    /// A cast resolved from the types registry at compile time.
    Cast {
        expr: Box<ScalarExpr>,
        to: TypeClass,
        func: CastFn,
    },
    /// A typed literal (parsed column default).
    Literal(Value),
    /// A typed null (new column without any default).
    NullLiteral(TypeClass),
    /// Next value of an identity generator.
    SequenceNext(SequenceId),
    /// A zero-argument scalar call, e.g. `CURRENT_TIMESTAMP`.
    Call(ScalarOp),
}

impl std::fmt::Debug for ScalarExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarExpr::Field(i) => write!(f, "Field({i})"),
            ScalarExpr::Cast { expr, to, .. } => write!(f, "Cast({expr:?} -> {})", to.name()),
            ScalarExpr::Literal(v) => write!(f, "Literal({v:?})"),
            ScalarExpr::NullLiteral(tc) => write!(f, "NullLiteral({})", tc.name()),
            ScalarExpr::SequenceNext(s) => write!(f, "SequenceNext({s:?})"),
            ScalarExpr::Call(op) => write!(f, "Call({op:?})"),
        }
    }
}

impl ScalarExpr {
    /// Evaluate against the old row.
    pub fn eval(&self, row: &dyn Row, ctx: &QueryContext) -> Result<Value, EvalError> {
        match self {
            ScalarExpr::Field(i) => Ok(row.field(*i).clone()),
            ScalarExpr::Cast { expr, func, .. } => {
                let v = expr.eval(row, ctx)?;
                func(&v).map_err(EvalError::Domain)
            }
            ScalarExpr::Literal(v) => Ok(v.clone()),
            ScalarExpr::NullLiteral(_) => Ok(Value::Null),
            ScalarExpr::SequenceNext(seq) => {
                let next = ctx.sequences.next_value(*seq)?;
                Ok(Value::BigInt(next))
            }
            ScalarExpr::Call(op) => Ok(match op {
                ScalarOp::CurrentTimestamp => Value::Timestamp(ctx.now),
                ScalarOp::CurrentDate => Value::Date(ctx.now.date_naive()),
                ScalarOp::CurrentUser => Value::Text(ctx.current_user.clone()),
            }),
        }
    }
}
