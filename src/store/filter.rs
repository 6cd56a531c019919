//! Filter, update and sort expressions over envelope fields.
//!
//! These are the store-facing vocabulary used by the coordinator, the dispatch
//! engine and the sweeper. Every store backend evaluates them: the in-memory store
//! matches them against envelopes directly, the PostgreSQL store compiles them to
//! bound SQL through [`sqlx::QueryBuilder`].

use crate::models::{Envelope, EnvelopeStatus};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use std::cmp::Ordering;
use uuid::Uuid;

/// Addressable envelope field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Id,
    MessageType,
    Status,
    CreatedAt,
    LastActionAt,
    Attempts,
    RetryBase,
    LastError,
    ClaimOwner,
    ClaimExpiresAt,
    NextEligibleAt,
}

impl Field {
    /// Column name in the relational backend
    pub fn column(&self) -> &'static str {
        match self {
            Field::Id => "id",
            Field::MessageType => "message_type",
            Field::Status => "status",
            Field::CreatedAt => "created_at",
            Field::LastActionAt => "last_action_at",
            Field::Attempts => "attempts",
            Field::RetryBase => "retry_base",
            Field::LastError => "last_error",
            Field::ClaimOwner => "claim_owner",
            Field::ClaimExpiresAt => "claim_expires_at",
            Field::NextEligibleAt => "next_eligible_at",
        }
    }

    /// Current value of this field on an envelope; `None` means null/absent
    pub fn value_of(&self, envelope: &Envelope) -> Option<Value> {
        match self {
            Field::Id => Some(Value::Uuid(envelope.id)),
            Field::MessageType => Some(Value::Text(envelope.message_type.clone())),
            Field::Status => Some(Value::Status(envelope.status)),
            Field::CreatedAt => Some(Value::Timestamp(envelope.created_at)),
            Field::LastActionAt => Some(Value::Timestamp(envelope.last_action_at)),
            Field::Attempts => Some(Value::Int(i64::from(envelope.attempts))),
            Field::RetryBase => Some(Value::Int(i64::from(envelope.retry_base))),
            Field::LastError => envelope.last_error.clone().map(Value::Text),
            Field::ClaimOwner => envelope.claim_owner.clone().map(Value::Text),
            Field::ClaimExpiresAt => envelope.claim_expires_at.map(Value::Timestamp),
            Field::NextEligibleAt => envelope.next_eligible_at.map(Value::Timestamp),
        }
    }
}

/// A typed field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uuid(Uuid),
    Text(String),
    Status(EnvelopeStatus),
    Timestamp(DateTime<Utc>),
    Int(i64),
}

impl Value {
    /// Compare two values of the same kind; mismatched kinds are incomparable
    fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Status(a), Value::Status(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    fn push_bind(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Value::Uuid(v) => qb.push_bind(*v),
            Value::Text(v) => qb.push_bind(v.clone()),
            Value::Status(v) => qb.push_bind(v.as_str()),
            Value::Timestamp(v) => qb.push_bind(*v),
            Value::Int(v) => qb.push_bind(*v),
        };
    }
}

impl From<EnvelopeStatus> for Value {
    fn from(status: EnvelopeStatus) -> Self {
        Value::Status(status)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<Uuid> for Value {
    fn from(id: Uuid) -> Self {
        Value::Uuid(id)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Lt,
    Lte,
}

impl Op {
    fn sql(&self) -> &'static str {
        match self {
            Op::Eq => " = ",
            Op::Lt => " < ",
            Op::Lte => " <= ",
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Op::Eq => ordering == Ordering::Equal,
            Op::Lt => ordering == Ordering::Less,
            Op::Lte => ordering != Ordering::Greater,
        }
    }
}

/// Boolean filter over envelopes
///
/// Comparisons against a null field never match, mirroring SQL semantics; use
/// [`Filter::Exists`] / [`Filter::Missing`] to test presence.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare { field: Field, op: Op, value: Value },
    Exists(Field),
    Missing(Field),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: Field, value: impl Into<Value>) -> Self {
        Self::compare(field, Op::Eq, value)
    }

    pub fn lt(field: Field, value: impl Into<Value>) -> Self {
        Self::compare(field, Op::Lt, value)
    }

    pub fn lte(field: Field, value: impl Into<Value>) -> Self {
        Self::compare(field, Op::Lte, value)
    }

    pub fn compare(field: Field, op: Op, value: impl Into<Value>) -> Self {
        Self::Compare {
            field,
            op,
            value: value.into(),
        }
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::Or(filters.into_iter().collect())
    }

    /// Evaluate against an envelope
    pub fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            Filter::Compare { field, op, value } => field
                .value_of(envelope)
                .and_then(|current| current.compare(value))
                .is_some_and(|ordering| op.holds(ordering)),
            Filter::Exists(field) => field.value_of(envelope).is_some(),
            Filter::Missing(field) => field.value_of(envelope).is_none(),
            Filter::And(filters) => filters.iter().all(|f| f.matches(envelope)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(envelope)),
        }
    }

    /// Append this filter as a SQL boolean expression with bound parameters
    pub fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Filter::Compare { field, op, value } => {
                qb.push(field.column());
                qb.push(op.sql());
                value.push_bind(qb);
            }
            Filter::Exists(field) => {
                qb.push(field.column());
                qb.push(" IS NOT NULL");
            }
            Filter::Missing(field) => {
                qb.push(field.column());
                qb.push(" IS NULL");
            }
            Filter::And(filters) => push_joined(qb, filters, " AND ", "TRUE"),
            Filter::Or(filters) => push_joined(qb, filters, " OR ", "FALSE"),
        }
    }
}

fn push_joined(qb: &mut QueryBuilder<'_, Postgres>, filters: &[Filter], sep: &str, empty: &str) {
    if filters.is_empty() {
        qb.push(empty);
        return;
    }
    qb.push("(");
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            qb.push(sep);
        }
        filter.push_sql(qb);
    }
    qb.push(")");
}

/// A single field mutation
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(Field, Value),
    Unset(Field),
    Inc(Field, i64),
}

/// Ordered list of field mutations applied atomically to one document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: Field, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Set(field, value.into()));
        self
    }

    pub fn unset(mut self, field: Field) -> Self {
        self.ops.push(UpdateOp::Unset(field));
        self
    }

    pub fn inc(mut self, field: Field, by: i64) -> Self {
        self.ops.push(UpdateOp::Inc(field, by));
        self
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply to an in-memory envelope
    ///
    /// Values of the wrong kind for a field are ignored; `Id` and `CreatedAt` are
    /// immutable once stored.
    pub fn apply(&self, envelope: &mut Envelope) {
        for op in &self.ops {
            match op {
                UpdateOp::Set(field, value) => set_field(envelope, *field, Some(value)),
                UpdateOp::Unset(field) => set_field(envelope, *field, None),
                UpdateOp::Inc(Field::Attempts, by) => {
                    let next = i64::from(envelope.attempts).saturating_add(*by);
                    envelope.attempts = u32::try_from(next.max(0)).unwrap_or(u32::MAX);
                }
                UpdateOp::Inc(_, _) => {}
            }
        }
    }

    /// Append the `SET` clause body (without the `SET` keyword)
    pub fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            match op {
                UpdateOp::Set(field, value) => {
                    qb.push(field.column());
                    qb.push(" = ");
                    value.push_bind(qb);
                }
                UpdateOp::Unset(field) => {
                    qb.push(field.column());
                    qb.push(" = NULL");
                }
                UpdateOp::Inc(field, by) => {
                    qb.push(field.column());
                    qb.push(" = ");
                    qb.push(field.column());
                    qb.push(" + ");
                    qb.push_bind(*by);
                }
            }
        }
    }
}

fn set_field(envelope: &mut Envelope, field: Field, value: Option<&Value>) {
    match (field, value) {
        (Field::MessageType, Some(Value::Text(v))) => envelope.message_type = v.clone(),
        (Field::Status, Some(Value::Status(v))) => envelope.status = *v,
        (Field::LastActionAt, Some(Value::Timestamp(v))) => envelope.last_action_at = *v,
        (Field::Attempts, Some(Value::Int(v))) => {
            envelope.attempts = u32::try_from((*v).max(0)).unwrap_or(u32::MAX)
        }
        (Field::RetryBase, Some(Value::Int(v))) => {
            envelope.retry_base = u32::try_from((*v).max(0)).unwrap_or(u32::MAX)
        }
        (Field::LastError, Some(Value::Text(v))) => envelope.last_error = Some(v.clone()),
        (Field::LastError, None) => envelope.last_error = None,
        (Field::ClaimOwner, Some(Value::Text(v))) => envelope.claim_owner = Some(v.clone()),
        (Field::ClaimOwner, None) => envelope.claim_owner = None,
        (Field::ClaimExpiresAt, Some(Value::Timestamp(v))) => envelope.claim_expires_at = Some(*v),
        (Field::ClaimExpiresAt, None) => envelope.claim_expires_at = None,
        (Field::NextEligibleAt, Some(Value::Timestamp(v))) => envelope.next_eligible_at = Some(*v),
        (Field::NextEligibleAt, None) => envelope.next_eligible_at = None,
        _ => {}
    }
}

/// Sort order for selection queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub field: Field,
    pub descending: bool,
}

impl Sort {
    pub fn ascending(field: Field) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    /// Oldest first, ties broken by id (ids are time ordered)
    pub fn fifo() -> Self {
        Self::ascending(Field::CreatedAt)
    }

    pub fn compare(&self, a: &Envelope, b: &Envelope) -> Ordering {
        let primary = match (self.field.value_of(a), self.field.value_of(b)) {
            (Some(x), Some(y)) => x.compare(&y).unwrap_or(Ordering::Equal),
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        let primary = if self.descending {
            primary.reverse()
        } else {
            primary
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }

    pub fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        let direction = if self.descending { " DESC" } else { " ASC" };
        qb.push(" ORDER BY ");
        qb.push(self.field.column());
        qb.push(direction);
        qb.push(", id");
        qb.push(direction);
    }
}
