//! # PostgreSQL Envelope Store
//!
//! [`EnvelopeStore`] over a single PostgreSQL table. Claims are a single
//! `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED LIMIT 1) RETURNING *`
//! statement, so concurrent workers never block on, or double-claim, the same row.
//!
//! ```rust,no_run
//! use outbox_dispatcher::store::{EnvelopeStore, PgEnvelopeStore, UnitOfWork};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let store = PgEnvelopeStore::new(pool, "billing_")?;
//! store.ensure_indexes().await?;
//!
//! let mut session = store.begin().await?;
//! sqlx::query("UPDATE invoices SET paid = true WHERE id = 7")
//!     .execute(session.connection())
//!     .await?;
//! // writer.append(&InvoicePaid { .. }, Some(&mut session)).await?;
//! session.commit().await?;
//! # Ok(())
//! # }
//! ```

use super::filter::{Filter, Sort, Update};
use super::{collection_name, EnvelopeStore, UnitOfWork};
use crate::error::{OutboxError, Result};
use crate::models::{Envelope, EnvelopeId, EnvelopeStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

const COLUMNS: &str = "id, message_type, payload, status, created_at, last_action_at, attempts, \
                       retry_base, last_error, claim_owner, claim_expires_at, next_eligible_at";

/// PostgreSQL-backed envelope store
#[derive(Debug, Clone)]
pub struct PgEnvelopeStore {
    pool: PgPool,
    table: String,
}

impl PgEnvelopeStore {
    /// Create a store for `{prefix}outbox_messages`
    ///
    /// The prefix is spliced into SQL identifiers, so only ASCII letters, digits
    /// and underscores are accepted.
    pub fn new(pool: PgPool, prefix: &str) -> Result<Self> {
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(OutboxError::configuration(
                "collection_name_prefix",
                format!("'{prefix}' must contain only ASCII letters, digits and underscores"),
            ));
        }
        Ok(Self {
            pool,
            table: collection_name(prefix),
        })
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a transaction that outbox inserts and business writes can share
    pub async fn begin(&self) -> Result<PgSession> {
        let tx = self.pool.begin().await?;
        Ok(PgSession { tx })
    }
}

#[async_trait]
impl EnvelopeStore for PgEnvelopeStore {
    type Session = PgSession;

    fn collection(&self) -> &str {
        &self.table
    }

    #[instrument(skip(self), fields(table = %self.table))]
    async fn ensure_indexes(&self) -> Result<()> {
        let table = &self.table;
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id               UUID PRIMARY KEY,
                    message_type     TEXT NOT NULL,
                    payload          TEXT NOT NULL,
                    status           TEXT NOT NULL,
                    created_at       TIMESTAMPTZ NOT NULL,
                    last_action_at   TIMESTAMPTZ NOT NULL,
                    attempts         INTEGER NOT NULL DEFAULT 0,
                    retry_base       INTEGER NOT NULL DEFAULT 0,
                    last_error       TEXT,
                    claim_owner      TEXT,
                    claim_expires_at TIMESTAMPTZ,
                    next_eligible_at TIMESTAMPTZ,
                    CONSTRAINT {table}_claim_pair CHECK ((claim_owner IS NULL) = (claim_expires_at IS NULL))
                )
                "#
            ),
            format!(
                "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS retry_base INTEGER NOT NULL DEFAULT 0"
            ),
            format!("CREATE INDEX IF NOT EXISTS {table}_status_idx ON {table} (status)"),
            format!("CREATE INDEX IF NOT EXISTS {table}_created_at_idx ON {table} (created_at)"),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_message_type_idx ON {table} (message_type)"
            ),
        ];

        for statement in statements {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to bootstrap outbox table {}: {}", table, e);
                    OutboxError::from(e)
                })?;
        }

        info!(table = %table, "Outbox table and indexes ready");
        Ok(())
    }

    async fn insert(
        &self,
        envelope: Envelope,
        session: Option<&mut PgSession>,
    ) -> Result<EnvelopeId> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {} ({COLUMNS}) VALUES (",
            self.table
        ));
        {
            let mut values = qb.separated(", ");
            values.push_bind(envelope.id);
            values.push_bind(envelope.message_type);
            values.push_bind(envelope.payload);
            values.push_bind(envelope.status.as_str());
            values.push_bind(envelope.created_at);
            values.push_bind(envelope.last_action_at);
            values.push_bind(attempts_to_db(envelope.attempts));
            values.push_bind(attempts_to_db(envelope.retry_base));
            values.push_bind(envelope.last_error);
            values.push_bind(envelope.claim_owner);
            values.push_bind(envelope.claim_expires_at);
            values.push_bind(envelope.next_eligible_at);
        }
        qb.push(")");

        let query = qb.build();
        match session {
            Some(session) => query.execute(&mut *session.tx).await?,
            None => query.execute(&self.pool).await?,
        };

        debug!(table = %self.table, envelope_id = %envelope.id, "Envelope inserted");
        Ok(envelope.id)
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        sort: Option<Sort>,
    ) -> Result<Option<Envelope>> {
        if update.is_empty() {
            return Err(OutboxError::invalid_state(
                "find_one_and_update requires at least one field update",
            ));
        }
        let table = &self.table;
        let mut qb = QueryBuilder::<Postgres>::new(format!("UPDATE {table} SET "));
        update.push_sql(&mut qb);
        qb.push(format!(" WHERE id = (SELECT id FROM {table} WHERE "));
        filter.push_sql(&mut qb);
        sort.unwrap_or_else(Sort::fifo).push_sql(&mut qb);
        qb.push(format!(" LIMIT 1 FOR UPDATE SKIP LOCKED) RETURNING {COLUMNS}"));

        let row = qb
            .build_query_as::<EnvelopeRow>()
            .fetch_optional(&self.pool)
            .await?;
        row.map(Envelope::try_from).transpose()
    }

    async fn update_many(&self, filter: &Filter, update: &Update) -> Result<u64> {
        if update.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Postgres>::new(format!("UPDATE {} SET ", self.table));
        update.push_sql(&mut qb);
        qb.push(" WHERE ");
        filter.push_sql(&mut qb);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn find(
        &self,
        filter: &Filter,
        sort: Option<Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope>> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM {} WHERE ", self.table));
        filter.push_sql(&mut qb);
        sort.unwrap_or_else(Sort::fifo).push_sql(&mut qb);
        if let Some(limit) = limit {
            qb.push(" LIMIT ");
            qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = qb
            .build_query_as::<EnvelopeRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Envelope::try_from).collect()
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {} WHERE ", self.table));
        filter.push_sql(&mut qb);
        let (count,): (i64,) = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

/// Transaction shared between outbox inserts and the caller's own writes
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession").finish_non_exhaustive()
    }
}

impl PgSession {
    /// Connection to run business-entity statements on inside this transaction
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[async_trait]
impl UnitOfWork for PgSession {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn abort(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

/// Internal struct for SQL query results
#[derive(sqlx::FromRow)]
struct EnvelopeRow {
    id: Uuid,
    message_type: String,
    payload: String,
    status: String,
    created_at: DateTime<Utc>,
    last_action_at: DateTime<Utc>,
    attempts: i32,
    retry_base: i32,
    last_error: Option<String>,
    claim_owner: Option<String>,
    claim_expires_at: Option<DateTime<Utc>>,
    next_eligible_at: Option<DateTime<Utc>>,
}

impl TryFrom<EnvelopeRow> for Envelope {
    type Error = OutboxError;

    fn try_from(row: EnvelopeRow) -> Result<Self> {
        let status: EnvelopeStatus = row.status.parse().map_err(OutboxError::deserialization)?;
        Ok(Envelope {
            id: row.id,
            message_type: row.message_type,
            payload: row.payload,
            status,
            created_at: row.created_at,
            last_action_at: row.last_action_at,
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
            retry_base: u32::try_from(row.retry_base).unwrap_or_default(),
            last_error: row.last_error,
            claim_owner: row.claim_owner,
            claim_expires_at: row.claim_expires_at,
            next_eligible_at: row.next_eligible_at,
        })
    }
}
