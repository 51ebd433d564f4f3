//! [`Store`] implementation over a `PostgreSQL` pool.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use meshwork_core::store::{
    BlockedUpdate, EventFilter, MessageRefFilter, MessageUpdate, Store, StoreError, StoreResult,
};
use meshwork_core::types::{Blocked, Event, EventKind, Message, MessageRef, Offset, OffsetKind};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres, QueryBuilder, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

/// `PostgreSQL`-backed [`Store`].
///
/// # Transactional groups
///
/// [`run_as_group`](Store::run_as_group) opens one explicit transaction and
/// parks it in an internal slot; every store call made while the group is
/// open is routed through that transaction, and the group commits or rolls
/// back as a whole. The slot doubles as a serialization point: the
/// aggregator is the store's only group user and is single-threaded, so
/// groups never nest and never contend.
pub struct PostgresStore {
    pool: PgPool,
    group: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PostgresStore {
    /// Connect to a database URL with a default pool (max 5 connections).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the URL is invalid or the
    /// connection fails.
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing connection pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            group: Mutex::new(None),
        }
    }

    /// Get a reference to the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run all pending SQL migrations from the workspace `migrations/`
    /// directory. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails to apply.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Persist a message and its ordered data references, as the ingestion
    /// path does. Not part of the [`Store`] trait; the aggregator never
    /// creates messages.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] on id collision, or
    /// [`StoreError::Database`] for other persistence failures.
    pub async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, namespace, context, group_id, sequence, confirmed, created)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(message.id)
        .bind(&message.namespace)
        .bind(&message.context)
        .bind(message.group)
        .bind(message.sequence)
        .bind(message.confirmed)
        .bind(message.created)
        .execute(&self.pool)
        .await
        .map_err(|e| dup_err(e, message.id))?;

        for (idx, data_id) in message.data.iter().enumerate() {
            let idx = i32::try_from(idx)
                .map_err(|_| StoreError::Database("too many data references".to_string()))?;
            sqlx::query("INSERT INTO message_data (message_id, data_id, idx) VALUES ($1, $2, $3)")
                .bind(message.id)
                .bind(data_id)
                .bind(idx)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Record a data blob as locally available. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on persistence failure.
    pub async fn insert_data(&self, data_id: Uuid, namespace: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO data (id, namespace, created) VALUES ($1, $2, now())
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(data_id)
        .bind(namespace)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn dup_err(err: sqlx::Error, id: Uuid) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate(id),
        _ => db_err(err),
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    sequence: i64,
    id: Uuid,
    kind: String,
    namespace: String,
    reference: Uuid,
    created: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            sequence: row.sequence,
            kind: EventKind::from(row.kind.as_str()),
            namespace: row.namespace,
            reference: row.reference,
            created: row.created,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    namespace: String,
    context: String,
    group_id: Option<Uuid>,
    sequence: i64,
    confirmed: Option<DateTime<Utc>>,
    created: DateTime<Utc>,
    data: Vec<Uuid>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            namespace: row.namespace,
            context: row.context,
            group: row.group_id,
            sequence: row.sequence,
            confirmed: row.confirmed,
            data: row.data,
            created: row.created,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRefRow {
    id: Uuid,
    sequence: i64,
}

#[derive(sqlx::FromRow)]
struct BlockedRow {
    id: Uuid,
    namespace: String,
    context: String,
    group_id: Option<Uuid>,
    message_id: Uuid,
    created: DateTime<Utc>,
}

impl From<BlockedRow> for Blocked {
    fn from(row: BlockedRow) -> Self {
        Self {
            id: row.id,
            namespace: row.namespace,
            context: row.context,
            group: row.group_id,
            message: row.message_id,
            created: row.created,
        }
    }
}

/// Messages are selected with their data references aggregated in order, so
/// a message round-trips in one query.
const MESSAGE_SELECT: &str = "SELECT m.id, m.namespace, m.context, m.group_id, m.sequence, \
     m.confirmed, m.created, \
     COALESCE(array_agg(md.data_id ORDER BY md.idx) \
              FILTER (WHERE md.data_id IS NOT NULL), ARRAY[]::uuid[]) AS data \
     FROM messages m LEFT JOIN message_data md ON md.message_id = m.id";

async fn fetch_events<'e, E>(executor: E, filter: &EventFilter) -> Result<Vec<Event>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT sequence, id, kind, namespace, reference, created FROM events WHERE TRUE",
    );
    if let Some(reference) = filter.reference {
        qb.push(" AND reference = ").push_bind(reference);
    }
    if let Some(kind) = &filter.kind {
        qb.push(" AND kind = ").push_bind(kind.as_str().to_string());
    }
    if let Some(after) = filter.after_sequence {
        qb.push(" AND sequence > ").push_bind(after);
    }
    qb.push(" ORDER BY sequence");
    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ").push_bind(limit);
    }
    let rows: Vec<EventRow> = qb.build_query_as().fetch_all(executor).await?;
    Ok(rows.into_iter().map(Event::from).collect())
}

async fn fetch_message_refs<'e, E>(
    executor: E,
    filter: &MessageRefFilter,
) -> Result<Vec<MessageRef>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let mut qb: QueryBuilder<Postgres> =
        QueryBuilder::new("SELECT id, sequence FROM messages WHERE namespace = ");
    qb.push_bind(filter.namespace.clone());
    qb.push(" AND context = ").push_bind(filter.context.clone());
    match filter.group {
        Some(group) => {
            qb.push(" AND group_id = ").push_bind(group);
        }
        None => {
            qb.push(" AND group_id IS NULL");
        }
    }
    if let Some(after) = filter.after_sequence {
        qb.push(" AND sequence > ").push_bind(after);
    }
    if filter.unconfirmed_only {
        qb.push(" AND confirmed IS NULL");
    }
    qb.push(" ORDER BY sequence");
    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ").push_bind(limit);
    }
    let rows: Vec<MessageRefRow> = qb.build_query_as().fetch_all(executor).await?;
    Ok(rows
        .into_iter()
        .map(|row| MessageRef {
            id: row.id,
            sequence: row.sequence,
        })
        .collect())
}

/// Route a query function through the open transaction if a group is active,
/// or straight to the pool otherwise. The slot guard is held for the
/// duration of the call either way, which also keeps group-time access
/// serialized.
macro_rules! routed {
    ($self:ident, $f:ident ( $($arg:expr),* $(,)? )) => {{
        let mut slot = $self.group.lock().await;
        match slot.as_mut() {
            Some(tx) => $f(&mut **tx, $($arg),*).await,
            None => $f(&$self.pool, $($arg),*).await,
        }
    }};
}

async fn fetch_message_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Message>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!("{MESSAGE_SELECT} WHERE m.id = $1 GROUP BY m.id");
    let row: Option<MessageRow> = sqlx::query_as(&sql).bind(id).fetch_optional(executor).await?;
    Ok(row.map(Message::from))
}

async fn fetch_messages_for_data<'e, E>(
    executor: E,
    data_id: Uuid,
    namespace: &str,
) -> Result<Vec<Message>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "{MESSAGE_SELECT} \
         WHERE m.namespace = $2 AND m.confirmed IS NULL \
           AND EXISTS (SELECT 1 FROM message_data link \
                       WHERE link.message_id = m.id AND link.data_id = $1) \
         GROUP BY m.id ORDER BY m.sequence"
    );
    let rows: Vec<MessageRow> = sqlx::query_as(&sql)
        .bind(data_id)
        .bind(namespace)
        .fetch_all(executor)
        .await?;
    Ok(rows.into_iter().map(Message::from).collect())
}

async fn insert_event_row<'e, E>(executor: E, event: &Event) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO events (id, kind, namespace, reference, created)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(event.id)
    .bind(event.kind.as_str())
    .bind(&event.namespace)
    .bind(event.reference)
    .bind(event.created)
    .execute(executor)
    .await?;
    Ok(())
}

async fn fetch_highest_sequence<'e, E>(executor: E) -> Result<Option<i64>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar("SELECT MAX(sequence) FROM events")
        .fetch_one(executor)
        .await
}

async fn update_message_row<'e, E>(
    executor: E,
    id: Uuid,
    update: &MessageUpdate,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    if let Some(confirmed) = update.confirmed {
        sqlx::query("UPDATE messages SET confirmed = $2 WHERE id = $1")
            .bind(id)
            .bind(confirmed)
            .execute(executor)
            .await?;
    }
    Ok(())
}

async fn count_available_data<'e, E>(executor: E, data_ids: &[Uuid]) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar("SELECT COUNT(*) FROM data WHERE id = ANY($1)")
        .bind(data_ids)
        .fetch_one(executor)
        .await
}

async fn fetch_blocked_by_context<'e, E>(
    executor: E,
    namespace: &str,
    context: &str,
    group: Option<Uuid>,
) -> Result<Option<Blocked>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<BlockedRow> = sqlx::query_as(
        "SELECT id, namespace, context, group_id, message_id, created FROM blocked
         WHERE namespace = $1 AND context = $2 AND group_id IS NOT DISTINCT FROM $3",
    )
    .bind(namespace)
    .bind(context)
    .bind(group)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(Blocked::from))
}

async fn insert_blocked_row<'e, E>(executor: E, blocked: &Blocked) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO blocked (id, namespace, context, group_id, message_id, created)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(blocked.id)
    .bind(&blocked.namespace)
    .bind(&blocked.context)
    .bind(blocked.group)
    .bind(blocked.message)
    .bind(blocked.created)
    .execute(executor)
    .await?;
    Ok(())
}

async fn update_blocked_row<'e, E>(
    executor: E,
    id: Uuid,
    update: &BlockedUpdate,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("UPDATE blocked SET message_id = $2 WHERE id = $1")
        .bind(id)
        .bind(update.message)
        .execute(executor)
        .await?;
    Ok(())
}

async fn delete_blocked_row<'e, E>(executor: E, id: Uuid) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("DELETE FROM blocked WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

async fn fetch_offset<'e, E>(
    executor: E,
    kind: OffsetKind,
    namespace: &str,
    name: &str,
) -> Result<Option<i64>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT current_sequence FROM offsets WHERE kind = $1 AND namespace = $2 AND name = $3",
    )
    .bind(kind.as_str())
    .bind(namespace)
    .bind(name)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(|(current,)| current))
}

async fn upsert_offset_row<'e, E>(executor: E, offset: &Offset) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO offsets (kind, namespace, name, current_sequence, updated_at)
         VALUES ($1, $2, $3, $4, now())
         ON CONFLICT (kind, namespace, name) DO UPDATE
         SET current_sequence = EXCLUDED.current_sequence, updated_at = now()",
    )
    .bind(offset.kind.as_str())
    .bind(&offset.namespace)
    .bind(&offset.name)
    .bind(offset.current)
    .execute(executor)
    .await?;
    Ok(())
}

impl Store for PostgresStore {
    fn get_events(&self, filter: EventFilter) -> BoxFuture<'_, StoreResult<Vec<Event>>> {
        Box::pin(async move { routed!(self, fetch_events(&filter)).map_err(db_err) })
    }

    fn insert_event<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            routed!(self, insert_event_row(event)).map_err(|e| dup_err(e, event.id))
        })
    }

    fn highest_event_sequence(&self) -> BoxFuture<'_, StoreResult<Option<i64>>> {
        Box::pin(async move { routed!(self, fetch_highest_sequence()).map_err(db_err) })
    }

    fn get_message_by_id(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<Message>>> {
        Box::pin(async move { routed!(self, fetch_message_by_id(id)).map_err(db_err) })
    }

    fn get_messages_for_data<'a>(
        &'a self,
        data_id: Uuid,
        namespace: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<Message>>> {
        Box::pin(async move {
            routed!(self, fetch_messages_for_data(data_id, namespace)).map_err(db_err)
        })
    }

    fn get_message_refs(
        &self,
        filter: MessageRefFilter,
    ) -> BoxFuture<'_, StoreResult<Vec<MessageRef>>> {
        Box::pin(async move { routed!(self, fetch_message_refs(&filter)).map_err(db_err) })
    }

    fn update_message(&self, id: Uuid, update: MessageUpdate) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move { routed!(self, update_message_row(id, &update)).map_err(db_err) })
    }

    fn check_data_available<'a>(
        &'a self,
        message: &'a Message,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            let mut unique = message.data.clone();
            unique.sort_unstable();
            unique.dedup();
            if unique.is_empty() {
                return Ok(true);
            }
            let available =
                routed!(self, count_available_data(&unique)).map_err(db_err)?;
            Ok(available == i64::try_from(unique.len()).unwrap_or(i64::MAX))
        })
    }

    fn get_blocked_by_context<'a>(
        &'a self,
        namespace: &'a str,
        context: &'a str,
        group: Option<Uuid>,
    ) -> BoxFuture<'a, StoreResult<Option<Blocked>>> {
        Box::pin(async move {
            routed!(self, fetch_blocked_by_context(namespace, context, group)).map_err(db_err)
        })
    }

    fn insert_blocked<'a>(&'a self, blocked: &'a Blocked) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            routed!(self, insert_blocked_row(blocked)).map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    if db.constraint() == Some("blocked_pkey") {
                        StoreError::Duplicate(blocked.id)
                    } else {
                        StoreError::Database(format!(
                            "blocker already exists for context {}:{}",
                            blocked.namespace, blocked.context
                        ))
                    }
                }
                _ => db_err(e),
            })
        })
    }

    fn update_blocked(&self, id: Uuid, update: BlockedUpdate) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move { routed!(self, update_blocked_row(id, &update)).map_err(db_err) })
    }

    fn delete_blocked(&self, id: Uuid) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move { routed!(self, delete_blocked_row(id)).map_err(db_err) })
    }

    fn get_offset<'a>(
        &'a self,
        kind: OffsetKind,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<Offset>>> {
        Box::pin(async move {
            let current =
                routed!(self, fetch_offset(kind, namespace, name)).map_err(db_err)?;
            Ok(current.map(|current| Offset {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                current,
            }))
        })
    }

    fn upsert_offset<'a>(&'a self, offset: &'a Offset) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move { routed!(self, upsert_offset_row(offset)).map_err(db_err) })
    }

    fn run_as_group<'a>(
        &'a self,
        work: BoxFuture<'a, StoreResult<()>>,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            {
                let mut slot = self.group.lock().await;
                if slot.is_some() {
                    return Err(StoreError::Transaction(
                        "transaction groups do not nest".to_string(),
                    ));
                }
                let tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| StoreError::Transaction(e.to_string()))?;
                *slot = Some(tx);
            }

            let result = work.await;

            let Some(tx) = self.group.lock().await.take() else {
                return Err(StoreError::Transaction(
                    "transaction group vanished mid-flight".to_string(),
                ));
            };
            match result {
                Ok(()) => tx
                    .commit()
                    .await
                    .map_err(|e| StoreError::Transaction(e.to_string())),
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        tracing::warn!(error = %rollback_err, "Rollback failed after group error");
                    }
                    Err(err)
                }
            }
        })
    }
}
