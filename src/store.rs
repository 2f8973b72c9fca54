//! SQLite store for items, workflow items and their links

use async_trait::async_trait;
use chrono::Utc;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use uuid::Uuid;

use crate::context::Context;
use crate::discovery::{DiscoverQuery, DiscoveryQueryRunner, FilterQuery, IndexableType, ItemStream};
use crate::error::{Result, WorkflowError};
use crate::models::{Item, ItemState, MetadataValue, ShadowCopyLink, WorkflowItem};
use crate::services::{ItemRepository, LinkRepository, MetadataRepository, WorkflowItemRepository};

/// Rows fetched per discovery page
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Apply the bundled schema migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

type SharedTransaction = Arc<Mutex<Option<Transaction<'static, Sqlite>>>>;

/// Database store
///
/// A store returned by [`UnitOfWork::store`] runs every statement inside the
/// unit's transaction; its own multi-statement writes become savepoints.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    page_size: u32,
    unit: Option<SharedTransaction>,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            page_size: DEFAULT_PAGE_SIZE,
            unit: None,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Open a transaction that every repository call through [`UnitOfWork::store`] joins
    pub async fn begin(&self) -> Result<UnitOfWork> {
        if self.unit.is_some() {
            return Err(WorkflowError::InvalidState(
                "A unit of work is already open on this store".to_string(),
            ));
        }

        let tx = self.pool.begin().await?;
        Ok(UnitOfWork {
            store: Store {
                pool: self.pool.clone(),
                page_size: self.page_size,
                unit: Some(Arc::new(Mutex::new(Some(tx)))),
            },
        })
    }

    async fn acquire(&self) -> Result<StoreConnection> {
        match &self.unit {
            None => Ok(StoreConnection::Pooled(self.pool.acquire().await?)),
            Some(unit) => {
                let guard = unit.clone().lock_owned().await;
                OwnedMutexGuard::try_map(guard, |tx| tx.as_mut().map(|tx| &mut **tx))
                    .map(StoreConnection::Unit)
                    .map_err(|_| WorkflowError::InvalidState("Unit of work is already closed".to_string()))
            }
        }
    }
}

/// Connection used by a single repository call
enum StoreConnection {
    Pooled(PoolConnection<Sqlite>),
    Unit(OwnedMappedMutexGuard<Option<Transaction<'static, Sqlite>>, SqliteConnection>),
}

impl Deref for StoreConnection {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        match self {
            StoreConnection::Pooled(conn) => conn,
            StoreConnection::Unit(conn) => conn,
        }
    }
}

impl DerefMut for StoreConnection {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        match self {
            StoreConnection::Pooled(conn) => conn,
            StoreConnection::Unit(conn) => conn,
        }
    }
}

/// All-or-nothing scope for one workflow transition
///
/// Dropping the unit without [`commit`](Self::commit) rolls everything back,
/// including writes made through stores cloned from it.
pub struct UnitOfWork {
    store: Store,
}

impl UnitOfWork {
    pub fn store(&self) -> Store {
        self.store.clone()
    }

    pub async fn commit(self) -> Result<()> {
        let tx = self.take().await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        let tx = self.take().await?;
        tx.rollback().await?;
        Ok(())
    }

    async fn take(&self) -> Result<Transaction<'static, Sqlite>> {
        let unit = self
            .store
            .unit
            .as_ref()
            .ok_or_else(|| WorkflowError::Internal("Unit of work without transaction".to_string()))?;
        unit.lock()
            .await
            .take()
            .ok_or_else(|| WorkflowError::InvalidState("Unit of work is already closed".to_string()))
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if let Some(unit) = &self.store.unit {
            if let Ok(mut tx) = unit.try_lock() {
                if tx.take().is_some() {
                    tracing::debug!("unit of work dropped without commit, rolled back");
                }
            }
        }
    }
}

async fn load_metadata(conn: &mut SqliteConnection, item_id: Uuid) -> Result<Vec<MetadataValue>> {
    let rows = sqlx::query_as::<_, MetadataRow>(
        r#"
        SELECT field, value, authority, confidence, place
        FROM metadata_values
        WHERE item_id = ?
        ORDER BY id ASC
        "#,
    )
    .bind(item_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(MetadataValue::from).collect())
}

async fn fetch_item(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Item>> {
    let row = sqlx::query_as::<_, ItemRow>(
        r#"
        SELECT id, collection_id, state, last_modified
        FROM items
        WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            let metadata = load_metadata(conn, id).await?;
            row.into_item(metadata).map(Some)
        }
        None => Ok(None),
    }
}

async fn fetch_workflow_item(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<WorkflowItem>> {
    let row = sqlx::query_as::<_, WorkflowItemRow>(
        r#"
        SELECT id, item_id, collection_id, step_id, action_id, created_at, updated_at
        FROM workflow_items
        WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    row.map(WorkflowItem::try_from).transpose()
}

/// Explain why a conditional state update touched no row
async fn state_conflict(conn: &mut SqliteConnection, id: Uuid, wanted: &str) -> WorkflowError {
    let state: std::result::Result<Option<(String,)>, sqlx::Error> =
        sqlx::query_as("SELECT state FROM items WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await;

    match state {
        Ok(Some((state,))) => {
            WorkflowError::InvalidState(format!("Item {} is {}, expected {}", id, state, wanted))
        }
        Ok(None) => WorkflowError::NotFound(format!("Item {} not found", id)),
        Err(e) => WorkflowError::Database(e),
    }
}

/// Replace all metadata of an item, numbering places per field
async fn write_metadata(
    conn: &mut SqliteConnection,
    item_id: Uuid,
    metadata: &[MetadataValue],
) -> Result<()> {
    sqlx::query("DELETE FROM metadata_values WHERE item_id = ?")
        .bind(item_id.to_string())
        .execute(&mut *conn)
        .await?;

    let mut places: HashMap<&str, i32> = HashMap::new();
    for value in metadata {
        let place = places.entry(value.field.as_str()).or_insert(0);
        sqlx::query(
            r#"
            INSERT INTO metadata_values (item_id, field, value, authority, confidence, place)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item_id.to_string())
        .bind(&value.field)
        .bind(&value.value)
        .bind(value.authority.as_deref())
        .bind(value.confidence)
        .bind(*place)
        .execute(&mut *conn)
        .await?;
        *place += 1;
    }

    Ok(())
}

fn unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation))
        .unwrap_or(false)
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| WorkflowError::Internal(format!("Invalid UUID: {}", e)))
}

#[async_trait]
impl ItemRepository for Store {
    async fn find_item(&self, _context: &Context, id: Uuid) -> Result<Option<Item>> {
        let mut conn = self.acquire().await?;
        fetch_item(&mut conn, id).await
    }

    async fn create_item(
        &self,
        context: &Context,
        collection_id: Option<Uuid>,
        metadata: Vec<MetadataValue>,
    ) -> Result<Item> {
        context.ensure_writable()?;
        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut conn = self.acquire().await?;
        let mut tx = conn.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO items (id, collection_id, state, created_at, last_modified)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(collection_id.map(|c| c.to_string()))
        .bind(ItemState::Workspace.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        write_metadata(&mut tx, id, &metadata).await?;
        tx.commit().await?;

        fetch_item(&mut conn, id)
            .await?
            .ok_or_else(|| WorkflowError::Internal(format!("Item {} vanished after insert", id)))
    }

    async fn update_items(&self, context: &Context, items: &[Item]) -> Result<()> {
        context.ensure_writable()?;
        if items.is_empty() {
            return Ok(());
        }
        let now = Utc::now();

        let mut conn = self.acquire().await?;
        let mut tx = conn.begin().await?;
        for item in items {
            let updated = sqlx::query("UPDATE items SET last_modified = ? WHERE id = ?")
                .bind(now)
                .bind(item.id.to_string())
                .execute(&mut *tx)
                .await?;
            if updated.rows_affected() == 0 {
                return Err(WorkflowError::NotFound(format!("Item {} not found", item.id)));
            }
            write_metadata(&mut tx, item.id, &item.metadata).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn install_item(&self, context: &Context, workflow_item: &WorkflowItem) -> Result<Item> {
        context.ensure_writable()?;
        let now = Utc::now();

        let mut conn = self.acquire().await?;
        let mut tx = conn.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE items SET state = ?, collection_id = ?, last_modified = ?
            WHERE id = ? AND state IN ('workspace', 'workflow')
            "#,
        )
        .bind(ItemState::Archived.as_str())
        .bind(workflow_item.collection_id.to_string())
        .bind(now)
        .bind(workflow_item.item_id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(state_conflict(&mut tx, workflow_item.item_id, "in workflow").await);
        }

        sqlx::query("DELETE FROM workflow_items WHERE id = ?")
            .bind(workflow_item.id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        fetch_item(&mut conn, workflow_item.item_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Item {} not found", workflow_item.item_id)))
    }

    async fn withdraw_item(&self, context: &Context, id: Uuid) -> Result<Item> {
        context.ensure_writable()?;

        let mut conn = self.acquire().await?;
        let updated = sqlx::query(
            r#"
            UPDATE items SET state = ?, last_modified = ?
            WHERE id = ? AND state = 'archived'
            "#,
        )
        .bind(ItemState::Withdrawn.as_str())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(state_conflict(&mut conn, id, "archived").await);
        }

        fetch_item(&mut conn, id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Item {} not found", id)))
    }

    async fn delete_item(&self, context: &Context, id: Uuid) -> Result<()> {
        context.ensure_writable()?;

        let mut conn = self.acquire().await?;
        let mut tx = conn.begin().await?;
        sqlx::query("DELETE FROM workflow_items WHERE item_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM correction_links WHERE correction_item_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM metadata_values WHERE item_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(WorkflowError::NotFound(format!("Item {} not found", id)));
        }
        tx.commit().await?;

        Ok(())
    }
}

#[async_trait]
impl MetadataRepository for Store {
    async fn first_value(&self, _context: &Context, item_id: Uuid, field: &str) -> Result<Option<String>> {
        let mut conn = self.acquire().await?;
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT value FROM metadata_values
            WHERE item_id = ? AND field = ?
            ORDER BY place ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(item_id.to_string())
        .bind(field)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn set_value(&self, context: &Context, item_id: Uuid, field: &str, value: &str) -> Result<()> {
        context.ensure_writable()?;

        let mut conn = self.acquire().await?;
        let mut tx = conn.begin().await?;
        let touched = sqlx::query("UPDATE items SET last_modified = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(item_id.to_string())
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(WorkflowError::NotFound(format!("Item {} not found", item_id)));
        }

        sqlx::query("DELETE FROM metadata_values WHERE item_id = ? AND field = ?")
            .bind(item_id.to_string())
            .bind(field)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO metadata_values (item_id, field, value, authority, confidence, place)
            VALUES (?, ?, ?, NULL, -1, 0)
            "#,
        )
        .bind(item_id.to_string())
        .bind(field)
        .bind(value)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn clear_field(&self, context: &Context, item_id: Uuid, field: &str) -> Result<()> {
        context.ensure_writable()?;

        let mut conn = self.acquire().await?;
        sqlx::query("DELETE FROM metadata_values WHERE item_id = ? AND field = ?")
            .bind(item_id.to_string())
            .bind(field)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl WorkflowItemRepository for Store {
    async fn find_workflow_item(&self, _context: &Context, id: Uuid) -> Result<Option<WorkflowItem>> {
        let mut conn = self.acquire().await?;
        fetch_workflow_item(&mut conn, id).await
    }

    async fn find_by_item(&self, _context: &Context, item_id: Uuid) -> Result<Option<WorkflowItem>> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query_as::<_, WorkflowItemRow>(
            r#"
            SELECT id, item_id, collection_id, step_id, action_id, created_at, updated_at
            FROM workflow_items
            WHERE item_id = ?
            "#,
        )
        .bind(item_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(WorkflowItem::try_from).transpose()
    }

    async fn start_workflow(
        &self,
        context: &Context,
        item_id: Uuid,
        collection_id: Uuid,
        step_id: &str,
        action_id: &str,
    ) -> Result<WorkflowItem> {
        context.ensure_writable()?;
        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut conn = self.acquire().await?;
        let mut tx = conn.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE items SET state = ?, collection_id = ?, last_modified = ?
            WHERE id = ? AND state = 'workspace'
            "#,
        )
        .bind(ItemState::Workflow.as_str())
        .bind(collection_id.to_string())
        .bind(now)
        .bind(item_id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(state_conflict(&mut tx, item_id, "in workspace").await);
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_items (id, item_id, collection_id, step_id, action_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(item_id.to_string())
        .bind(collection_id.to_string())
        .bind(step_id)
        .bind(action_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                WorkflowError::InvalidState(format!("Item {} already has a workflow", item_id))
            } else {
                WorkflowError::Database(e)
            }
        })?;
        tx.commit().await?;

        Ok(WorkflowItem {
            id,
            item_id,
            collection_id,
            step_id: step_id.to_string(),
            action_id: action_id.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn move_to(
        &self,
        context: &Context,
        id: Uuid,
        step_id: &str,
        action_id: &str,
    ) -> Result<WorkflowItem> {
        context.ensure_writable()?;

        let mut conn = self.acquire().await?;
        let updated = sqlx::query(
            r#"
            UPDATE workflow_items SET step_id = ?, action_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(step_id)
        .bind(action_id)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(WorkflowError::NotFound(format!("Workflow item {} not found", id)));
        }

        fetch_workflow_item(&mut conn, id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Workflow item {} not found", id)))
    }
}

#[async_trait]
impl LinkRepository for Store {
    async fn find_shadow_copy_link(&self, _context: &Context, item_id: Uuid) -> Result<Option<ShadowCopyLink>> {
        let mut conn = self.acquire().await?;
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT directorio_item_id, institution_item_id
            FROM shadow_copy_links
            WHERE directorio_item_id = ? OR institution_item_id = ?
            LIMIT 1
            "#,
        )
        .bind(item_id.to_string())
        .bind(item_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|(directorio, institution)| {
            Ok(ShadowCopyLink {
                directorio_item_id: parse_uuid(&directorio)?,
                institution_item_id: parse_uuid(&institution)?,
            })
        })
        .transpose()
    }

    async fn create_shadow_copy_link(&self, context: &Context, link: ShadowCopyLink) -> Result<()> {
        context.ensure_writable()?;

        let mut conn = self.acquire().await?;
        let mut tx = conn.begin().await?;

        // Each item may take part in one link, whichever end it is on
        let (linked,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM shadow_copy_links
            WHERE directorio_item_id IN (?, ?) OR institution_item_id IN (?, ?)
            "#,
        )
        .bind(link.directorio_item_id.to_string())
        .bind(link.institution_item_id.to_string())
        .bind(link.directorio_item_id.to_string())
        .bind(link.institution_item_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        if linked > 0 {
            return Err(WorkflowError::InvalidState(format!(
                "Item {} or {} already has a shadow copy",
                link.directorio_item_id, link.institution_item_id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO shadow_copy_links (directorio_item_id, institution_item_id, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(link.directorio_item_id.to_string())
        .bind(link.institution_item_id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn find_corrected_item_id(&self, _context: &Context, correction_item_id: Uuid) -> Result<Option<Uuid>> {
        let mut conn = self.acquire().await?;
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT original_item_id FROM correction_links WHERE correction_item_id = ?",
        )
        .bind(correction_item_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|(id,)| parse_uuid(&id)).transpose()
    }

    async fn create_correction_link(
        &self,
        context: &Context,
        correction_item_id: Uuid,
        original_item_id: Uuid,
    ) -> Result<()> {
        context.ensure_writable()?;

        let mut conn = self.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO correction_links (correction_item_id, original_item_id, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(correction_item_id.to_string())
        .bind(original_item_id.to_string())
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                WorkflowError::InvalidState(format!(
                    "Item {} is already a correction",
                    correction_item_id
                ))
            } else {
                WorkflowError::Database(e)
            }
        })?;

        Ok(())
    }
}

/// One keyset page of a discovery query, ordered by item id
fn page_query<'q>(query: &'q DiscoverQuery, after: Option<&'q str>, limit: i64) -> QueryBuilder<'q, Sqlite> {
    let mut builder = QueryBuilder::new("SELECT i.id FROM items i WHERE 1 = 1");

    if let Some(dso_type) = query.dso_type {
        match dso_type {
            IndexableType::Item => builder.push(" AND i.state IN ('archived', 'withdrawn')"),
            IndexableType::WorkflowItem => builder.push(" AND i.state = 'workflow'"),
        };
    }

    for filter in &query.filter_queries {
        match filter {
            FilterQuery::Authority { value } => {
                builder.push(
                    " AND EXISTS (SELECT 1 FROM metadata_values m WHERE m.item_id = i.id AND m.authority = ",
                );
                builder.push_bind(value.as_str());
                builder.push(")");
            }
            FilterQuery::Metadata { field, value } => {
                builder.push(
                    " AND EXISTS (SELECT 1 FROM metadata_values m WHERE m.item_id = i.id AND m.field = ",
                );
                builder.push_bind(field.as_str());
                builder.push(" AND m.value = ");
                builder.push_bind(value.as_str());
                builder.push(")");
            }
        }
    }

    if let Some(after) = after {
        builder.push(" AND i.id > ");
        builder.push_bind(after);
    }

    builder.push(" ORDER BY i.id ASC LIMIT ");
    builder.push_bind(limit);
    builder
}

impl Store {
    /// Connection is held for one page only, so callers may use the store between pages
    async fn fetch_page(&self, query: &DiscoverQuery, after: Option<&str>, limit: i64) -> Result<Vec<String>> {
        let mut conn = self.acquire().await?;
        let mut builder = page_query(query, after, limit);
        let rows: Vec<(String,)> = builder.build_query_as().fetch_all(&mut *conn).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

impl DiscoveryQueryRunner for Store {
    fn iterate(&self, query: DiscoverQuery) -> ItemStream<'static> {
        let store = self.clone();
        let limit = i64::from(self.page_size);

        Box::pin(async_stream::stream! {
            tracing::debug!(query = %query.to_query_string(), "discovery scan started");
            let mut after: Option<String> = None;

            loop {
                let page = match store.fetch_page(&query, after.as_deref(), limit).await {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let fetched = page.len() as i64;

                for id in page {
                    match parse_uuid(&id) {
                        Ok(uuid) => {
                            after = Some(id);
                            yield Ok(uuid);
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }

                if fetched < limit {
                    break;
                }
            }
        })
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: String,
    collection_id: Option<String>,
    state: String,
    last_modified: chrono::DateTime<Utc>,
}

impl ItemRow {
    fn into_item(self, metadata: Vec<MetadataValue>) -> Result<Item> {
        Ok(Item {
            id: parse_uuid(&self.id)?,
            collection_id: self.collection_id.as_deref().map(parse_uuid).transpose()?,
            state: self
                .state
                .parse()
                .map_err(|e| WorkflowError::Internal(format!("Invalid state: {}", e)))?,
            metadata,
            last_modified: self.last_modified,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MetadataRow {
    field: String,
    value: String,
    authority: Option<String>,
    confidence: i32,
    place: i32,
}

impl From<MetadataRow> for MetadataValue {
    fn from(row: MetadataRow) -> Self {
        MetadataValue {
            field: row.field,
            value: row.value,
            authority: row.authority,
            confidence: row.confidence,
            place: row.place,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowItemRow {
    id: String,
    item_id: String,
    collection_id: String,
    step_id: String,
    action_id: String,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<WorkflowItemRow> for WorkflowItem {
    type Error = WorkflowError;

    fn try_from(row: WorkflowItemRow) -> Result<Self> {
        Ok(WorkflowItem {
            id: parse_uuid(&row.id)?,
            item_id: parse_uuid(&row.item_id)?,
            collection_id: parse_uuid(&row.collection_id)?,
            step_id: row.step_id,
            action_id: row.action_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
