use crate::{
    diff::{Patch, PatchOp},
    error::JobsiteError,
    event::StoreEvent,
    properties::{now_millis, DocId},
    store::{AsSql, DocQuery, DocumentStore, ResultsPage, StoredDocument, DEFAULT_LIMIT},
};
use futures_core::future::BoxFuture;
use sqlx::{
    error::BoxDynError,
    migrate::{MigrateDatabase, Migration as SqlxMigration, MigrationSource, Migrator},
    pool::PoolOptions,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteRow},
    ConnectOptions, Execute, FromRow, Row,
};
use sqlx::{migrate::MigrationType, Pool, QueryBuilder};
use std::{fmt::Debug, path::PathBuf, result::Result, str::FromStr};

pub const JOBSITE_DB: &str = "jobsite.db";

const DOCUMENT_COLUMNS: &str = "SELECT collection, id, data, created_at, updated_at FROM documents";

impl FromRow<'_, SqliteRow> for StoredDocument {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let id_str: &str = row.try_get("id")?;
        let data_str: &str = row.try_get("data")?;
        let data = serde_json::from_str(data_str).map_err(JobsiteError::from)?;
        Ok(StoredDocument {
            collection: row.try_get("collection")?,
            id: DocId::try_from(id_str)?,
            data,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Push `data` with every op of `patch` applied, as nested `json_set`/`json_remove` calls.
fn push_patched_data(qb: &mut QueryBuilder<Sqlite>, patch: &Patch) -> Result<(), JobsiteError> {
    for op in patch.ops().iter().rev() {
        match op {
            PatchOp::Set { .. } => qb.push("json_set("),
            PatchOp::Remove { .. } => qb.push("json_remove("),
        };
    }
    qb.push("data");
    for op in patch.ops() {
        qb.push(", ");
        qb.push_bind(crate::diff::json_path(op.path())?);
        if let PatchOp::Set { value, .. } = op {
            qb.push(", json(");
            qb.push_bind(value.to_string());
            qb.push(")");
        }
        qb.push(")");
    }
    Ok(())
}

struct Staged<'a> {
    qb: QueryBuilder<'a, Sqlite>,
    /// Set for statements that must touch a row, e.g. patches. Holds the "collection/id" label.
    required: Option<String>,
}

/// Batches [StoreEvent]s and executes them inside one SQLite transaction.
pub struct Transaction<'a> {
    statements: Vec<Staged<'a>>,
    pub staged: usize,
}

impl<'a> Default for Transaction<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Transaction<'a> {
    pub fn new() -> Transaction<'a> {
        Transaction {
            statements: Vec::new(),
            staged: 0,
        }
    }

    /// Runs every staged statement, committing only if all succeed. Returns the number of
    /// rows touched.
    pub async fn execute(&mut self, connection: &Pool<Sqlite>) -> Result<usize, JobsiteError> {
        let mut tx = connection.begin().await?;
        let mut touched = 0;
        for staged in self.statements.iter_mut() {
            let query = staged.qb.build();
            let result = query.execute(&mut *tx).await?;
            if result.rows_affected() == 0 {
                if let Some(label) = &staged.required {
                    return Err(JobsiteError::NotFound(format!("{label} does not exist")));
                }
            }
            touched += result.rows_affected() as usize;
        }
        tx.commit().await?;
        tracing::debug!(
            "Committed {} staged statements, {} rows touched",
            self.staged,
            touched
        );
        self.statements.clear();
        self.staged = 0;
        Ok(touched)
    }

    pub fn add_event(&mut self, event: &StoreEvent) -> Result<(), JobsiteError> {
        match event {
            StoreEvent::Upserted(collection, id, data) => {
                self.upsert(collection, id, data);
            }
            StoreEvent::Patched(collection, id, patch) => {
                self.patch(collection, id, patch)?;
            }
            StoreEvent::Removed(collection, ids) => {
                self.remove(collection, ids);
            }
        }
        Ok(())
    }

    fn upsert(&mut self, collection: &str, id: &DocId, data: &serde_json::Value) {
        let now = now_millis();
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO documents(collection, id, data, created_at, updated_at) ",
        );
        qb.push_values(vec![(collection, id, data)], |mut b, (collection, id, data)| {
            b.push_bind(collection.to_string())
                .push_bind::<String>(id.into())
                .push_bind(data.to_string())
                .push_bind(now)
                .push_bind(now);
        });
        qb.push(
            " ON CONFLICT(collection, id) DO UPDATE SET \
             data = excluded.data, updated_at = excluded.updated_at",
        );
        self.statements.push(Staged { qb, required: None });
        self.staged += 1;
    }

    fn patch(&mut self, collection: &str, id: &DocId, patch: &Patch) -> Result<(), JobsiteError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE documents SET data = ");
        push_patched_data(&mut qb, patch)?;
        qb.push(", updated_at = ");
        qb.push_bind(now_millis());
        qb.push(" WHERE collection = ");
        qb.push_bind(collection.to_string());
        qb.push(" AND id = ");
        qb.push_bind::<String>(id.into());
        self.statements.push(Staged {
            qb,
            required: Some(format!("{collection}/{id}")),
        });
        self.staged += 1;
        Ok(())
    }

    fn remove(&mut self, collection: &str, ids: &[DocId]) {
        if ids.is_empty() {
            return;
        }
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());
        qb.push(" AND id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind::<String>(id.into());
        }
        qb.push(")");
        self.statements.push(Staged { qb, required: None });
        self.staged += 1;
    }
}

#[derive(Debug, Clone)]
pub struct DbConnection(pub Pool<Sqlite>);

/// <https://www.sqlite.org/limits.html#max_variable_number>
pub const SQLITE_LIMIT_VARIABLE_NUMBER: usize = 32766;

impl DbConnection {
    pub async fn open(db_path: PathBuf) -> Result<DbConnection, JobsiteError> {
        Ok(DbConnection(db_init(db_path).await?))
    }

    pub async fn count(&self, collection: &str) -> Result<usize, JobsiteError> {
        let row = sqlx::query("SELECT COUNT(*) FROM documents WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.0)
            .await?;
        Ok(row.get::<i64, usize>(0) as usize)
    }

    #[tracing::instrument(skip(self))]
    async fn select<Q>(&self, query: &Q, tail: &DocQuery) -> Result<Vec<StoredDocument>, JobsiteError>
    where
        Q: AsSql + Debug,
    {
        let mut qb = QueryBuilder::<Sqlite>::new(DOCUMENT_COLUMNS);
        query.build_query(true, &mut qb);
        qb.push(" ORDER BY ");
        if let Some(order) = &tail.order_by {
            qb.push("json_extract(data, ");
            qb.push_bind(order.field.sql_path());
            qb.push(if order.descending { ") DESC, " } else { ") ASC, " });
        }
        qb.push("id ASC");
        match (tail.limit, tail.offset) {
            (None, None) => {}
            (limit, offset) => {
                qb.push(" LIMIT ");
                qb.push_bind(limit.map(|l| l as i64).unwrap_or(-1));
                qb.push(" OFFSET ");
                qb.push_bind(offset.unwrap_or_default() as i64);
            }
        }
        let doc_query = qb.build_query_as::<StoredDocument>();
        let doc_sql = doc_query.sql().to_string();
        let results = doc_query.fetch_all(&self.0).await.map_err(|e| {
            tracing::error!(
                "[DbConnection.select] SQL error processing query '{}'\n\terror: {}",
                doc_sql,
                e
            );
            e
        })?;
        Ok(results)
    }
}

impl DocumentStore for DbConnection {
    #[tracing::instrument(skip(self))]
    async fn get(&self, collection: &str, id: &DocId) -> Result<Option<StoredDocument>, JobsiteError> {
        let mut qb = QueryBuilder::<Sqlite>::new(DOCUMENT_COLUMNS);
        qb.push(" WHERE collection = ");
        qb.push_bind(collection.to_string());
        qb.push(" AND id = ");
        qb.push_bind::<String>(id.into());
        Ok(qb
            .build_query_as::<StoredDocument>()
            .fetch_optional(&self.0)
            .await?)
    }

    #[tracing::instrument(skip(self, data))]
    async fn put(
        &self,
        collection: &str,
        id: &DocId,
        data: serde_json::Value,
    ) -> Result<StoredDocument, JobsiteError> {
        let mut transaction = Transaction::new();
        transaction.upsert(collection, id, &data);
        transaction.execute(&self.0).await?;
        self.get(collection, id)
            .await?
            .ok_or_else(|| JobsiteError::Store(format!("{collection}/{id} vanished after write")))
    }

    #[tracing::instrument(skip(self, patch))]
    async fn patch(
        &self,
        collection: &str,
        id: &DocId,
        patch: &Patch,
    ) -> Result<StoredDocument, JobsiteError> {
        let mut transaction = Transaction::new();
        transaction.patch(collection, id, patch)?;
        transaction.execute(&self.0).await?;
        self.get(collection, id)
            .await?
            .ok_or_else(|| JobsiteError::NotFound(format!("{collection}/{id} does not exist")))
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, collection: &str, id: &DocId) -> Result<bool, JobsiteError> {
        let mut transaction = Transaction::new();
        transaction.remove(collection, std::slice::from_ref(id));
        Ok(transaction.execute(&self.0).await? > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn query(&self, query: &DocQuery) -> Result<Vec<StoredDocument>, JobsiteError> {
        query.validate()?;
        self.select(query, query).await
    }

    #[tracing::instrument(skip(self))]
    async fn query_page(
        &self,
        query: &DocQuery,
    ) -> Result<ResultsPage<Vec<StoredDocument>>, JobsiteError> {
        query.validate()?;
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM documents");
        query.build_query(true, &mut qb);
        let count_row = qb.build().fetch_one(&self.0).await?;
        let count = count_row.get::<i64, usize>(0) as usize;

        let paged = DocQuery {
            limit: Some(query.limit.unwrap_or(DEFAULT_LIMIT)),
            offset: Some(query.offset.unwrap_or_default()),
            ..query.clone()
        };
        let results = self.select(&paged, &paged).await?;
        Ok(ResultsPage {
            count,
            start: query.offset.unwrap_or_default(),
            results,
        })
    }

    #[tracing::instrument(skip(self, events))]
    async fn apply(&self, events: &[StoreEvent]) -> Result<usize, JobsiteError> {
        let mut transaction = Transaction::new();
        for event in events {
            transaction.add_event(event)?;
        }
        transaction.execute(&self.0).await
    }
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![Migration {
        version: 1,
        description: "create_documents",
        sql: "\
            CREATE TABLE documents (\
                collection TEXT NOT NULL, \
                id TEXT NOT NULL, \
                data TEXT NOT NULL, \
                created_at INTEGER NOT NULL, \
                updated_at INTEGER NOT NULL, \
                PRIMARY KEY (collection, id)); \
            CREATE INDEX documents_by_collection ON documents(collection, updated_at);",
        kind: MigrationType::ReversibleUp,
    }])
}

pub async fn db_init(db_path: PathBuf) -> Result<Pool<Sqlite>, JobsiteError> {
    let path_str = db_path.to_str().ok_or_else(|| {
        JobsiteError::Io(format!("database path {db_path:?} is not valid UTF-8"))
    })?;
    let fqdb = format!("sqlite:{path_str}");
    tracing::debug!("Initializing document db from file: {:?}", fqdb);
    if !Sqlite::database_exists(&fqdb).await.unwrap_or(false) {
        Sqlite::create_database(&fqdb).await?;
    }
    let options = SqliteConnectOptions::from_str(&fqdb)?
        .read_only(false)
        .disable_statement_logging()
        .create_if_missing(true);

    let pool = PoolOptions::<Sqlite>::new().connect_with(options).await?;

    let migrator = Migrator::new(migrations()).await?;
    migrator.run(&pool).await?;

    let count_res = sqlx::query("SELECT COUNT(*) as dcount FROM documents;")
        .fetch_one(&pool)
        .await?;
    tracing::info!(
        "DB Connection initialized.\n \
         \tStored document count:\t{:?}",
        count_res.get::<i64, usize>(0)
    );

    Ok(pool)
}
