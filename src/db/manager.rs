use crate::db::retry::{BackoffPolicy, RetryExhausted};
use crate::db::{connect_options, database_file, FetchMode, QueryOutput, SqlValue, DEFAULT_BUSY_TIMEOUT};
use crate::error::AppError;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Sqlite};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};

pub type ConnectionHandle = Arc<ConnectionSlot>;

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub data_dir: PathBuf,
    pub busy_timeout: Duration,
    pub retry: BackoffPolicy,
}

impl StorageOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            retry: BackoffPolicy::default(),
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Caller that began a `commit = false` transaction: the tokio task, or the
/// thread itself when called from outside a task (`block_on`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SessionOwner {
    Task(tokio::task::Id),
    Thread(ThreadId),
}

impl SessionOwner {
    fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Self::Task(id),
            None => Self::Thread(std::thread::current().id()),
        }
    }
}

type SessionKey = (SessionOwner, String);

/// One physical SQLite connection plus the owner of the transaction it may
/// hold open between `commit = false` statements.
#[derive(Debug)]
pub struct PooledConnection {
    connection: SqliteConnection,
    transaction_owner: Option<SessionOwner>,
}

impl PooledConnection {
    fn new(connection: SqliteConnection) -> Self {
        Self {
            connection,
            transaction_owner: None,
        }
    }

    pub fn transaction_open(&self) -> bool {
        self.transaction_owner.is_some()
    }

    async fn execute(
        &mut self,
        owner: SessionOwner,
        sql: &str,
        params: &[SqlValue],
        fetch: FetchMode,
        commit: bool,
    ) -> Result<QueryOutput, AppError> {
        if !commit && self.transaction_owner.is_none() {
            sqlx::query("BEGIN").execute(&mut self.connection).await?;
            self.transaction_owner = Some(owner);
        }

        let output = run_statement(&mut self.connection, sql, params, fetch).await?;

        if commit {
            self.commit().await?;
        }
        Ok(output)
    }

    async fn commit(&mut self) -> Result<(), AppError> {
        if self.transaction_owner.is_some() {
            sqlx::query("COMMIT").execute(&mut self.connection).await?;
            self.transaction_owner = None;
        }
        Ok(())
    }
}

/// A pooled connection and the signal raised whenever it is left without
/// an open transaction.
#[derive(Debug)]
pub struct ConnectionSlot {
    connection: Mutex<PooledConnection>,
    released: Notify,
}

impl ConnectionSlot {
    fn new(connection: SqliteConnection) -> Self {
        Self {
            connection: Mutex::new(PooledConnection::new(connection)),
            released: Notify::new(),
        }
    }

    pub async fn transaction_open(&self) -> bool {
        self.connection.lock().await.transaction_open()
    }

    /// Locks the connection once no other caller has a transaction open on
    /// it. Tasks sharing a worker thread queue here instead of joining
    /// someone else's transaction.
    async fn acquire(&self, owner: SessionOwner) -> MutexGuard<'_, PooledConnection> {
        loop {
            let released = self.released.notified();
            let pooled = self.connection.lock().await;
            match pooled.transaction_owner {
                Some(holder) if holder != owner => {
                    drop(pooled);
                    released.await;
                }
                _ => return pooled,
            }
        }
    }

    fn finish(&self, pooled: &PooledConnection) {
        if !pooled.transaction_open() {
            self.released.notify_waiters();
        }
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in params {
        query = match value {
            SqlValue::Integer(value) => query.bind(*value),
            SqlValue::Real(value) => query.bind(*value),
            SqlValue::Text(value) => query.bind(value.as_str()),
            SqlValue::Null => query.bind(None::<i64>),
        };
    }
    query
}

async fn run_statement(
    connection: &mut SqliteConnection,
    sql: &str,
    params: &[SqlValue],
    fetch: FetchMode,
) -> Result<QueryOutput, AppError> {
    let query = bind_params(sqlx::query(sql), params);
    let output = match fetch {
        FetchMode::None => {
            let result = query.execute(&mut *connection).await?;
            QueryOutput::Done {
                rows_affected: result.rows_affected(),
            }
        }
        FetchMode::LastInsertId => {
            let result = query.execute(&mut *connection).await?;
            QueryOutput::LastInsertId(result.last_insert_rowid())
        }
        FetchMode::One => QueryOutput::Row(query.fetch_optional(&mut *connection).await?),
        FetchMode::All => QueryOutput::Rows(query.fetch_all(&mut *connection).await?),
    };
    Ok(output)
}

fn validate_database_name(database_name: &str) -> Result<(), AppError> {
    let valid = !database_name.is_empty()
        && database_name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidArgument(format!(
            "database name '{database_name}' must be non-empty [A-Za-z0-9_-]"
        )))
    }
}

/// Hands out one physical connection per (worker thread, logical database).
///
/// The registry lock is only taken to look up or create a handle. Each
/// handle carries its own lock because an async task that obtained it may
/// resume on a different worker thread after an `.await`. An open
/// `commit = false` transaction is tracked per caller in `sessions`, so the
/// caller keeps reaching the same connection until it commits.
#[derive(Debug)]
pub struct StorageManager {
    options: StorageOptions,
    registry: Mutex<HashMap<ThreadId, HashMap<String, ConnectionHandle>>>,
    sessions: parking_lot::Mutex<HashMap<SessionKey, ConnectionHandle>>,
}

impl StorageManager {
    pub fn open(options: StorageOptions) -> Result<Self, AppError> {
        std::fs::create_dir_all(&options.data_dir).map_err(|error| {
            AppError::Configuration(format!(
                "cannot create data directory {}: {error}",
                options.data_dir.display()
            ))
        })?;

        Ok(Self {
            options,
            registry: Mutex::new(HashMap::new()),
            sessions: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.options.data_dir
    }

    pub fn retry_policy(&self) -> BackoffPolicy {
        self.options.retry
    }

    pub async fn get_connection(&self, database_name: &str) -> Result<ConnectionHandle, AppError> {
        validate_database_name(database_name)?;
        let thread_id = std::thread::current().id();

        let mut registry = self.registry.lock().await;
        if let Some(handle) = registry
            .get(&thread_id)
            .and_then(|connections| connections.get(database_name))
        {
            return Ok(Arc::clone(handle));
        }

        let path = database_file(&self.options.data_dir, database_name);
        let options = connect_options(&path, self.options.busy_timeout);
        let connection = self
            .options
            .retry
            .run(|_| {
                let options = options.clone();
                async move { options.connect().await.map_err(AppError::from) }
            })
            .await
            .map_err(|failure| {
                let error = match failure {
                    RetryExhausted::Fatal(error) => error,
                    RetryExhausted::Exhausted { error, .. } => error,
                };
                AppError::Configuration(format!("cannot open {}: {error}", path.display()))
            })?;

        tracing::debug!(?thread_id, database = database_name, "opened storage connection");
        let handle = Arc::new(ConnectionSlot::new(connection));
        registry
            .entry(thread_id)
            .or_default()
            .insert(database_name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// The connection holding the caller's open transaction, else the
    /// calling thread's connection.
    async fn connection_for(
        &self,
        owner: SessionOwner,
        database_name: &str,
    ) -> Result<ConnectionHandle, AppError> {
        let session = self
            .sessions
            .lock()
            .get(&(owner, database_name.to_string()))
            .cloned();
        match session {
            Some(handle) => Ok(handle),
            None => self.get_connection(database_name).await,
        }
    }

    fn track_session(
        &self,
        owner: SessionOwner,
        database_name: &str,
        handle: &ConnectionHandle,
        pooled: &PooledConnection,
    ) {
        let key = (owner, database_name.to_string());
        let mut sessions = self.sessions.lock();
        if pooled.transaction_owner == Some(owner) {
            sessions.insert(key, Arc::clone(handle));
        } else {
            sessions.remove(&key);
        }
    }

    /// Executes one statement on the caller's connection, retrying lock
    /// contention with the manager's backoff policy capped at `max_retries`
    /// attempts.
    pub async fn execute_query(
        &self,
        database_name: &str,
        sql: &str,
        params: &[SqlValue],
        fetch: FetchMode,
        commit: bool,
        max_retries: u32,
    ) -> Result<QueryOutput, AppError> {
        let owner = SessionOwner::current();
        let handle = self.connection_for(owner, database_name).await?;
        let policy = self.options.retry.with_max_attempts(max_retries);

        let result = policy
            .run(|_| {
                let handle = Arc::clone(&handle);
                async move {
                    let mut pooled = handle.acquire(owner).await;
                    let output = pooled.execute(owner, sql, params, fetch, commit).await;
                    self.track_session(owner, database_name, &handle, &pooled);
                    handle.finish(&pooled);
                    output
                }
            })
            .await;

        surface_failure(database_name, result)
    }

    /// `execute_query` with autocommit and the default attempt budget.
    pub async fn execute(
        &self,
        database_name: &str,
        sql: &str,
        params: &[SqlValue],
        fetch: FetchMode,
    ) -> Result<QueryOutput, AppError> {
        let max_retries = self.options.retry.max_attempts;
        self.execute_query(database_name, sql, params, fetch, true, max_retries)
            .await
    }

    pub async fn execute_script(
        &self,
        database_name: &str,
        script: &str,
        max_retries: u32,
    ) -> Result<(), AppError> {
        let owner = SessionOwner::current();
        let handle = self.connection_for(owner, database_name).await?;
        let policy = self.options.retry.with_max_attempts(max_retries);

        let result = policy
            .run(|_| {
                let handle = Arc::clone(&handle);
                async move {
                    let mut pooled = handle.acquire(owner).await;
                    sqlx::raw_sql(script).execute(&mut pooled.connection).await?;
                    Ok(())
                }
            })
            .await;

        surface_failure(database_name, result)
    }

    /// Commits the caller's open transaction, if any.
    pub async fn commit(&self, database_name: &str) -> Result<(), AppError> {
        let owner = SessionOwner::current();
        let handle = self.connection_for(owner, database_name).await?;
        let result = self
            .options
            .retry
            .run(|_| {
                let handle = Arc::clone(&handle);
                async move {
                    let mut pooled = handle.acquire(owner).await;
                    let committed = pooled.commit().await;
                    self.track_session(owner, database_name, &handle, &pooled);
                    handle.finish(&pooled);
                    committed
                }
            })
            .await;

        surface_failure(database_name, result)
    }

    pub async fn table_exists(&self, database_name: &str, table_name: &str) -> Result<bool, AppError> {
        let output = self
            .execute(
                database_name,
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                &[SqlValue::from(table_name)],
                FetchMode::One,
            )
            .await?;
        Ok(output.into_row().is_some())
    }

    pub async fn vacuum(&self, database_name: &str) -> Result<(), AppError> {
        self.execute(database_name, "VACUUM", &[], FetchMode::None)
            .await
            .map(|_| ())
    }

    /// Releases the connection owned by `thread_id` (the calling thread when
    /// `None`). Returns whether a connection was registered.
    pub async fn close_connection(&self, database_name: &str, thread_id: Option<ThreadId>) -> bool {
        let thread_id = thread_id.unwrap_or_else(|| std::thread::current().id());

        let removed = {
            let mut registry = self.registry.lock().await;
            let removed = registry
                .get_mut(&thread_id)
                .and_then(|connections| connections.remove(database_name));
            if registry.get(&thread_id).is_some_and(HashMap::is_empty) {
                registry.remove(&thread_id);
            }
            removed
        };

        match removed {
            Some(handle) => {
                self.sessions
                    .lock()
                    .retain(|_, session| !Arc::ptr_eq(session, &handle));
                close_handle(handle, database_name).await;
                tracing::debug!(?thread_id, database = database_name, "closed storage connection");
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<(ThreadId, String, ConnectionHandle)> = {
            let mut registry = self.registry.lock().await;
            registry
                .drain()
                .flat_map(|(thread_id, connections)| {
                    connections
                        .into_iter()
                        .map(move |(database_name, handle)| (thread_id, database_name, handle))
                })
                .collect()
        };
        self.sessions.lock().clear();

        let closed = drained.len();
        for (thread_id, database_name, handle) in drained {
            close_handle(handle, &database_name).await;
            tracing::debug!(?thread_id, database = %database_name, "closed storage connection");
        }
        tracing::info!(closed, "all storage connections closed");
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.lock().await.values().map(HashMap::len).sum()
    }
}

async fn close_handle(handle: ConnectionHandle, database_name: &str) {
    // A handle still cloned by an in-flight statement closes when that
    // statement drops its reference.
    let Ok(slot) = Arc::try_unwrap(handle) else {
        return;
    };

    let mut pooled = slot.connection.into_inner();
    if let Err(error) = pooled.commit().await {
        tracing::error!(database = database_name, %error, "failed to commit before close");
    }
    if let Err(error) = pooled.connection.close().await {
        tracing::error!(database = database_name, %error, "failed to close storage connection");
    }
}

fn surface_failure<T>(database_name: &str, result: Result<T, RetryExhausted>) -> Result<T, AppError> {
    match result {
        Ok(value) => Ok(value),
        Err(RetryExhausted::Fatal(error)) => {
            tracing::error!(database = database_name, %error, "statement failed");
            Err(error)
        }
        Err(RetryExhausted::Exhausted {
            attempts,
            error: AppError::Sqlx(source),
        }) => Err(AppError::StorageContention {
            database: database_name.to_string(),
            attempts,
            source,
        }),
        Err(RetryExhausted::Exhausted { error, .. }) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{cleanup, unique_data_dir};
    use sqlx::Row;

    const DB: &str = "scratch";

    fn open_manager(label: &str) -> StorageManager {
        StorageManager::open(StorageOptions::new(unique_data_dir(label)))
            .expect("storage manager should open")
    }

    async fn create_items_table(manager: &StorageManager) {
        manager
            .execute(
                DB,
                "CREATE TABLE IF NOT EXISTS items (id INTEGER PRIMARY KEY AUTOINCREMENT, worker INTEGER NOT NULL, seq INTEGER NOT NULL, UNIQUE(worker, seq))",
                &[],
                FetchMode::None,
            )
            .await
            .expect("items table should be created");
    }

    async fn count_items(manager: &StorageManager) -> i64 {
        let row = manager
            .execute(DB, "SELECT COUNT(*) FROM items", &[], FetchMode::One)
            .await
            .expect("count query should succeed")
            .into_row()
            .expect("count returns a row");
        row.get::<i64, _>(0)
    }

    #[tokio::test]
    async fn reuses_connection_for_same_thread_and_database() {
        let manager = open_manager("reuse");

        let first = manager.get_connection(DB).await.expect("first handle");
        let second = manager.get_connection(DB).await.expect("second handle");
        let other = manager
            .get_connection("other_db")
            .await
            .expect("handle for second database");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(manager.connection_count().await, 2);

        drop((first, second, other));
        cleanup(&manager).await;
    }

    #[tokio::test]
    async fn applies_wal_and_foreign_key_pragmas() {
        let manager = open_manager("pragmas");

        let journal_mode: String = manager
            .execute(DB, "PRAGMA journal_mode", &[], FetchMode::One)
            .await
            .expect("journal_mode query")
            .into_row()
            .expect("journal_mode row")
            .get(0);
        let foreign_keys: i64 = manager
            .execute(DB, "PRAGMA foreign_keys", &[], FetchMode::One)
            .await
            .expect("foreign_keys query")
            .into_row()
            .expect("foreign_keys row")
            .get(0);

        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");
        assert_eq!(foreign_keys, 1);
        cleanup(&manager).await;
    }

    #[tokio::test]
    async fn fetch_modes_return_matching_shapes() {
        let manager = open_manager("fetch");
        create_items_table(&manager).await;

        let inserted = manager
            .execute(
                DB,
                "INSERT INTO items (worker, seq) VALUES (?, ?)",
                &[SqlValue::from(1_i64), SqlValue::from(1_i64)],
                FetchMode::LastInsertId,
            )
            .await
            .expect("insert should succeed");
        assert_eq!(inserted.last_insert_id(), Some(1));

        manager
            .execute(
                DB,
                "INSERT INTO items (worker, seq) VALUES (?, ?)",
                &[SqlValue::from(1_i64), SqlValue::from(2_i64)],
                FetchMode::None,
            )
            .await
            .expect("second insert should succeed");

        let rows = manager
            .execute(DB, "SELECT seq FROM items ORDER BY seq", &[], FetchMode::All)
            .await
            .expect("select should succeed")
            .into_rows();
        assert_eq!(rows.len(), 2);

        let missing = manager
            .execute(
                DB,
                "SELECT seq FROM items WHERE worker = ?",
                &[SqlValue::from(99_i64)],
                FetchMode::One,
            )
            .await
            .expect("select should succeed");
        assert!(missing.into_row().is_none());

        assert!(manager.table_exists(DB, "items").await.expect("lookup"));
        assert!(!manager.table_exists(DB, "absent").await.expect("lookup"));
        cleanup(&manager).await;
    }

    #[tokio::test]
    async fn non_contention_errors_are_not_retried() {
        let manager = open_manager("syntax");

        let result = manager
            .execute(DB, "SELEC broken", &[], FetchMode::None)
            .await;

        assert!(matches!(result, Err(AppError::Sqlx(_))));
        cleanup(&manager).await;
    }

    #[tokio::test]
    async fn rejects_database_names_outside_the_file_namespace() {
        let manager = open_manager("names");
        let result = manager.get_connection("../escape").await;
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
        cleanup(&manager).await;
    }

    #[tokio::test]
    async fn surfaces_contention_after_exhausting_retries() {
        let data_dir = unique_data_dir("contention");
        let manager = StorageManager::open(
            StorageOptions::new(&data_dir)
                .with_busy_timeout(Duration::from_millis(10))
                .with_retry(BackoffPolicy::new(
                    Duration::from_millis(1),
                    3,
                    AppError::is_contention,
                )),
        )
        .expect("storage manager should open");
        create_items_table(&manager).await;

        let mut blocker = connect_options(&database_file(&data_dir, DB), Duration::from_millis(10))
            .connect()
            .await
            .expect("blocking connection should open");
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut blocker)
            .await
            .expect("blocker should take the write lock");

        let result = manager
            .execute_query(
                DB,
                "INSERT INTO items (worker, seq) VALUES (?, ?)",
                &[SqlValue::from(1_i64), SqlValue::from(1_i64)],
                FetchMode::None,
                true,
                3,
            )
            .await;

        match result {
            Err(AppError::StorageContention { attempts, database, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(database, DB);
            }
            other => panic!("expected contention failure, got {other:?}"),
        }

        sqlx::query("ROLLBACK")
            .execute(&mut blocker)
            .await
            .expect("blocker should release the lock");
        blocker.close().await.expect("blocker should close");
        cleanup(&manager).await;
    }

    #[tokio::test]
    async fn uncommitted_statements_stay_in_an_open_transaction() {
        let manager = open_manager("txn");
        create_items_table(&manager).await;

        manager
            .execute_query(
                DB,
                "INSERT INTO items (worker, seq) VALUES (?, ?)",
                &[SqlValue::from(2_i64), SqlValue::from(1_i64)],
                FetchMode::None,
                false,
                5,
            )
            .await
            .expect("insert inside transaction");

        let handle = manager.get_connection(DB).await.expect("handle");
        assert!(handle.transaction_open().await);
        drop(handle);

        manager.commit(DB).await.expect("commit should succeed");
        let handle = manager.get_connection(DB).await.expect("handle");
        assert!(!handle.transaction_open().await);
        drop(handle);

        assert_eq!(count_items(&manager).await, 1);
        cleanup(&manager).await;
    }

    async fn committed_items(data_dir: &Path) -> i64 {
        let mut reader = connect_options(&database_file(data_dir, DB), Duration::from_millis(100))
            .connect()
            .await
            .expect("reader connection should open");
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM items")
            .fetch_one(&mut reader)
            .await
            .expect("reader count");
        reader.close().await.expect("reader should close");
        count
    }

    #[tokio::test]
    async fn open_transaction_stays_with_the_task_that_began_it() {
        let manager = Arc::new(open_manager("txn-owner"));
        create_items_table(&manager).await;
        let (began_tx, began_rx) = tokio::sync::oneshot::channel::<()>();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

        let owner = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .execute_query(
                        DB,
                        "INSERT INTO items (worker, seq) VALUES (?, ?)",
                        &[SqlValue::from(1_i64), SqlValue::from(1_i64)],
                        FetchMode::None,
                        false,
                        5,
                    )
                    .await
                    .expect("insert inside transaction");
                began_tx.send(()).expect("test should be waiting");
                finish_rx.await.expect("test should release the owner");
                manager.commit(DB).await.expect("owner commit");
            })
        };
        began_rx.await.expect("owner should begin");

        // Same runtime thread, so the same pooled connection.
        let bystander = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .execute(
                        DB,
                        "INSERT INTO items (worker, seq) VALUES (?, ?)",
                        &[SqlValue::from(2_i64), SqlValue::from(1_i64)],
                        FetchMode::None,
                    )
                    .await
                    .expect("autocommit insert");
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!bystander.is_finished());
        assert_eq!(committed_items(manager.data_dir()).await, 0);

        finish_tx.send(()).expect("owner should be waiting");
        owner.await.expect("owner task");
        bystander.await.expect("bystander task");
        assert_eq!(committed_items(manager.data_dir()).await, 2);
        cleanup(&manager).await;
    }

    #[tokio::test]
    async fn closing_is_idempotent() {
        let manager = open_manager("close");
        manager.get_connection(DB).await.expect("handle");

        assert!(manager.close_connection(DB, None).await);
        assert!(!manager.close_connection(DB, None).await);
        assert_eq!(manager.connection_count().await, 0);

        manager.get_connection(DB).await.expect("reopened handle");
        manager.close_all().await;
        manager.close_all().await;
        assert_eq!(manager.connection_count().await, 0);
        cleanup(&manager).await;
    }

    #[test]
    fn parallel_threads_write_disjoint_rows_without_loss() {
        const THREADS: i64 = 4;
        const ROWS_PER_THREAD: i64 = 100;

        let setup_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let manager = open_manager("threads");
        setup_runtime.block_on(create_items_table(&manager));

        std::thread::scope(|scope| {
            for worker in 0..THREADS {
                let manager = &manager;
                scope.spawn(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("worker runtime");
                    runtime.block_on(async move {
                        for seq in 0..ROWS_PER_THREAD {
                            manager
                                .execute(
                                    DB,
                                    "INSERT INTO items (worker, seq) VALUES (?, ?) ON CONFLICT(worker, seq) DO NOTHING",
                                    &[SqlValue::from(worker), SqlValue::from(seq)],
                                    FetchMode::None,
                                )
                                .await
                                .expect("insert should survive contention");
                        }
                    });
                });
            }
        });

        setup_runtime.block_on(async {
            assert_eq!(count_items(&manager).await, THREADS * ROWS_PER_THREAD);
            assert_eq!(manager.connection_count().await, THREADS as usize + 1);
            cleanup(&manager).await;
        });
    }
}
