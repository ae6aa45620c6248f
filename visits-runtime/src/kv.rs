use {
    std::{
        sync::{Arc, Mutex, atomic::{AtomicU8, Ordering}},
        collections::HashMap,
        path::Path,
        time::Duration,
    },
    thiserror::Error,
    rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, types::Value},
};

/// Key-value table holding unsigned counters.
///
/// `increment_guarded` is the only way the counter handler mutates a record. Implementations must
/// apply it as one indivisible operation: concurrent calls never lose an update.
pub trait KVStorage {
    fn get(&self, key: &[u8]) -> Result<Option<u64>, StorageError>;
    fn set(&self, key: &[u8], value: u64) -> Result<(), StorageError>;

    /// Adds `delta` to the value stored under `key`, creating the record with `delta` if it
    /// does not exist yet. Returns the value after the update.
    fn increment(&self, key: &[u8], delta: u64) -> Result<u64, StorageError> {
        self.increment_guarded(key, delta, &CommitGuard::new())
    }

    /// Same as `increment`, but the update is made durable only if `guard.begin_commit()`
    /// succeeds. A cancelled guard leaves the stored value untouched and returns
    /// `StorageError::Cancelled`.
    fn increment_guarded(&self, key: &[u8], delta: u64, guard: &CommitGuard) -> Result<u64, StorageError>;
}

const GUARD_PENDING: u8 = 0;
const GUARD_COMMITTING: u8 = 1;
const GUARD_CANCELLED: u8 = 2;

/// Shared between a caller waiting for an update and the storage applying it. Exactly one of
/// `begin_commit` and `cancel` wins.
#[derive(Clone, Debug)]
pub struct CommitGuard {
    state: Arc<AtomicU8>,
}

impl CommitGuard {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(GUARD_PENDING)),
        }
    }

    /// Called by storage right before the update becomes durable. Returns `false` if the caller
    /// has given up on it already.
    pub fn begin_commit(&self) -> bool {
        self.state.compare_exchange(GUARD_PENDING, GUARD_COMMITTING, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Returns `false` if the storage is already committing and the update can no longer be
    /// withdrawn.
    pub fn cancel(&self) -> bool {
        match self.state.compare_exchange(GUARD_PENDING, GUARD_CANCELLED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(state) => state == GUARD_CANCELLED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == GUARD_CANCELLED
    }
}

impl Default for CommitGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum StorageError {
    /// Storage backend cannot be reached or failed to execute the operation.
    #[error("storage unavailable: {description}")]
    Unavailable {
        description: String,
    },

    /// Storage backend is busy serving other writers and gave up waiting.
    #[error("storage throttled: {description}")]
    Throttled {
        description: String,
    },

    /// Stored value (or the result of the operation) is not a non-negative integer.
    #[error("malformed value in storage: {description}")]
    MalformedValue {
        description: String,
    },

    /// Key used in this operation violates one of constraints set by this storage backend.
    #[error("key used in this operation violates one of constraints set by this storage backend: {description}")]
    KeyConstraintError {
        description: String,
    },

    /// Caller cancelled the operation before it was applied. Nothing was written.
    #[error("operation cancelled before commit")]
    Cancelled,
}

fn cancelled(guard: &CommitGuard) -> Result<(), StorageError> {
    if guard.is_cancelled() {
        return Err(StorageError::Cancelled);
    }
    Ok(())
}

fn check_key(key: &[u8]) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::KeyConstraintError { description: "key should not be empty".to_owned() });
    }
    Ok(())
}

#[derive(Clone)]
pub struct SqliteStorage {
    connection: Arc<Mutex<Connection>>,
}

#[derive(Error, Debug)]
pub enum SqliteStorageConnectionError {
    #[error("failed to open connection: {0:?}")]
    ConnectionOpenError(rusqlite::Error),

    #[error("failed to init database: {0:?}")]
    DatabaseInitError(rusqlite::Error),
}

impl SqliteStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SqliteStorageConnectionError> {
        Self::from_connection(
            Connection::open(path)
                .map_err(|err| SqliteStorageConnectionError::ConnectionOpenError(err))?
        )
    }

    /// Opens the database with a busy timeout: how long a writer waits for a lock held by another
    /// connection to the same file before the operation fails as throttled.
    pub fn new_with_busy_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, SqliteStorageConnectionError> {
        let connection = Connection::open(path)
            .map_err(|err| SqliteStorageConnectionError::ConnectionOpenError(err))?;
        connection.busy_timeout(timeout)
            .map_err(|err| SqliteStorageConnectionError::DatabaseInitError(err))?;
        Self::from_connection(connection)
    }

    pub fn in_memory() -> Result<Self, SqliteStorageConnectionError> {
        Self::from_connection(
            Connection::open_in_memory()
                .map_err(|err| SqliteStorageConnectionError::ConnectionOpenError(err))?
        )
    }

    fn from_connection(connection: Connection) -> Result<Self, SqliteStorageConnectionError> {
        connection.execute("create table if not exists counters (key blob primary key, value integer not null)", ())
            .map_err(|err| SqliteStorageConnectionError::DatabaseInitError(err))?;
        Ok(Self { connection: Arc::new(Mutex::new(connection)) })
    }
}

fn map_sqlite_error(err: rusqlite::Error, action: &str) -> StorageError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StorageError::Throttled {
            description: format!("database is busy, failed to {action}: {err:?}"),
        },
        _ => StorageError::Unavailable {
            description: format!("failed to {action}: {err:?}"),
        },
    }
}

fn decode_sqlite_value(value: Value) -> Result<u64, StorageError> {
    match value {
        Value::Integer(v) => u64::try_from(v)
            .map_err(|_err| StorageError::MalformedValue { description: format!("expected non-negative integer, got: {v}") }),
        other => Err(StorageError::MalformedValue { description: format!("expected integer, got: {other:?}") }),
    }
}

impl KVStorage for SqliteStorage {
    fn get(&self, key: &[u8]) -> Result<Option<u64>, StorageError> {
        check_key(key)?;
        let connection = self.connection.lock()
            .map_err(|err| StorageError::Unavailable { description: format!("failed to acquire sqlite connection: {err:?}") })?;
        let value = connection.query_row("select value from counters where key = ?1", [key], |row| row.get::<_, Value>(0))
            .optional()
            .map_err(|err| map_sqlite_error(err, "read counter"))?;

        value.map(decode_sqlite_value).transpose()
    }

    fn set(&self, key: &[u8], value: u64) -> Result<(), StorageError> {
        check_key(key)?;
        let value = i64::try_from(value)
            .map_err(|_err| StorageError::MalformedValue { description: format!("value does not fit into sqlite integer: {value}") })?;
        let connection = self.connection.lock()
            .map_err(|err| StorageError::Unavailable { description: format!("failed to acquire sqlite connection: {err:?}") })?;
        connection.execute("insert or replace into counters (key, value) values (?1, ?2)", (key, value))
            .map_err(|err| map_sqlite_error(err, "write counter"))
            .map(|_| ())
    }

    fn increment_guarded(&self, key: &[u8], delta: u64, guard: &CommitGuard) -> Result<u64, StorageError> {
        check_key(key)?;
        let delta = i64::try_from(delta)
            .map_err(|_err| StorageError::MalformedValue { description: format!("delta does not fit into sqlite integer: {delta}") })?;
        let mut connection = self.connection.lock()
            .map_err(|err| StorageError::Unavailable { description: format!("failed to acquire sqlite connection: {err:?}") })?;
        cancelled(guard)?;

        // the upsert only fires for integer values that have room for delta. For anything else no
        // row is returned and the transaction is dropped without changes.
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| map_sqlite_error(err, "begin transaction"))?;
        let value = transaction.query_row(
            "insert into counters (key, value) values (?1, ?2)
                on conflict(key) do update set value = value + excluded.value
                where typeof(value) = 'integer' and value >= 0 and value <= 9223372036854775807 - excluded.value
                returning value",
            (key, delta),
            |row| row.get::<_, Value>(0)
        )
            .optional()
            .map_err(|err| map_sqlite_error(err, "increment counter"))?;

        let value = match value {
            Some(v) => decode_sqlite_value(v)?,
            None => return Err(StorageError::MalformedValue {
                description: "stored value is not an integer or has no room for increment".to_owned(),
            }),
        };

        // dropping the transaction rolls the upsert back
        if !guard.begin_commit() {
            return Err(StorageError::Cancelled);
        }
        transaction.commit()
            .map_err(|err| map_sqlite_error(err, "commit increment"))?;

        Ok(value)
    }
}

/// Counters kept in process memory. Lost on restart.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    values: Arc<Mutex<HashMap<Vec<u8>, u64>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KVStorage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<u64>, StorageError> {
        check_key(key)?;
        let values = self.values.lock()
            .map_err(|err| StorageError::Unavailable { description: format!("failed to lock memory storage: {err:?}") })?;
        Ok(values.get(key).copied())
    }

    fn set(&self, key: &[u8], value: u64) -> Result<(), StorageError> {
        check_key(key)?;
        let mut values = self.values.lock()
            .map_err(|err| StorageError::Unavailable { description: format!("failed to lock memory storage: {err:?}") })?;
        values.insert(key.to_vec(), value);
        Ok(())
    }

    fn increment_guarded(&self, key: &[u8], delta: u64, guard: &CommitGuard) -> Result<u64, StorageError> {
        check_key(key)?;
        let mut values = self.values.lock()
            .map_err(|err| StorageError::Unavailable { description: format!("failed to lock memory storage: {err:?}") })?;
        let current = values.get(key).copied().unwrap_or(0);
        let updated = current.checked_add(delta)
            .ok_or_else(|| StorageError::MalformedValue { description: format!("counter overflow: {current} + {delta}") })?;
        if !guard.begin_commit() {
            return Err(StorageError::Cancelled);
        }
        values.insert(key.to_vec(), updated);
        Ok(updated)
    }
}

/// Prefixes every key with a table name, so several logical tables can share one backend.
pub struct NamespacedStorage<T> {
    namespace: Vec<u8>,
    inner: T,
}

impl<T> NamespacedStorage<T> {
    pub fn new(namespace: impl Into<Vec<u8>>, inner: T) -> Self {
        Self {
            namespace: namespace.into(),
            inner,
        }
    }

    fn namespaced_key(&self, key: &[u8]) -> Vec<u8> {
        let mut namespaced_key = Vec::with_capacity(self.namespace.len() + key.len());
        namespaced_key.extend_from_slice(&self.namespace);
        namespaced_key.extend_from_slice(key);
        namespaced_key
    }
}

impl<T: KVStorage> KVStorage for NamespacedStorage<T> {
    fn get(&self, key: &[u8]) -> Result<Option<u64>, StorageError> {
        check_key(key)?;
        self.inner.get(&self.namespaced_key(key))
    }

    fn set(&self, key: &[u8], value: u64) -> Result<(), StorageError> {
        check_key(key)?;
        self.inner.set(&self.namespaced_key(key), value)
    }

    fn increment_guarded(&self, key: &[u8], delta: u64, guard: &CommitGuard) -> Result<u64, StorageError> {
        check_key(key)?;
        self.inner.increment_guarded(&self.namespaced_key(key), delta, guard)
    }
}

impl<T: Clone> Clone for NamespacedStorage<T> {
    fn clone(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            inner: self.inner.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BoxedStorage {
    inner: Arc<Box<dyn KVStorage + Send + Sync>>,
}

impl BoxedStorage {
    pub fn new<T: KVStorage + Send + Sync + 'static>(inner: T) -> Self {
        Self {
            inner: Arc::new(Box::new(inner)),
        }
    }
}

impl KVStorage for BoxedStorage {
    fn get(&self, key: &[u8]) -> Result<Option<u64>, StorageError> {
        self.inner.get(key)
    }

    fn set(&self, key: &[u8], value: u64) -> Result<(), StorageError> {
        self.inner.set(key, value)
    }

    fn increment_guarded(&self, key: &[u8], delta: u64, guard: &CommitGuard) -> Result<u64, StorageError> {
        self.inner.increment_guarded(key, delta, guard)
    }
}

pub trait WithKey: Sized {
    fn with_key(self, key: &[u8], value: u64) -> Result<Self, StorageError>;
}

impl<S: KVStorage> WithKey for S {
    fn with_key(self, key: &[u8], value: u64) -> Result<Self, StorageError> {
        self.set(key, value)?;
        Ok(self)
    }
}
