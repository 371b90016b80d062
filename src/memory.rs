//! In-process stand-ins for the warehouse and object storage.
//!
//! `MemoryWarehouse` keeps tables as JSON rows and interprets [`Statement`]s
//! directly; `INSERT ... SELECT` bodies are answered by transforms registered
//! per target table. `COPY` reads from an attached [`MemoryObjectStore`].
//! Both support fault injection so retry and failure paths can be exercised.

use crate::connector::{Rows, WarehousePool, WarehouseSession};
use crate::context::CredentialsRef;
use crate::error::WarehouseError;
use crate::statement::Statement;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;
use walkdir::WalkDir;

pub type Row = Map<String, Value>;
pub type Tables = BTreeMap<String, Vec<Row>>;
type Transform = Arc<dyn Fn(&Tables) -> Vec<Row> + Send + Sync>;

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<Row>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, uri: impl Into<String>, rows: Vec<Row>) {
        self.lock().insert(uri.into(), rows);
    }

    /// Rows of every object whose URI starts with `prefix`, in key order.
    pub fn list(&self, prefix: &str) -> Option<Vec<Row>> {
        let objects = self.lock();
        let mut matched = false;
        let mut rows = Vec::new();
        for (_, object) in objects.iter().filter(|(uri, _)| uri.starts_with(prefix)) {
            matched = true;
            rows.extend(object.iter().cloned());
        }
        matched.then_some(rows)
    }

    /// Mirrors a local directory of `.json` files into `s3://<bucket>/...`.
    /// Files may hold one object, an array of objects, or JSON lines.
    pub fn load_dir(&self, bucket: &str, dir: &Path) -> io::Result<usize> {
        let mut loaded = 0;
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some("json")
            {
                continue;
            }

            let relative = path
                .strip_prefix(dir)
                .map_err(io::Error::other)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let rows = parse_rows(&std::fs::read_to_string(path)?)?;
            debug!(bucket, key = %relative, rows = rows.len(), "loaded fixture object");
            self.put(format!("s3://{bucket}/{relative}"), rows);
            loaded += 1;
        }
        Ok(loaded)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<Row>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_rows(body: &str) -> io::Result<Vec<Row>> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(row)) => Ok(vec![row]),
        Ok(Value::Array(items)) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect()),
        _ => body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<Row>(line).map_err(io::Error::from))
            .collect(),
    }
}

#[derive(Default)]
struct Inner {
    tables: Tables,
    transforms: HashMap<String, Transform>,
    failures: HashMap<String, u32>,
    empty_counts: HashSet<String>,
    executed: Vec<Statement>,
    latency: Duration,
    object_store: Option<MemoryObjectStore>,
}

#[derive(Clone, Default)]
pub struct MemoryWarehouse {
    inner: Arc<Mutex<Inner>>,
    open_sessions: Arc<AtomicUsize>,
    peak_sessions: Arc<AtomicUsize>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object_store(self, store: MemoryObjectStore) -> Self {
        self.lock().object_store = Some(store);
        self
    }

    /// Delay applied to every statement, to make concurrent attempts overlap.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn create_table(&self, table: &str) {
        self.lock().tables.entry(table.to_string()).or_default();
    }

    pub fn insert_rows(&self, table: &str, rows: Vec<Row>) {
        self.lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.lock().tables.get(table).map(Vec::len)
    }

    /// Answers `INSERT INTO <table> <select>` with the rows `transform` returns.
    pub fn register_transform<F>(&self, table: &str, transform: F)
    where
        F: Fn(&Tables) -> Vec<Row> + Send + Sync + 'static,
    {
        self.lock()
            .transforms
            .insert(table.to_string(), Arc::new(transform));
    }

    /// The next `times` statements touching `table` fail with a connection error.
    pub fn fail_next(&self, table: &str, times: u32) {
        *self.lock().failures.entry(table.to_string()).or_default() += times;
    }

    /// Row-count queries against `table` return an empty result set.
    pub fn return_no_rows_for_count(&self, table: &str) {
        self.lock().empty_counts.insert(table.to_string());
    }

    pub fn executed(&self) -> Vec<Statement> {
        self.lock().executed.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn peak_sessions(&self) -> usize {
        self.peak_sessions.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, statement: &Statement) -> Result<Rows, WarehouseError> {
        let mut inner = self.lock();
        let table = statement.table().to_string();

        if let Some(remaining) = inner.failures.get_mut(&table) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(WarehouseError::Connection(format!(
                    "injected failure while executing against {table}"
                )));
            }
        }
        inner.executed.push(statement.clone());

        let missing = || WarehouseError::Syntax(format!("relation \"{table}\" does not exist"));
        match statement {
            Statement::Truncate { .. } => {
                inner.tables.get_mut(&table).ok_or_else(missing)?.clear();
                Ok(Vec::new())
            }
            Statement::CountRows { .. } => {
                let count = inner.tables.get(&table).ok_or_else(missing)?.len();
                if inner.empty_counts.contains(&table) {
                    return Ok(Vec::new());
                }
                Ok(vec![vec![Value::from(count as u64)]])
            }
            Statement::InsertSelect { .. } => {
                let transform = inner.transforms.get(&table).cloned().ok_or_else(|| {
                    WarehouseError::Syntax(format!("no transform registered for {table}"))
                })?;
                if !inner.tables.contains_key(&table) {
                    return Err(missing());
                }
                let rows = transform(&inner.tables);
                inner.tables.get_mut(&table).ok_or_else(missing)?.extend(rows);
                Ok(Vec::new())
            }
            Statement::Copy { source_uri, .. } => {
                let store = inner.object_store.clone().ok_or_else(|| {
                    WarehouseError::Connection("no object store attached".to_string())
                })?;
                let rows = store.list(source_uri).ok_or_else(|| {
                    WarehouseError::Syntax(format!("S3 prefix {source_uri} does not exist"))
                })?;
                inner.tables.get_mut(&table).ok_or_else(missing)?.extend(rows);
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl WarehousePool for MemoryWarehouse {
    async fn acquire(
        &self,
        _credentials: &CredentialsRef,
    ) -> Result<Box<dyn WarehouseSession>, WarehouseError> {
        let open = self.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_sessions.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            warehouse: self.clone(),
        }))
    }
}

struct MemorySession {
    warehouse: MemoryWarehouse,
}

#[async_trait]
impl WarehouseSession for MemorySession {
    async fn execute(&mut self, statement: &Statement) -> Result<Rows, WarehouseError> {
        let latency = self.warehouse.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.warehouse.apply(statement)
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.warehouse.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
