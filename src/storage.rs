//! Fragment storage.
//!
//! Fragments live in databases on storage servers (DBMS instances). Workers hold one connection
//! per server, select a database on it and run transform requests that read source fragments,
//! possibly from other servers, and write one target fragment.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::compression;
use crate::error::CubeError;
use crate::kernels::{Primitive, RawRow};
use crate::models::{DType, DbInstance, DbmsId, DbmsInstance};
use crate::subset::Subset;

/// Address of a stored fragment
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct FragmentLocator {
    pub dbms_id: DbmsId,
    pub database: String,
    pub fragment: String,
}

/// Request to fill a target fragment from source fragments
#[derive(Clone, Debug, PartialEq)]
pub struct TransformRequest {
    pub sources: Vec<FragmentLocator>,
    /// Target fragment in the connection's current database
    pub target: String,
    pub primitive: String,
    pub args: Vec<String>,
    /// Subset expression over row keys applied to the sources
    pub row_filter: Option<String>,
    pub measure_type: DType,
    pub compressed: bool,
}

/// What a transform wrote
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FragmentStats {
    pub rows: u64,
    /// First row key, zero when no row was written
    pub key_start: u64,
    pub key_end: u64,
    /// Stored size in bytes
    pub bytes: u64,
}

/// Opens connections to storage servers.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn connect(&self, dbms: &DbmsInstance) -> Result<Box<dyn StorageConnection>, CubeError>;
}

/// A connection to one storage server.
#[async_trait]
pub trait StorageConnection: Send {
    fn dbms_id(&self) -> DbmsId;

    /// Select the database subsequent calls operate on, creating it if needed.
    async fn use_database(&mut self, db: &DbInstance) -> Result<(), CubeError>;

    async fn create_empty_fragment(&mut self, name: &str) -> Result<(), CubeError>;

    async fn run_transform(&mut self, request: &TransformRequest)
        -> Result<FragmentStats, CubeError>;

    /// Append the rows of a source fragment to a fragment of the current database.
    async fn append_fragment(
        &mut self,
        source: &FragmentLocator,
        target: &str,
    ) -> Result<FragmentStats, CubeError>;

    async fn fragment_byte_size(&mut self, name: &str) -> Result<u64, CubeError>;

    /// Drop a fragment of the current database. Dropping a missing fragment is not an error.
    async fn delete_fragment(&mut self, name: &str) -> Result<(), CubeError>;
}

#[derive(Clone, Debug)]
struct StoredFragment {
    measure_type: DType,
    compressed: bool,
    rows: Vec<RawRow>,
}

impl StoredFragment {
    fn empty() -> Self {
        StoredFragment {
            measure_type: DType::Double,
            compressed: false,
            rows: Vec::new(),
        }
    }

    fn byte_size(&self) -> u64 {
        self.rows
            .iter()
            .map(|row| (std::mem::size_of::<u64>() + row.measure.len()) as u64)
            .sum()
    }

    fn stats(&self) -> FragmentStats {
        FragmentStats {
            rows: self.rows.len() as u64,
            key_start: self.rows.first().map_or(0, |row| row.key),
            key_end: self.rows.last().map_or(0, |row| row.key),
            bytes: self.byte_size(),
        }
    }

    /// Rows with uncompressed measures.
    fn plain_rows(&self) -> Result<Vec<RawRow>, CubeError> {
        if !self.compressed {
            return Ok(self.rows.clone());
        }
        self.rows
            .iter()
            .map(|row| {
                Ok(RawRow {
                    key: row.key,
                    measure: compression::decompress(&row.measure)?,
                })
            })
            .collect()
    }
}

fn encode_rows(rows: Vec<RawRow>, compressed: bool) -> Result<Vec<RawRow>, CubeError> {
    if !compressed {
        return Ok(rows);
    }
    rows.into_iter()
        .map(|row| {
            Ok(RawRow {
                key: row.key,
                measure: compression::compress(&row.measure)?,
            })
        })
        .collect()
}

type FragmentKey = (DbmsId, String, String);

#[derive(Debug, Default)]
struct StorageState {
    databases: HashSet<(DbmsId, String)>,
    fragments: HashMap<FragmentKey, StoredFragment>,
    offline: HashSet<DbmsId>,
}

/// In-process fragment storage shared by every simulated storage server.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<StorageState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connections to a server fail.
    pub async fn take_offline(&self, dbms_id: DbmsId) {
        self.state.write().await.offline.insert(dbms_id);
    }

    pub async fn fragment_count(&self) -> usize {
        self.state.read().await.fragments.len()
    }

    /// Measure type and uncompressed rows of a fragment.
    pub async fn read_fragment(
        &self,
        locator: &FragmentLocator,
    ) -> Result<(DType, Vec<(u64, Bytes)>), CubeError> {
        let state = self.state.read().await;
        let fragment = lookup(&state, locator)?;
        let rows = fragment
            .plain_rows()?
            .into_iter()
            .map(|row| (row.key, row.measure))
            .collect();
        Ok((fragment.measure_type, rows))
    }
}

fn lookup<'a>(
    state: &'a StorageState,
    locator: &FragmentLocator,
) -> Result<&'a StoredFragment, CubeError> {
    state
        .fragments
        .get(&(
            locator.dbms_id,
            locator.database.clone(),
            locator.fragment.clone(),
        ))
        .ok_or_else(|| {
            CubeError::Storage(format!(
                "fragment {}.{} not found on dbms {}",
                locator.database, locator.fragment, locator.dbms_id
            ))
        })
}

#[async_trait]
impl StorageDriver for MemoryStorage {
    async fn connect(&self, dbms: &DbmsInstance) -> Result<Box<dyn StorageConnection>, CubeError> {
        if self.state.read().await.offline.contains(&dbms.id) {
            return Err(CubeError::Storage(format!(
                "cannot connect to {}:{}",
                dbms.host, dbms.port
            )));
        }
        debug!(dbms = dbms.id, host = %dbms.host, "connected to storage server");
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            dbms_id: dbms.id,
            database: None,
        }))
    }
}

struct MemoryConnection {
    state: Arc<RwLock<StorageState>>,
    dbms_id: DbmsId,
    database: Option<String>,
}

impl MemoryConnection {
    fn key(&self, name: &str) -> Result<FragmentKey, CubeError> {
        let database = self
            .database
            .clone()
            .ok_or_else(|| CubeError::Storage("no database selected".to_string()))?;
        Ok((self.dbms_id, database, name.to_string()))
    }
}

#[async_trait]
impl StorageConnection for MemoryConnection {
    fn dbms_id(&self) -> DbmsId {
        self.dbms_id
    }

    async fn use_database(&mut self, db: &DbInstance) -> Result<(), CubeError> {
        if db.dbms_id != self.dbms_id {
            return Err(CubeError::Storage(format!(
                "database {} lives on dbms {}, not {}",
                db.name, db.dbms_id, self.dbms_id
            )));
        }
        self.state
            .write()
            .await
            .databases
            .insert((self.dbms_id, db.name.clone()));
        self.database = Some(db.name.clone());
        Ok(())
    }

    async fn create_empty_fragment(&mut self, name: &str) -> Result<(), CubeError> {
        let key = self.key(name)?;
        let mut state = self.state.write().await;
        if state.fragments.contains_key(&key) {
            return Err(CubeError::Storage(format!("fragment {name} already exists")));
        }
        state.fragments.insert(key, StoredFragment::empty());
        Ok(())
    }

    async fn run_transform(
        &mut self,
        request: &TransformRequest,
    ) -> Result<FragmentStats, CubeError> {
        let key = self.key(&request.target)?;
        let (measure_type, mut sources) = {
            let state = self.state.read().await;
            let mut measure_type = request.measure_type;
            let mut sources = Vec::with_capacity(request.sources.len());
            for (position, locator) in request.sources.iter().enumerate() {
                let fragment = lookup(&state, locator)?;
                if position == 0 {
                    measure_type = fragment.measure_type;
                }
                sources.push(fragment.plain_rows()?);
            }
            (measure_type, sources)
        };
        if let Some(filter) = &request.row_filter {
            let filter = Subset::parse(filter, 0)?;
            for rows in sources.iter_mut() {
                rows.retain(|row| filter.contains(row.key));
            }
        }

        let primitive = Primitive::parse(&request.primitive, &request.args)?;
        let output = primitive.apply(measure_type, &sources)?;
        let fragment = StoredFragment {
            measure_type: output.measure_type,
            compressed: request.compressed,
            rows: encode_rows(output.rows, request.compressed)?,
        };
        let stats = fragment.stats();

        let mut state = self.state.write().await;
        match state.fragments.get_mut(&key) {
            Some(target) => *target = fragment,
            None => {
                return Err(CubeError::Storage(format!(
                    "target fragment {} does not exist",
                    request.target
                )))
            }
        }
        Ok(stats)
    }

    async fn append_fragment(
        &mut self,
        source: &FragmentLocator,
        target: &str,
    ) -> Result<FragmentStats, CubeError> {
        let key = self.key(target)?;
        let mut state = self.state.write().await;
        let rows = lookup(&state, source)?.plain_rows()?;
        let target_fragment = state.fragments.get_mut(&key).ok_or_else(|| {
            CubeError::Storage(format!("target fragment {target} does not exist"))
        })?;
        let rows = encode_rows(rows, target_fragment.compressed)?;
        target_fragment.rows.extend(rows);
        target_fragment.rows.sort_by_key(|row| row.key);
        Ok(target_fragment.stats())
    }

    async fn fragment_byte_size(&mut self, name: &str) -> Result<u64, CubeError> {
        let key = self.key(name)?;
        let state = self.state.read().await;
        state
            .fragments
            .get(&key)
            .map(StoredFragment::byte_size)
            .ok_or_else(|| CubeError::Storage(format!("fragment {name} not found")))
    }

    async fn delete_fragment(&mut self, name: &str) -> Result<(), CubeError> {
        let key = self.key(name)?;
        self.state.write().await.fragments.remove(&key);
        Ok(())
    }
}
