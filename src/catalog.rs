//! Metadata catalog of containers, datacubes, storage placement and task history.

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::error::CubeError;
use crate::fragment_ids::FragmentIds;
use crate::models::{
    Container, ContainerId, CubeLayout, Datacube, DatacubeId, DbId, DbInstance, DbmsId,
    DbmsInstance, Dimension, FolderId, FragmentId, FragmentRef, NewDatacube, NewFragment, Pid,
    TaskRecord,
};

/// Catalog operations used by the operator engine.
///
/// Only the rank 0 worker mutates datacube rows; every worker inserts and deletes the fragment
/// rows it produces.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Resolve a PID to its datacube, checking that it belongs to the named container.
    async fn resolve_pid(&self, pid: &Pid) -> Result<Datacube, CubeError>;

    async fn container(&self, id: ContainerId) -> Result<Container, CubeError>;

    /// Whether a session may access a folder.
    async fn check_permission(
        &self,
        folder_id: FolderId,
        session: Option<&str>,
    ) -> Result<bool, CubeError>;

    async fn datacube(&self, id: DatacubeId) -> Result<Datacube, CubeError>;

    async fn create_datacube(&self, cube: NewDatacube) -> Result<DatacubeId, CubeError>;

    async fn insert_dimension_instance(
        &self,
        cube: DatacubeId,
        dimension: Dimension,
    ) -> Result<(), CubeError>;

    async fn record_task(&self, task: TaskRecord) -> Result<(), CubeError>;

    /// Delete a datacube with its dimensions, fragments, task rows and owned databases.
    async fn delete_datacube(&self, id: DatacubeId) -> Result<(), CubeError>;

    async fn update_datacube_size(&self, id: DatacubeId, bytes: u64) -> Result<(), CubeError>;

    async fn dbms_instances(&self) -> Result<Vec<DbmsInstance>, CubeError>;

    async fn create_db_instance(
        &self,
        dbms_id: DbmsId,
        name: &str,
        owner: DatacubeId,
    ) -> Result<DbInstance, CubeError>;

    /// Placement of the fragments of a datacube whose relative index is in `ids`.
    async fn fragment_layout(
        &self,
        cube: DatacubeId,
        ids: &FragmentIds,
    ) -> Result<CubeLayout, CubeError>;

    async fn insert_fragment(&self, fragment: NewFragment) -> Result<FragmentId, CubeError>;

    async fn delete_fragment(&self, id: FragmentId) -> Result<(), CubeError>;
}

#[derive(Debug, Default)]
struct CatalogState {
    next_id: u64,
    containers: HashMap<ContainerId, Container>,
    /// Folders restricted to a set of sessions. Other folders are open to everyone.
    folder_sessions: HashMap<FolderId, HashSet<String>>,
    datacubes: HashMap<DatacubeId, Datacube>,
    dbms: HashMap<DbmsId, DbmsInstance>,
    dbs: HashMap<DbId, DbInstance>,
    fragments: HashMap<FragmentId, FragmentRef>,
    tasks: Vec<TaskRecord>,
}

impl CatalogState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn datacube_mut(&mut self, id: DatacubeId) -> Result<&mut Datacube, CubeError> {
        self.datacubes
            .get_mut(&id)
            .ok_or_else(|| CubeError::NotFound(format!("datacube {id}")))
    }
}

/// In-process catalog. A read-write lock synchronises access from concurrent workers.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a storage server.
    pub async fn add_dbms(&self, host: &str, port: u16) -> DbmsInstance {
        let mut state = self.state.write().await;
        let dbms = DbmsInstance {
            id: state.next_id(),
            host: host.to_string(),
            port,
        };
        state.dbms.insert(dbms.id, dbms.clone());
        dbms
    }

    pub async fn add_container(&self, name: &str, folder_id: FolderId) -> Container {
        let mut state = self.state.write().await;
        let container = Container {
            id: state.next_id(),
            folder_id,
            name: name.to_string(),
        };
        state.containers.insert(container.id, container.clone());
        container
    }

    /// Restrict a folder to the given sessions.
    pub async fn restrict_folder(&self, folder_id: FolderId, sessions: &[&str]) {
        let mut state = self.state.write().await;
        state.folder_sessions.insert(
            folder_id,
            sessions.iter().map(|session| session.to_string()).collect(),
        );
    }

    pub async fn datacube_count(&self) -> usize {
        self.state.read().await.datacubes.len()
    }

    pub async fn fragment_count(&self) -> usize {
        self.state.read().await.fragments.len()
    }

    pub async fn db_count(&self) -> usize {
        self.state.read().await.dbs.len()
    }

    pub async fn tasks(&self) -> Vec<TaskRecord> {
        self.state.read().await.tasks.clone()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn resolve_pid(&self, pid: &Pid) -> Result<Datacube, CubeError> {
        let state = self.state.read().await;
        if !state.containers.contains_key(&pid.container_id) {
            return Err(CubeError::NotFound(format!(
                "container {}",
                pid.container_id
            )));
        }
        state
            .datacubes
            .get(&pid.datacube_id)
            .filter(|cube| cube.container_id == pid.container_id)
            .cloned()
            .ok_or_else(|| {
                CubeError::NotFound(format!(
                    "datacube {} in container {}",
                    pid.datacube_id, pid.container_id
                ))
            })
    }

    async fn container(&self, id: ContainerId) -> Result<Container, CubeError> {
        self.state
            .read()
            .await
            .containers
            .get(&id)
            .cloned()
            .ok_or_else(|| CubeError::NotFound(format!("container {id}")))
    }

    async fn check_permission(
        &self,
        folder_id: FolderId,
        session: Option<&str>,
    ) -> Result<bool, CubeError> {
        let state = self.state.read().await;
        Ok(match state.folder_sessions.get(&folder_id) {
            None => true,
            Some(sessions) => session.map_or(false, |session| sessions.contains(session)),
        })
    }

    async fn datacube(&self, id: DatacubeId) -> Result<Datacube, CubeError> {
        self.state
            .read()
            .await
            .datacubes
            .get(&id)
            .cloned()
            .ok_or_else(|| CubeError::NotFound(format!("datacube {id}")))
    }

    async fn create_datacube(&self, cube: NewDatacube) -> Result<DatacubeId, CubeError> {
        let mut state = self.state.write().await;
        if !state.containers.contains_key(&cube.container_id) {
            return Err(CubeError::NotFound(format!(
                "container {}",
                cube.container_id
            )));
        }
        let id = state.next_id();
        state.datacubes.insert(
            id,
            Datacube {
                id,
                container_id: cube.container_id,
                measure: cube.measure,
                measure_type: cube.measure_type,
                fragment_ids: cube.fragment_ids,
                tuples_per_fragment: cube.tuples_per_fragment,
                rows: cube.rows,
                compressed: cube.compressed,
                dimensions: Vec::new(),
                size_bytes: None,
                description: cube.description,
            },
        );
        Ok(id)
    }

    async fn insert_dimension_instance(
        &self,
        cube: DatacubeId,
        dimension: Dimension,
    ) -> Result<(), CubeError> {
        let mut state = self.state.write().await;
        state.datacube_mut(cube)?.dimensions.push(dimension);
        Ok(())
    }

    async fn record_task(&self, task: TaskRecord) -> Result<(), CubeError> {
        self.state.write().await.tasks.push(task);
        Ok(())
    }

    async fn delete_datacube(&self, id: DatacubeId) -> Result<(), CubeError> {
        let mut state = self.state.write().await;
        if state.datacubes.remove(&id).is_none() {
            return Err(CubeError::NotFound(format!("datacube {id}")));
        }
        state.fragments.retain(|_, fragment| fragment.datacube_id != id);
        state.tasks.retain(|task| task.output != Some(id));
        state.dbs.retain(|_, db| db.owner != Some(id));
        Ok(())
    }

    async fn update_datacube_size(&self, id: DatacubeId, bytes: u64) -> Result<(), CubeError> {
        let mut state = self.state.write().await;
        state.datacube_mut(id)?.size_bytes = Some(bytes);
        Ok(())
    }

    async fn dbms_instances(&self) -> Result<Vec<DbmsInstance>, CubeError> {
        let state = self.state.read().await;
        let mut dbms: Vec<DbmsInstance> = state.dbms.values().cloned().collect();
        dbms.sort_by_key(|dbms| dbms.id);
        Ok(dbms)
    }

    async fn create_db_instance(
        &self,
        dbms_id: DbmsId,
        name: &str,
        owner: DatacubeId,
    ) -> Result<DbInstance, CubeError> {
        let mut state = self.state.write().await;
        if !state.dbms.contains_key(&dbms_id) {
            return Err(CubeError::NotFound(format!("dbms instance {dbms_id}")));
        }
        let db = DbInstance {
            id: state.next_id(),
            dbms_id,
            name: name.to_string(),
            owner: Some(owner),
        };
        state.dbs.insert(db.id, db.clone());
        Ok(db)
    }

    async fn fragment_layout(
        &self,
        cube: DatacubeId,
        ids: &FragmentIds,
    ) -> Result<CubeLayout, CubeError> {
        let state = self.state.read().await;
        if !state.datacubes.contains_key(&cube) {
            return Err(CubeError::NotFound(format!("datacube {cube}")));
        }
        let mut fragments: Vec<FragmentRef> = state
            .fragments
            .values()
            .filter(|fragment| fragment.datacube_id == cube && ids.contains(fragment.relative_index))
            .cloned()
            .collect();
        fragments.sort_by_key(|fragment| fragment.relative_index);

        let mut dbs = Vec::new();
        for db_id in fragments
            .iter()
            .map(|fragment| fragment.db_instance_id)
            .collect::<HashSet<_>>()
        {
            let db = state
                .dbs
                .get(&db_id)
                .ok_or_else(|| CubeError::NotFound(format!("db instance {db_id}")))?;
            dbs.push(db.clone());
        }
        dbs.sort_by_key(|db| db.id);

        let mut dbms = Vec::new();
        for dbms_id in dbs.iter().map(|db| db.dbms_id).collect::<HashSet<_>>() {
            let instance = state
                .dbms
                .get(&dbms_id)
                .ok_or_else(|| CubeError::NotFound(format!("dbms instance {dbms_id}")))?;
            dbms.push(instance.clone());
        }
        dbms.sort_by_key(|dbms| dbms.id);

        Ok(CubeLayout {
            dbms,
            dbs,
            fragments,
        })
    }

    async fn insert_fragment(&self, fragment: NewFragment) -> Result<FragmentId, CubeError> {
        let mut state = self.state.write().await;
        if !state.datacubes.contains_key(&fragment.datacube_id) {
            return Err(CubeError::NotFound(format!(
                "datacube {}",
                fragment.datacube_id
            )));
        }
        if !state.dbs.contains_key(&fragment.db_instance_id) {
            return Err(CubeError::NotFound(format!(
                "db instance {}",
                fragment.db_instance_id
            )));
        }
        let id = state.next_id();
        state.fragments.insert(
            id,
            FragmentRef {
                id,
                datacube_id: fragment.datacube_id,
                relative_index: fragment.relative_index,
                db_instance_id: fragment.db_instance_id,
                key_start: fragment.key_start,
                key_end: fragment.key_end,
                name: fragment.name,
            },
        );
        Ok(id)
    }

    async fn delete_fragment(&self, id: FragmentId) -> Result<(), CubeError> {
        self.state
            .write()
            .await
            .fragments
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CubeError::NotFound(format!("fragment {id}")))
    }
}
