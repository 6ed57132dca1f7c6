use std::sync::Arc;

use url::Url;

use crate::array;
use crate::catalog::{Catalog, MemoryCatalog};
use crate::engine::{run_operator, Backends};
use crate::models::{Container, DType, Datacube, OperatorParams, Pid};
use crate::operators::create_cube::CreateCube;
use crate::report::{Report, ReportObject};
use crate::resource_manager::ResourceManager;
use crate::storage::{FragmentLocator, MemoryStorage};

pub(crate) const PID_BASE: &str = "http://localhost/cubeops/";

/// In-memory backends with typed handles for inspection.
pub(crate) struct TestEnv {
    pub backends: Backends,
    pub catalog: Arc<MemoryCatalog>,
    pub storage: Arc<MemoryStorage>,
    pub container: Container,
    dbms_count: u64,
}

/// Create backends with `dbms` storage servers and one open container.
pub(crate) async fn setup(dbms: u16) -> TestEnv {
    let catalog = Arc::new(MemoryCatalog::new());
    for port in 0..dbms {
        catalog.add_dbms("localhost", 5000 + port).await;
    }
    let container = catalog.add_container("test", 1).await;
    let storage = Arc::new(MemoryStorage::new());
    let backends = Backends {
        catalog: catalog.clone(),
        storage: storage.clone(),
        resources: Arc::new(ResourceManager::new(None, None, None)),
        pid_base: Url::parse(PID_BASE).unwrap(),
    };
    TestEnv {
        backends,
        catalog,
        storage,
        container,
        dbms_count: dbms.into(),
    }
}

impl TestEnv {
    /// Run `createcube` in the test container and return the new PID.
    pub async fn create(&self, params: OperatorParams) -> String {
        let params = params.with("container", self.container.id.to_string());
        let report = run_operator(CreateCube, params, 2, &self.backends)
            .await
            .unwrap();
        output_pid(&report)
    }

    /// A double cube spread evenly over every storage server, with 2 rows of 4 elements per
    /// fragment.
    pub async fn create_cube(&self, fragments: u64) -> String {
        assert_eq!(0, fragments % self.dbms_count, "uneven fragment spread");
        self.create(
            OperatorParams::new()
                .with("measure", "temperature")
                .with("dims", "x|t")
                .with("dim_sizes", format!("{}|4", 2 * fragments))
                .with("ndbms", self.dbms_count.to_string())
                .with("nfrag", (fragments / self.dbms_count).to_string()),
        )
        .await
    }

    pub async fn cube(&self, pid: &str) -> Datacube {
        self.catalog
            .resolve_pid(&Pid::parse(pid).unwrap())
            .await
            .unwrap()
    }

    /// Every row of a cube with its raw measure, ordered by key.
    pub async fn rows(&self, pid: &str) -> Vec<(u64, bytes::Bytes)> {
        let cube = self.cube(pid).await;
        let layout = self
            .catalog
            .fragment_layout(cube.id, &cube.fragment_ids)
            .await
            .unwrap();
        let mut rows = Vec::new();
        for index in layout.ordered() {
            let source = layout.source(index).unwrap();
            let locator = FragmentLocator {
                dbms_id: source.placement.dbms.id,
                database: source.placement.db.name.clone(),
                fragment: source.fragment.name.clone(),
            };
            let (_, fragment_rows) = self.storage.read_fragment(&locator).await.unwrap();
            rows.extend(fragment_rows);
        }
        rows.sort_by_key(|(key, _)| *key);
        rows
    }

    /// Every row of a cube with its measure as doubles, ordered by key.
    pub async fn values(&self, pid: &str) -> Vec<(u64, Vec<f64>)> {
        let measure_type = self.cube(pid).await.measure_type;
        self.rows(pid)
            .await
            .into_iter()
            .map(|(key, measure)| (key, decode(measure_type, &measure)))
            .collect()
    }
}

fn decode(dtype: DType, measure: &[u8]) -> Vec<f64> {
    match dtype {
        DType::Byte => widen(array::decode::<i8>(measure).unwrap()),
        DType::Short => widen(array::decode::<i16>(measure).unwrap()),
        DType::Int => widen(array::decode::<i32>(measure).unwrap()),
        DType::Long => array::decode::<i64>(measure)
            .unwrap()
            .into_iter()
            .map(|v| v as f64)
            .collect(),
        DType::Float => widen(array::decode::<f32>(measure).unwrap()),
        DType::Double => array::decode::<f64>(measure).unwrap(),
    }
}

fn widen<T: Into<f64>>(values: Vec<T>) -> Vec<f64> {
    values.into_iter().map(Into::into).collect()
}

/// PID of the output cube of a successful report.
pub(crate) fn output_pid(report: &Report) -> String {
    match report.object("output_cube") {
        Some(ReportObject::Text { message, .. }) => message.clone(),
        _ => panic!("no output cube in {report:?}"),
    }
}
