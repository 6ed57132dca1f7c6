//! Operator lifecycle engine.
//!
//! An invocation runs on a fixed group of workers. Every worker walks the same phases:
//!
//! ```text
//! ENV_SET -> TASK_INIT -> TASK_DISTRIBUTE -> TASK_EXECUTE -> TASK_REDUCE -> TASK_DESTROY
//! ```
//!
//! Rank 0 resolves inputs and performs the metadata mutations, and its findings reach the other
//! workers through checkpoints. Fragments are partitioned among the workers and transformed
//! independently. A failure anywhere makes every worker roll back what it created, so that an
//! invocation either commits completely or leaves no trace.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use strum_macros::Display;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::{CubeError, Status};
use crate::fragment_ids::FragmentIds;
use crate::group::{Communicator, LocalGroup, ReduceOp};
use crate::kernels::Primitive;
use crate::metrics::{FRAGMENTS_WRITTEN, OPERATOR_INVOCATIONS, PHASE_DURATION, ROLLBACKS};
use crate::models::{
    ContainerId, DType, Datacube, DatacubeId, DbId, Dimension, FragmentId, NewDatacube,
    NewFragment, OperatorParams, Pid, Placement, SourceFragment, TaskRecord,
};
use crate::partition::PartitionPlan;
use crate::report::{ObjKeys, Report};
use crate::resource_manager::ResourceManager;
use crate::storage::{FragmentLocator, FragmentStats, StorageConnection, StorageDriver, TransformRequest};

/// Version of the messages exchanged at checkpoints.
pub const PROTOCOL_VERSION: u16 = 1;

const ROOT: usize = 0;

/// Lifecycle phases, in execution order
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    EnvSet,
    TaskInit,
    TaskDistribute,
    TaskExecute,
    TaskReduce,
    TaskDestroy,
}

/// Services shared by every worker of every invocation.
#[derive(Clone)]
pub struct Backends {
    pub catalog: Arc<dyn Catalog>,
    pub storage: Arc<dyn StorageDriver>,
    pub resources: Arc<ResourceManager>,
    /// Base URL of datacube PIDs
    pub pid_base: Url,
}

/// One output fragment to produce
#[derive(Clone, Debug, PartialEq)]
pub struct WorkItem {
    /// Relative index of the fragment within the work assigned by TASK_INIT
    pub relative_index: u64,
    /// Input fragments, one per input datacube
    pub sources: Vec<SourceFragment>,
    /// Where output fragments are written
    pub target: Placement,
}

/// A fragment transform requested by an operator
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentTask {
    /// Relative index of the output fragment
    pub relative_index: u64,
    pub primitive: Primitive,
    /// Subset expression over source row keys
    pub row_filter: Option<String>,
}

/// What rank 0 derives in TASK_INIT.
#[derive(Clone, Debug)]
pub struct InitOutcome<P> {
    /// Operator-specific payload shared with every worker
    pub plan: P,
    /// Relative indices of the input fragments (or output fragments with no input) to process
    pub work: FragmentIds,
    /// Measure type of the rows written
    pub measure_type: DType,
    pub compressed: bool,
    /// Uncompressed size of one source row
    pub row_bytes: u64,
}

/// Metadata access for rank 0 during TASK_INIT.
pub struct InitScope<'a> {
    backends: &'a Backends,
    inputs: Vec<Datacube>,
    container_id: ContainerId,
    job_id: &'a str,
    operator: &'static str,
    output_id: Option<DatacubeId>,
}

impl<'a> InitScope<'a> {
    pub fn catalog(&self) -> &dyn Catalog {
        self.backends.catalog.as_ref()
    }

    pub fn inputs(&self) -> &[Datacube] {
        &self.inputs
    }

    pub fn input(&self, index: usize) -> Result<&Datacube, CubeError> {
        self.inputs
            .get(index)
            .ok_or_else(|| CubeError::Catalog(format!("input datacube {} was not resolved", index + 1)))
    }

    /// Container receiving the output datacube.
    pub fn container_id(&self) -> ContainerId {
        self.container_id
    }

    /// Insert the output datacube with its dimensions and record the task that produced it.
    pub async fn create_output(
        &mut self,
        cube: NewDatacube,
        dimensions: Vec<Dimension>,
    ) -> Result<DatacubeId, CubeError> {
        let catalog = self.backends.catalog.clone();
        let id = catalog.create_datacube(cube).await?;
        self.output_id = Some(id);
        for dimension in dimensions {
            catalog.insert_dimension_instance(id, dimension).await?;
        }
        catalog
            .record_task(TaskRecord {
                job_id: self.job_id.to_string(),
                operator: self.operator.to_string(),
                inputs: self.inputs.iter().map(|cube| cube.id).collect(),
                output: Some(id),
            })
            .await?;
        Ok(id)
    }
}

/// What rank 0 sees when it commits.
pub struct CommitScope<'a> {
    pub backends: &'a Backends,
    pub input_ids: &'a [DatacubeId],
    pub container_id: ContainerId,
    pub output_id: Option<DatacubeId>,
    /// Global value of the operator's accumulator
    pub accumulated: i64,
}

impl<'a> CommitScope<'a> {
    pub fn output_pid(&self) -> Result<String, CubeError> {
        let datacube_id = self
            .output_id
            .ok_or_else(|| CubeError::Catalog("operator has no output datacube".to_string()))?;
        Ok(Pid {
            container_id: self.container_id,
            datacube_id,
        }
        .to_url(&self.backends.pid_base))
    }

    pub fn input_pid(&self, index: usize) -> Result<String, CubeError> {
        let datacube_id = *self
            .input_ids
            .get(index)
            .ok_or_else(|| CubeError::Catalog(format!("no input datacube {}", index + 1)))?;
        Ok(Pid {
            container_id: self.container_id,
            datacube_id,
        }
        .to_url(&self.backends.pid_base))
    }
}

/// An array operator driven by the engine.
///
/// Implementations only parse their arguments, derive the output metadata, and map each work
/// item onto fragment transforms. The engine owns partitioning, storage connections, fragment
/// bookkeeping and rollback.
#[async_trait]
pub trait Operator: Send + Sync + 'static {
    type Args: Send + Sync + 'static;
    type Plan: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Name under which the operator is invoked.
    const NAME: &'static str;

    fn parse_args(&self, params: &OperatorParams) -> Result<Self::Args, CubeError>;

    /// PIDs of the input datacubes.
    fn inputs(&self, args: &Self::Args) -> Vec<String>;

    /// Container of the output datacube, for operators without inputs.
    fn output_container(&self, _args: &Self::Args) -> Option<ContainerId> {
        None
    }

    /// Rank 0 only: create the output metadata and decide the work.
    async fn init(
        &self,
        args: &Self::Args,
        scope: &mut InitScope<'_>,
    ) -> Result<InitOutcome<Self::Plan>, CubeError>;

    /// Placement of an output fragment, for operators without inputs.
    fn place(
        &self,
        _args: &Self::Args,
        _plan: &Self::Plan,
        relative_index: u64,
    ) -> Result<Placement, CubeError> {
        Err(CubeError::Catalog(format!(
            "{} cannot place fragment {relative_index} without an input",
            Self::NAME
        )))
    }

    /// Number of local helpers sharing a worker's fragments.
    fn helpers(&self, _args: &Self::Args) -> usize {
        1
    }

    /// Produce the output of one work item.
    async fn execute(
        &self,
        args: &Self::Args,
        plan: &Self::Plan,
        item: &WorkItem,
        executor: &mut Executor<'_>,
    ) -> Result<(), CubeError>;

    /// Reduction combining the values passed to [Executor::accumulate].
    fn accumulator(&self) -> ReduceOp {
        ReduceOp::Sum
    }

    /// Rank 0 only: the user-visible side effect once every worker succeeded.
    async fn commit(
        &self,
        _args: &Self::Args,
        _plan: &Self::Plan,
        scope: CommitScope<'_>,
    ) -> Result<Report, CubeError> {
        Ok(Report::new(Self::NAME).text("output_cube", "Output Cube", scope.output_pid()?))
    }
}

/// State shared by the helpers of one worker in TASK_EXECUTE.
struct ExecContext {
    backends: Backends,
    rank: usize,
    output_id: Option<DatacubeId>,
    measure_type: DType,
    compressed: bool,
    row_bytes: u64,
    accumulator: ReduceOp,
    /// Fragments created by any helper. Kept outside the helpers so that a helper that panics
    /// still leaves its fragments to TASK_DESTROY.
    created: Mutex<Vec<CreatedFragment>>,
}

impl ExecContext {
    fn created(&self) -> MutexGuard<'_, Vec<CreatedFragment>> {
        self.created.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a fragment and return its position in the ledger.
    fn record_created(&self, fragment: CreatedFragment) -> usize {
        let mut created = self.created();
        created.push(fragment);
        created.len() - 1
    }

    fn set_catalog_id(&self, position: usize, id: FragmentId) {
        if let Some(created) = self.created().get_mut(position) {
            created.catalog_id = Some(id);
        }
    }

    fn take_created(&self) -> Vec<CreatedFragment> {
        std::mem::take(&mut *self.created())
    }
}

/// A fragment written by this worker, kept for rollback.
#[derive(Clone, Debug)]
struct CreatedFragment {
    placement: Placement,
    name: String,
    catalog_id: Option<FragmentId>,
}

/// Fragment I/O on behalf of an operator.
///
/// The connection is bound to the DBMS and database of the current work item's target.
pub struct Executor<'a> {
    context: &'a ExecContext,
    connection: &'a mut Box<dyn StorageConnection>,
    accumulated: &'a mut i64,
}

impl<'a> Executor<'a> {
    /// Create an output fragment, fill it with a transform of the item's sources and register it.
    pub async fn write(
        &mut self,
        item: &WorkItem,
        task: FragmentTask,
    ) -> Result<FragmentStats, CubeError> {
        let context = self.context;
        let output_id = context
            .output_id
            .ok_or_else(|| CubeError::Catalog("operator has no output datacube".to_string()))?;
        let source_rows: u64 = item.sources.iter().map(|source| source.fragment.rows()).sum();
        let _memory = context
            .backends
            .resources
            .fragment_memory(source_rows, context.row_bytes)
            .await?;

        let name = fragment_name(output_id, task.relative_index);
        self.connection.create_empty_fragment(&name).await?;
        let position = context.record_created(CreatedFragment {
            placement: item.target.clone(),
            name: name.clone(),
            catalog_id: None,
        });

        let request = TransformRequest {
            sources: item.sources.iter().map(locator).collect(),
            target: name.clone(),
            primitive: task.primitive.name().to_string(),
            args: task.primitive.args(),
            row_filter: task.row_filter,
            measure_type: context.measure_type,
            compressed: context.compressed,
        };
        let stats = self.connection.run_transform(&request).await?;
        let id = context
            .backends
            .catalog
            .insert_fragment(NewFragment {
                datacube_id: output_id,
                relative_index: task.relative_index,
                db_instance_id: item.target.db.id,
                key_start: stats.key_start,
                key_end: stats.key_end,
                name,
            })
            .await?;
        context.set_catalog_id(position, id);
        FRAGMENTS_WRITTEN.inc();
        debug!(
            relative_index = task.relative_index,
            rows = stats.rows,
            "fragment written"
        );
        Ok(stats)
    }

    /// Stored size of a source fragment that lives in the target database.
    pub async fn byte_size(&mut self, item: &WorkItem, source: usize) -> Result<u64, CubeError> {
        let source = item
            .sources
            .get(source)
            .ok_or_else(|| CubeError::Catalog(format!("work item has no source {source}")))?;
        self.connection
            .fragment_byte_size(&source.fragment.name)
            .await
    }

    /// Rank of the worker running this executor.
    pub fn rank(&self) -> usize {
        self.context.rank
    }

    /// Fold a value into this worker's accumulator.
    pub fn accumulate(&mut self, value: i64) {
        *self.accumulated = self.context.accumulator.combine(*self.accumulated, value);
    }
}

fn fragment_name(datacube_id: DatacubeId, relative_index: u64) -> String {
    format!("fact_{datacube_id}_{relative_index}")
}

fn locator(source: &SourceFragment) -> FragmentLocator {
    FragmentLocator {
        dbms_id: source.placement.dbms.id,
        database: source.placement.db.name.clone(),
        fragment: source.fragment.name.clone(),
    }
}

/// Everything rank 0 learns in ENV_SET.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct EnvMessage {
    input_ids: Vec<DatacubeId>,
    container_id: ContainerId,
    job_id: String,
}

/// Everything rank 0 derives in TASK_INIT.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(bound(deserialize = "P: DeserializeOwned"))]
struct InitMessage<P> {
    version: u16,
    output_id: Option<DatacubeId>,
    work: FragmentIds,
    measure_type: DType,
    compressed: bool,
    row_bytes: u64,
    plan: P,
}

/// Final status of one worker, exchanged in TASK_DESTROY.
#[derive(Debug, Deserialize, Serialize)]
struct Outcome {
    status: Status,
    message: Option<String>,
}

/// Per-invocation state of one worker.
struct Worker<O: Operator, C: Communicator> {
    op: Arc<O>,
    comm: C,
    backends: Backends,
    env: Option<EnvMessage>,
    output_id: Option<DatacubeId>,
    partition: Option<PartitionPlan>,
    work: FragmentIds,
    /// First local failure in TASK_EXECUTE
    execute_error: Option<CubeError>,
    created: Vec<CreatedFragment>,
    accumulated: i64,
}

impl<O: Operator, C: Communicator> Worker<O, C> {
    fn new(op: Arc<O>, comm: C, backends: Backends) -> Self {
        let accumulated = op.accumulator().identity();
        Worker {
            op,
            comm,
            backends,
            env: None,
            output_id: None,
            partition: None,
            work: FragmentIds::empty(),
            execute_error: None,
            created: Vec::new(),
            accumulated,
        }
    }

    fn rank(&self) -> usize {
        self.comm.rank()
    }

    async fn run(mut self, params: &OperatorParams) -> Option<Report> {
        let outcome = self.lifecycle(params).await;
        let started = Instant::now();
        let report = self
            .task_destroy(outcome, &ObjKeys::from_params(params))
            .instrument(info_span!("phase", phase = %Phase::TaskDestroy))
            .await;
        observe(Phase::TaskDestroy, started);
        report
    }

    /// Phases up to TASK_REDUCE. Every collective is entered by all workers or by none.
    async fn lifecycle(&mut self, params: &OperatorParams) -> Result<Option<Report>, CubeError> {
        let started = Instant::now();
        let args = self
            .env_set(params)
            .instrument(info_span!("phase", phase = %Phase::EnvSet))
            .await;
        observe(Phase::EnvSet, started);
        let args = Arc::new(args?);

        let started = Instant::now();
        let init = self
            .task_init(&args)
            .instrument(info_span!("phase", phase = %Phase::TaskInit))
            .await;
        observe(Phase::TaskInit, started);
        let init = init?;

        let started = Instant::now();
        self.task_distribute(&init);
        observe(Phase::TaskDistribute, started);

        let started = Instant::now();
        self.task_execute(&args, &init)
            .instrument(info_span!("phase", phase = %Phase::TaskExecute))
            .await;
        observe(Phase::TaskExecute, started);

        let started = Instant::now();
        let report = self
            .task_reduce(&args, &init)
            .instrument(info_span!("phase", phase = %Phase::TaskReduce))
            .await;
        observe(Phase::TaskReduce, started);
        report
    }

    /// Exchange the local status of every worker and rank 0's data.
    ///
    /// Fails with [CubeError::Utility] when any worker reports a failure or rank 0's data
    /// cannot be decoded.
    async fn checkpoint<T>(
        &self,
        phase: Phase,
        status: Status,
        data: Option<&T>,
    ) -> Result<T, CubeError>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = serde_json::to_vec(&(status, data))
            .map(Bytes::from)
            .unwrap_or_else(|err| {
                warn!("failed to encode {phase} checkpoint: {err}");
                Bytes::new()
            });
        let gathered = self.comm.all_gather(payload).await;

        let mut root_data = None;
        for (rank, payload) in gathered.iter().enumerate() {
            let decoded: (Status, Option<serde_json::Value>) = serde_json::from_slice(payload)
                .map_err(|_| CubeError::Utility { phase })?;
            if !decoded.0.is_success() {
                debug!(rank, status = %decoded.0, "worker reported failure at {phase}");
                return Err(CubeError::Utility { phase });
            }
            if rank == ROOT {
                root_data = decoded.1;
            }
        }
        root_data
            .and_then(|value| serde_json::from_value(value).ok())
            .ok_or(CubeError::Utility { phase })
    }

    async fn env_set(&mut self, params: &OperatorParams) -> Result<O::Args, CubeError> {
        let prepared = self.prepare_env(params).await;
        let (status, message) = match &prepared {
            Ok((_, message)) => (Status::Success, message.as_ref()),
            Err(err) => (err.status(), None),
        };
        let shared = self.checkpoint(Phase::EnvSet, status, message).await;
        let (args, _) = prepared?;
        let env = shared?;
        debug!(inputs = ?env.input_ids, container = env.container_id, "environment set");
        self.env = Some(env);
        Ok(args)
    }

    async fn prepare_env(
        &self,
        params: &OperatorParams,
    ) -> Result<(O::Args, Option<EnvMessage>), CubeError> {
        let schedule_algo: u64 = params.parse_or("schedule_algo", 0)?;
        if schedule_algo != 0 {
            return Err(CubeError::InvalidParam {
                name: "schedule_algo".to_string(),
                reason: "only static scheduling (0) is supported".to_string(),
            });
        }
        let args = self.op.parse_args(params)?;
        if self.rank() != ROOT {
            return Ok((args, None));
        }

        let catalog = self.backends.catalog.as_ref();
        let session = params.get("sessionid");
        let mut input_ids = Vec::new();
        let mut container_id = None;
        for pid in self.op.inputs(&args) {
            let cube = catalog.resolve_pid(&Pid::parse(&pid)?).await?;
            check_access(catalog, cube.container_id, session).await?;
            container_id.get_or_insert(cube.container_id);
            input_ids.push(cube.id);
        }
        if let Some(output_container) = self.op.output_container(&args) {
            check_access(catalog, output_container, session).await?;
            container_id = Some(output_container);
        }
        let container_id =
            container_id.ok_or_else(|| CubeError::MissingParam("container".to_string()))?;
        let env = EnvMessage {
            input_ids,
            container_id,
            job_id: Uuid::new_v4().to_string(),
        };
        Ok((args, Some(env)))
    }

    async fn task_init(&mut self, args: &O::Args) -> Result<Arc<InitMessage<O::Plan>>, CubeError> {
        let prepared = if self.rank() == ROOT {
            self.prepare_init(args).await
        } else {
            Ok(None)
        };
        let (status, message) = match &prepared {
            Ok(message) => (Status::Success, message.as_ref()),
            Err(err) => (err.status(), None),
        };
        let shared = self.checkpoint(Phase::TaskInit, status, message).await;
        prepared?;
        let message: InitMessage<O::Plan> = shared?;
        if message.version != PROTOCOL_VERSION {
            warn!(version = message.version, "unexpected init message version");
            return Err(CubeError::Utility {
                phase: Phase::TaskInit,
            });
        }
        self.output_id = message.output_id;
        Ok(Arc::new(message))
    }

    async fn prepare_init(
        &mut self,
        args: &O::Args,
    ) -> Result<Option<InitMessage<O::Plan>>, CubeError> {
        let env = self.env.as_ref().ok_or(CubeError::Utility {
            phase: Phase::TaskInit,
        })?;
        let mut inputs = Vec::with_capacity(env.input_ids.len());
        for id in &env.input_ids {
            inputs.push(self.backends.catalog.datacube(*id).await?);
        }
        let mut scope = InitScope {
            backends: &self.backends,
            inputs,
            container_id: env.container_id,
            job_id: &env.job_id,
            operator: O::NAME,
            output_id: None,
        };
        let outcome = self.op.init(args, &mut scope).await;
        // Kept even on failure so that TASK_DESTROY can remove a partially created output.
        let output_id = scope.output_id;
        self.output_id = output_id;
        let outcome = outcome?;
        info!(output = ?output_id, fragments = outcome.work.count(), "task initialised");
        Ok(Some(InitMessage {
            version: PROTOCOL_VERSION,
            output_id,
            work: outcome.work,
            measure_type: outcome.measure_type,
            compressed: outcome.compressed,
            row_bytes: outcome.row_bytes,
            plan: outcome.plan,
        }))
    }

    fn task_distribute(&mut self, init: &InitMessage<O::Plan>) {
        let plan = PartitionPlan::plan(
            init.work.count(),
            self.comm.size() as u64,
            self.rank() as u64,
        );
        self.work = if plan.is_idle {
            FragmentIds::empty()
        } else {
            init.work.slice(plan.start_offset, plan.share)
        };
        debug!(
            share = plan.share,
            start_offset = plan.start_offset,
            idle = plan.is_idle,
            work = %self.work,
            "work distributed"
        );
        self.partition = Some(plan);
    }

    async fn task_execute(&mut self, args: &Arc<O::Args>, init: &Arc<InitMessage<O::Plan>>) {
        if self.partition.map_or(true, |plan| plan.is_idle) {
            debug!("idle worker");
            return;
        }
        if let Err(err) = self.execute_work(args, init).await {
            warn!("execution failed: {err}");
            self.execute_error = Some(err);
        }
    }

    async fn execute_work(
        &mut self,
        args: &Arc<O::Args>,
        init: &Arc<InitMessage<O::Plan>>,
    ) -> Result<(), CubeError> {
        let items = self.work_items(args, init).await?;
        let helpers = self.op.helpers(args).clamp(1, items.len().max(1));
        let context = Arc::new(ExecContext {
            backends: self.backends.clone(),
            rank: self.rank(),
            output_id: self.output_id,
            measure_type: init.measure_type,
            compressed: init.compressed,
            row_bytes: init.row_bytes,
            accumulator: self.op.accumulator(),
            created: Mutex::new(Vec::new()),
        });

        let mut tasks = JoinSet::new();
        for helper in 0..helpers {
            let share = PartitionPlan::plan(items.len() as u64, helpers as u64, helper as u64);
            if share.is_idle {
                continue;
            }
            let range = usize::try_from(share.start_offset)?..usize::try_from(share.start_offset + share.share)?;
            tasks.spawn(
                run_helper(
                    self.op.clone(),
                    args.clone(),
                    init.clone(),
                    context.clone(),
                    items[range].to_vec(),
                )
                .instrument(info_span!("helper", helper)),
            );
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    self.accumulated = context
                        .accumulator
                        .combine(self.accumulated, outcome.accumulated);
                    if let Some(err) = outcome.error {
                        failure.get_or_insert(err);
                    }
                }
                Err(err) => {
                    failure.get_or_insert(err.into());
                }
            }
        }
        self.created.extend(context.take_created());
        failure.map_or(Ok(()), Err)
    }

    /// Resolve the physical placement of the assigned fragments.
    async fn work_items(
        &self,
        args: &O::Args,
        init: &InitMessage<O::Plan>,
    ) -> Result<Vec<WorkItem>, CubeError> {
        let env = self.env.as_ref().ok_or(CubeError::Utility {
            phase: Phase::TaskExecute,
        })?;
        let catalog = self.backends.catalog.as_ref();
        match env.input_ids.as_slice() {
            [] => self
                .work
                .iter()
                .map(|relative_index| -> Result<WorkItem, CubeError> {
                    Ok(WorkItem {
                        relative_index,
                        sources: Vec::new(),
                        target: self.op.place(args, &init.plan, relative_index)?,
                    })
                })
                .collect(),
            [input] => {
                let layout = catalog.fragment_layout(*input, &self.work).await?;
                check_layout_size(layout.fragments.len(), &self.work)?;
                layout
                    .ordered()
                    .into_iter()
                    .map(|index| -> Result<WorkItem, CubeError> {
                        let source = layout.source(index)?;
                        Ok(WorkItem {
                            relative_index: source.fragment.relative_index,
                            target: source.placement.clone(),
                            sources: vec![source],
                        })
                    })
                    .collect()
            }
            [first, second] => {
                let a = catalog.fragment_layout(*first, &self.work).await?;
                let b = catalog.fragment_layout(*second, &self.work).await?;
                check_layout_size(a.fragments.len(), &self.work)?;
                crate::matcher::match_fragments(&a, &b)?
                    .into_iter()
                    .map(|pair| -> Result<WorkItem, CubeError> {
                        let source_a = a.source(pair.a)?;
                        let source_b = b.source(pair.b)?;
                        Ok(WorkItem {
                            relative_index: source_a.fragment.relative_index,
                            target: source_a.placement.clone(),
                            sources: vec![source_a, source_b],
                        })
                    })
                    .collect()
            }
            _ => Err(CubeError::Catalog(format!(
                "{} takes at most two input datacubes",
                O::NAME
            ))),
        }
    }

    async fn task_reduce(
        &mut self,
        args: &O::Args,
        init: &InitMessage<O::Plan>,
    ) -> Result<Option<Report>, CubeError> {
        let local = self
            .execute_error
            .as_ref()
            .map_or(Status::Success, CubeError::status);
        let global = self.comm.all_reduce(local.code(), ReduceOp::Max).await;
        let accumulated = self
            .comm
            .all_reduce(self.accumulated, self.op.accumulator())
            .await;
        if let Some(err) = self.execute_error.take() {
            return Err(err);
        }
        if global != Status::Success.code() {
            return Err(CubeError::Utility {
                phase: Phase::TaskReduce,
            });
        }
        if self.rank() != ROOT {
            return Ok(None);
        }
        let env = self.env.as_ref().ok_or(CubeError::Utility {
            phase: Phase::TaskReduce,
        })?;
        let scope = CommitScope {
            backends: &self.backends,
            input_ids: &env.input_ids,
            container_id: env.container_id,
            output_id: self.output_id,
            accumulated,
        };
        self.op.commit(args, &init.plan, scope).await.map(Some)
    }

    /// Agree on the final status and roll back every effect of a failed invocation.
    async fn task_destroy(
        &mut self,
        outcome: Result<Option<Report>, CubeError>,
        objkeys: &ObjKeys,
    ) -> Option<Report> {
        let local = match &outcome {
            Ok(_) => Outcome {
                status: Status::Success,
                message: None,
            },
            Err(err) => Outcome {
                status: err.status(),
                message: Some(err.to_string()),
            },
        };
        let payload = serde_json::to_vec(&local)
            .map(Bytes::from)
            .unwrap_or_default();
        let gathered = self.comm.all_gather(payload).await;
        let outcomes: Vec<Outcome> = gathered
            .iter()
            .map(|payload| {
                serde_json::from_slice(payload).unwrap_or(Outcome {
                    status: Status::UtilityError,
                    message: None,
                })
            })
            .collect();
        let status = outcomes
            .iter()
            .map(|outcome| outcome.status)
            .max()
            .unwrap_or(Status::UtilityError);

        if status.is_success() {
            return match outcome {
                Ok(Some(report)) => Some(report.select(objkeys)),
                _ => None,
            };
        }

        let partitioned = self.partition.map_or(false, |plan| !plan.is_idle);
        if partitioned || self.rank() == ROOT {
            self.rollback_fragments().await;
        }
        // Fragments are removed everywhere before the datacube row goes.
        self.comm.barrier().await;
        if self.rank() != ROOT {
            return None;
        }
        if let Some(output_id) = self.output_id {
            if let Err(err) = self.backends.catalog.delete_datacube(output_id).await {
                warn!(output_id, "failed to delete output datacube: {err}");
            }
        }
        ROLLBACKS.with_label_values(&[O::NAME]).inc();
        let message = outcomes
            .into_iter()
            .find(|outcome| outcome.status == status && outcome.message.is_some())
            .and_then(|outcome| outcome.message);
        info!(%status, "invocation rolled back");
        Some(Report::failed(O::NAME, status, message))
    }

    /// Delete the fragments this worker created. Failures are logged and skipped.
    async fn rollback_fragments(&mut self) {
        let created = std::mem::take(&mut self.created);
        let mut start = 0;
        while start < created.len() {
            let dbms_id = created[start].placement.dbms.id;
            let end = start
                + created[start..]
                    .iter()
                    .take_while(|fragment| fragment.placement.dbms.id == dbms_id)
                    .count();
            if let Err(err) = self.rollback_group(&created[start..end]).await {
                warn!(dbms_id, "failed to roll back fragments: {err}");
            }
            start = end;
        }
    }

    async fn rollback_group(&self, created: &[CreatedFragment]) -> Result<(), CubeError> {
        let Some(first) = created.first() else {
            return Ok(());
        };
        let _permit = self.backends.resources.storage_connection().await?;
        let mut connection = self.backends.storage.connect(&first.placement.dbms).await?;
        let mut current_db: Option<DbId> = None;
        for fragment in created {
            if current_db != Some(fragment.placement.db.id) {
                connection.use_database(&fragment.placement.db).await?;
                current_db = Some(fragment.placement.db.id);
            }
            if let Err(err) = connection.delete_fragment(&fragment.name).await {
                warn!(fragment = %fragment.name, "failed to drop fragment: {err}");
            }
            if let Some(id) = fragment.catalog_id {
                if let Err(err) = self.backends.catalog.delete_fragment(id).await {
                    warn!(fragment = id, "failed to delete fragment row: {err}");
                }
            }
        }
        Ok(())
    }
}

fn observe(phase: Phase, started: Instant) {
    PHASE_DURATION
        .with_label_values(&[&phase.to_string()])
        .observe(started.elapsed().as_secs_f64());
}

async fn check_access(
    catalog: &dyn Catalog,
    container_id: ContainerId,
    session: Option<&str>,
) -> Result<(), CubeError> {
    let container = catalog.container(container_id).await?;
    if !catalog
        .check_permission(container.folder_id, session)
        .await?
    {
        return Err(CubeError::PermissionDenied {
            folder: container.folder_id,
        });
    }
    Ok(())
}

fn check_layout_size(found: usize, work: &FragmentIds) -> Result<(), CubeError> {
    if found as u64 != work.count() {
        return Err(CubeError::Catalog(format!(
            "expected {} fragments for {work}, found {found}",
            work.count()
        )));
    }
    Ok(())
}

/// What one local helper did.
struct HelperOutcome {
    accumulated: i64,
    error: Option<CubeError>,
}

async fn run_helper<O: Operator>(
    op: Arc<O>,
    args: Arc<O::Args>,
    init: Arc<InitMessage<O::Plan>>,
    context: Arc<ExecContext>,
    items: Vec<WorkItem>,
) -> HelperOutcome {
    let mut outcome = HelperOutcome {
        accumulated: context.accumulator.identity(),
        error: None,
    };
    if let Err(err) = process_items(
        op.as_ref(),
        &args,
        &init.plan,
        &context,
        &items,
        &mut outcome,
    )
    .await
    {
        outcome.error = Some(err);
    }
    outcome
}

/// Process items in order, one storage connection per run of items on the same DBMS.
/// Stops at the first error.
async fn process_items<O: Operator>(
    op: &O,
    args: &O::Args,
    plan: &O::Plan,
    context: &ExecContext,
    items: &[WorkItem],
    outcome: &mut HelperOutcome,
) -> Result<(), CubeError> {
    let _helper = context.backends.resources.helper().await?;
    let mut start = 0;
    while start < items.len() {
        let dbms = &items[start].target.dbms;
        let end = start
            + items[start..]
                .iter()
                .take_while(|item| item.target.dbms.id == dbms.id)
                .count();
        let _permit = context.backends.resources.storage_connection().await?;
        let mut connection = context.backends.storage.connect(dbms).await?;
        let mut current_db: Option<DbId> = None;
        for item in &items[start..end] {
            if current_db != Some(item.target.db.id) {
                connection.use_database(&item.target.db).await?;
                current_db = Some(item.target.db.id);
            }
            let mut executor = Executor {
                context,
                connection: &mut connection,
                accumulated: &mut outcome.accumulated,
            };
            op.execute(args, plan, item, &mut executor).await?;
        }
        start = end;
    }
    Ok(())
}

async fn run_worker<O: Operator, C: Communicator>(
    op: Arc<O>,
    params: Arc<OperatorParams>,
    comm: C,
    backends: Backends,
) -> Option<Report> {
    Worker::new(op, comm, backends).run(&params).await
}

/// Run an operator on a group of `workers` workers and return rank 0's report.
///
/// Failures of the operator are reported through the report's status. An error is only returned
/// when the worker group itself breaks down.
pub async fn run_operator<O: Operator>(
    op: O,
    params: OperatorParams,
    workers: usize,
    backends: &Backends,
) -> Result<Report, CubeError> {
    let op = Arc::new(op);
    let params = Arc::new(params);
    let mut tasks = JoinSet::new();
    for comm in LocalGroup::create(workers) {
        let span = info_span!("worker", operator = O::NAME, rank = comm.rank());
        tasks.spawn(run_worker(op.clone(), params.clone(), comm, backends.clone()).instrument(span));
    }

    let mut report = None;
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(root_report)) => report = Some(root_report),
            Ok(None) => {}
            Err(err) => {
                // The remaining workers would wait forever at the next collective.
                tasks.abort_all();
                failure.get_or_insert(CubeError::from(err));
            }
        }
    }
    let report = match (report, failure) {
        (Some(report), None) => report,
        (_, Some(err)) => return Err(err),
        (None, None) => {
            return Err(CubeError::Utility {
                phase: Phase::TaskDestroy,
            })
        }
    };
    OPERATOR_INVOCATIONS
        .with_label_values(&[O::NAME, &report.status.to_string()])
        .inc();
    Ok(report)
}
