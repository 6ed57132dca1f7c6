//! `createcube`: a new datacube of generated values.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::{Executor, FragmentTask, InitOutcome, InitScope, Operator, WorkItem};
use crate::error::CubeError;
use crate::fragment_ids::FragmentIds;
use crate::kernels::Primitive;
use crate::models::{ContainerId, DType, Dimension, NewDatacube, OperatorParams, Placement};
use crate::operators::positive;

pub struct CreateCube;

#[derive(Debug)]
pub struct CreateCubeArgs {
    container: ContainerId,
    measure: String,
    measure_type: DType,
    /// Explicit dimensions outer-first, then the implicit dimension
    dims: Vec<(String, u64)>,
    ndbms: u64,
    ndb: u64,
    nfrag: u64,
    compressed: bool,
    seed: u64,
    description: Option<String>,
}

impl CreateCubeArgs {
    fn explicit(&self) -> &[(String, u64)] {
        &self.dims[..self.dims.len() - 1]
    }

    fn array_length(&self) -> u64 {
        self.dims.last().map_or(1, |(_, size)| *size)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreateCubePlan {
    /// Databases in placement order. Each holds `nfrag` consecutive fragments.
    dbs: Vec<Placement>,
    nfrag: u64,
    tuples_per_fragment: u64,
    rows: u64,
    array_length: u64,
    seed: u64,
}

fn invalid(name: &str, reason: impl Into<String>) -> CubeError {
    CubeError::InvalidParam {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn parse_dims(params: &OperatorParams) -> Result<Vec<(String, u64)>, CubeError> {
    let names = params
        .list("dims")
        .ok_or_else(|| CubeError::MissingParam("dims".to_string()))?;
    let sizes = params
        .list("dim_sizes")
        .ok_or_else(|| CubeError::MissingParam("dim_sizes".to_string()))?;
    if names.len() != sizes.len() {
        return Err(invalid(
            "dim_sizes",
            format!("{} sizes for {} dimensions", sizes.len(), names.len()),
        ));
    }
    if names.len() < 2 {
        return Err(invalid(
            "dims",
            "at least one explicit and one implicit dimension are required",
        ));
    }
    names
        .iter()
        .zip(sizes)
        .map(|(name, size)| -> Result<(String, u64), CubeError> {
            if name.is_empty() {
                return Err(invalid("dims", "dimension names cannot be empty"));
            }
            let size: u64 = size
                .parse()
                .map_err(|_| invalid("dim_sizes", format!("\"{size}\" is not a number")))?;
            if size == 0 {
                return Err(invalid("dim_sizes", format!("dimension {name} is empty")));
            }
            Ok((name.to_string(), size))
        })
        .collect()
}

#[async_trait]
impl Operator for CreateCube {
    type Args = CreateCubeArgs;
    type Plan = CreateCubePlan;
    const NAME: &'static str = "createcube";

    fn parse_args(&self, params: &OperatorParams) -> Result<Self::Args, CubeError> {
        Ok(CreateCubeArgs {
            container: params.parse_required("container")?,
            measure: params.get("measure").unwrap_or("measure").to_string(),
            measure_type: params.parse_or("measure_type", DType::Double)?,
            dims: parse_dims(params)?,
            ndbms: positive(params, "ndbms", 1)?,
            ndb: positive(params, "ndb", 1)?,
            nfrag: positive(params, "nfrag", 1)?,
            compressed: params.flag("compressed", false)?,
            seed: params.parse_or("seed", 0)?,
            description: params.get("description").map(str::to_string),
        })
    }

    fn inputs(&self, _args: &Self::Args) -> Vec<String> {
        Vec::new()
    }

    fn output_container(&self, args: &Self::Args) -> Option<ContainerId> {
        Some(args.container)
    }

    async fn init(
        &self,
        args: &Self::Args,
        scope: &mut InitScope<'_>,
    ) -> Result<InitOutcome<Self::Plan>, CubeError> {
        let available = scope.catalog().dbms_instances().await?;
        if args.ndbms > available.len() as u64 {
            return Err(invalid(
                "ndbms",
                format!("only {} storage servers are available", available.len()),
            ));
        }
        let rows = args
            .explicit()
            .iter()
            .try_fold(1u64, |rows, (_, size)| rows.checked_mul(*size))
            .ok_or_else(|| invalid("dim_sizes", "too many rows"))?;
        let total = args
            .ndbms
            .checked_mul(args.ndb)
            .and_then(|dbs| dbs.checked_mul(args.nfrag))
            .ok_or_else(|| invalid("nfrag", "too many fragments"))?;
        let tuples_per_fragment = rows.div_ceil(total);
        // Every fragment must receive at least one row.
        let filled = (total - 1).checked_mul(tuples_per_fragment);
        if filled.map_or(true, |filled| filled >= rows) {
            return Err(invalid(
                "nfrag",
                format!("{total} fragments cannot be filled from {rows} rows"),
            ));
        }

        let explicit = args.explicit().len();
        let dimensions = args
            .dims
            .iter()
            .enumerate()
            .map(|(position, (name, size))| Dimension::indexed(name, *size, position < explicit))
            .collect();
        let cube = NewDatacube {
            container_id: scope.container_id(),
            measure: args.measure.clone(),
            measure_type: args.measure_type,
            fragment_ids: FragmentIds::build(1, 1, total),
            tuples_per_fragment,
            rows,
            compressed: args.compressed,
            description: args.description.clone(),
        };
        let id = scope.create_output(cube, dimensions).await?;

        let mut dbs = Vec::new();
        for dbms in available.iter().take(args.ndbms as usize) {
            for _ in 0..args.ndb {
                let name = format!("cube{id}_db{}", dbs.len() + 1);
                let db = scope.catalog().create_db_instance(dbms.id, &name, id).await?;
                dbs.push(Placement {
                    dbms: dbms.clone(),
                    db,
                });
            }
        }

        Ok(InitOutcome {
            plan: CreateCubePlan {
                dbs,
                nfrag: args.nfrag,
                tuples_per_fragment,
                rows,
                array_length: args.array_length(),
                seed: args.seed,
            },
            work: FragmentIds::build(1, 1, total),
            measure_type: args.measure_type,
            compressed: args.compressed,
            row_bytes: args.array_length() * args.measure_type.size_of() as u64,
        })
    }

    fn place(
        &self,
        _args: &Self::Args,
        plan: &Self::Plan,
        relative_index: u64,
    ) -> Result<Placement, CubeError> {
        let db = relative_index.saturating_sub(1) / plan.nfrag;
        plan.dbs.get(db as usize).cloned().ok_or_else(|| {
            CubeError::Catalog(format!("no database for fragment {relative_index}"))
        })
    }

    async fn execute(
        &self,
        _args: &Self::Args,
        plan: &Self::Plan,
        item: &WorkItem,
        executor: &mut Executor<'_>,
    ) -> Result<(), CubeError> {
        let tuples = plan.tuples_per_fragment;
        let primitive = Primitive::Fill {
            key_start: (item.relative_index - 1) * tuples + 1,
            key_end: (item.relative_index * tuples).min(plan.rows),
            array_length: plan.array_length,
            seed: plan.seed,
        };
        executor
            .write(
                item,
                FragmentTask {
                    relative_index: item.relative_index,
                    primitive,
                    row_filter: None,
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::catalog::Catalog;
    use crate::engine::run_operator;
    use crate::error::Status;
    use crate::test_utils;

    fn params(env: &test_utils::TestEnv) -> OperatorParams {
        OperatorParams::new()
            .with("container", env.container.id.to_string())
            .with("measure", "tas")
            .with("dims", "lat|lon|time")
            .with("dim_sizes", "4|4|3")
    }

    #[tokio::test]
    async fn create_on_two_servers() {
        let env = test_utils::setup(2).await;
        let params = params(&env)
            .with("ndbms", "2")
            .with("ndb", "2")
            .with("nfrag", "2");
        let report = run_operator(CreateCube, params, 3, &env.backends)
            .await
            .unwrap();
        assert_eq!(Status::Success, report.status, "{report:?}");

        let cube = env.cube(&test_utils::output_pid(&report)).await;
        assert_eq!("tas", cube.measure);
        assert_eq!(16, cube.rows);
        assert_eq!(2, cube.tuples_per_fragment);
        assert_eq!("1:8", cube.fragment_ids.to_string());
        assert_eq!(vec![4, 4], cube.explicit_sizes());
        assert_eq!(3, cube.array_length());
        assert_eq!(4, env.catalog.db_count().await);
        assert_eq!(8, env.catalog.fragment_count().await);
        assert_eq!(8, env.storage.fragment_count().await);

        let layout = env
            .catalog
            .fragment_layout(cube.id, &cube.fragment_ids)
            .await
            .unwrap();
        assert_eq!(2, layout.dbms.len());
        for fragment in &layout.fragments {
            assert_eq!(2, fragment.rows());
            assert_eq!(2 * fragment.relative_index, fragment.key_end);
        }
    }

    #[tokio::test]
    async fn generated_values() {
        let env = test_utils::setup(1).await;
        let params = params(&env).with("nfrag", "3").with("seed", "7");
        let report = run_operator(CreateCube, params, 2, &env.backends)
            .await
            .unwrap();
        let pid = test_utils::output_pid(&report);
        let values = env.values(&pid).await;
        assert_eq!((1..=16).collect::<Vec<u64>>(), values.iter().map(|(key, _)| *key).collect::<Vec<_>>());
        for (key, row) in &values {
            assert_eq!(3, row.len());
            for (j, value) in row.iter().enumerate() {
                assert_eq!(crate::kernels::fill_value(*key, j as u64, 7), *value);
            }
        }
        // The last of 3 fragments holds the 4 remaining rows.
        let cube = env.cube(&pid).await;
        assert_eq!(6, cube.tuples_per_fragment);
    }

    #[tokio::test]
    async fn compressed_cube_has_same_values() {
        let env = test_utils::setup(1).await;
        let plain = run_operator(CreateCube, params(&env), 1, &env.backends)
            .await
            .unwrap();
        let compressed = run_operator(
            CreateCube,
            params(&env).with("compressed", "yes"),
            1,
            &env.backends,
        )
        .await
        .unwrap();
        let compressed = test_utils::output_pid(&compressed);
        assert!(env.cube(&compressed).await.compressed);
        assert_eq!(
            env.values(&test_utils::output_pid(&plain)).await,
            env.values(&compressed).await
        );
    }

    #[tokio::test]
    async fn integer_measure() {
        let env = test_utils::setup(1).await;
        let params = params(&env).with("measure_type", "INT");
        let report = run_operator(CreateCube, params, 2, &env.backends)
            .await
            .unwrap();
        let cube = env.cube(&test_utils::output_pid(&report)).await;
        assert_eq!(DType::Int, cube.measure_type);
        assert_eq!(12, cube.row_bytes());
    }

    #[tokio::test]
    async fn too_many_servers() {
        let env = test_utils::setup(1).await;
        let report = run_operator(CreateCube, params(&env).with("ndbms", "2"), 2, &env.backends)
            .await
            .unwrap();
        assert_eq!(Status::InvalidParam, report.status);
        assert!(report.error.unwrap().contains("ndbms"));
        assert_eq!(0, env.catalog.datacube_count().await);
    }

    #[tokio::test]
    async fn too_many_fragments() {
        let env = test_utils::setup(1).await;
        let params = params(&env).with("ndb", "4").with("nfrag", "5");
        let report = run_operator(CreateCube, params, 2, &env.backends)
            .await
            .unwrap();
        assert_eq!(Status::InvalidParam, report.status);
        assert_eq!(0, env.catalog.datacube_count().await);
        assert_eq!(0, env.catalog.db_count().await);
    }

    #[tokio::test]
    async fn fragment_count_overflow() {
        let env = test_utils::setup(1).await;
        let huge = (1_u64 << 32).to_string();
        let params = params(&env).with("ndb", huge.as_str()).with("nfrag", huge.as_str());
        let report = run_operator(CreateCube, params, 2, &env.backends)
            .await
            .unwrap();
        assert_eq!(Status::InvalidParam, report.status);
        assert!(report.error.unwrap().contains("nfrag"));
        assert_eq!(0, env.catalog.datacube_count().await);
    }

    #[test]
    fn dimension_parameters() {
        let base = OperatorParams::new().with("container", "1");
        let parse = |params: OperatorParams| CreateCube.parse_args(&params);
        assert!(matches!(
            parse(base.clone().with("dims", "a|b").with("dim_sizes", "2")),
            Err(CubeError::InvalidParam { .. })
        ));
        assert!(matches!(
            parse(base.clone().with("dims", "a").with("dim_sizes", "2")),
            Err(CubeError::InvalidParam { .. })
        ));
        assert!(matches!(
            parse(base.clone().with("dims", "a|b").with("dim_sizes", "2|0")),
            Err(CubeError::InvalidParam { .. })
        ));
        assert!(matches!(
            parse(base.clone().with("dims", "a|b")),
            Err(CubeError::MissingParam(_))
        ));
        assert!(matches!(
            parse(
                base.clone()
                    .with("dims", "a|b")
                    .with("dim_sizes", "2|3")
                    .with("measure_type", "complex")
            ),
            Err(CubeError::InvalidParam { .. })
        ));
        let args = parse(base.with("dims", "a|b|c").with("dim_sizes", "2|3|5")).unwrap();
        assert_eq!(2, args.explicit().len());
        assert_eq!(5, args.array_length());
        assert_eq!(DType::Double, args.measure_type);
    }
}
