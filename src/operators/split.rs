//! `split`: divide every fragment into `nsplit` smaller fragments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::{Executor, FragmentTask, InitOutcome, InitScope, Operator, WorkItem};
use crate::error::CubeError;
use crate::fragment_ids::FragmentIds;
use crate::kernels::Primitive;
use crate::models::{NewDatacube, OperatorParams};
use crate::operators::{input_cube, positive};
use crate::partition::PartitionPlan;

pub struct Split;

#[derive(Debug)]
pub struct SplitArgs {
    cube: String,
    nsplit: u64,
    /// Local helpers per worker
    nthreads: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SplitPlan {
    nsplit: u64,
    /// Fragment ids of the input, fixing the position of each fragment
    input_ids: FragmentIds,
}

#[async_trait]
impl Operator for Split {
    type Args = SplitArgs;
    type Plan = SplitPlan;
    const NAME: &'static str = "split";

    fn parse_args(&self, params: &OperatorParams) -> Result<Self::Args, CubeError> {
        Ok(SplitArgs {
            cube: input_cube(params)?,
            nsplit: positive(params, "nsplit", 1)?,
            nthreads: usize::try_from(positive(params, "nthreads", 1)?)?,
        })
    }

    fn inputs(&self, args: &Self::Args) -> Vec<String> {
        vec![args.cube.clone()]
    }

    async fn init(
        &self,
        args: &Self::Args,
        scope: &mut InitScope<'_>,
    ) -> Result<InitOutcome<Self::Plan>, CubeError> {
        let input = scope.input(0)?.clone();
        if input.tuples_per_fragment < args.nsplit {
            return Err(CubeError::InvalidParam {
                name: "nsplit".to_string(),
                reason: format!(
                    "fragments of {} rows cannot be split in {}",
                    input.tuples_per_fragment, args.nsplit
                ),
            });
        }
        let output = NewDatacube {
            fragment_ids: FragmentIds::build(1, 1, input.fragment_ids.count() * args.nsplit),
            tuples_per_fragment: (input.tuples_per_fragment + args.nsplit - 1) / args.nsplit,
            ..NewDatacube::derived_from(&input)
        };
        scope.create_output(output, input.dimensions.clone()).await?;
        Ok(InitOutcome {
            plan: SplitPlan {
                nsplit: args.nsplit,
                input_ids: input.fragment_ids.clone(),
            },
            work: input.fragment_ids.clone(),
            measure_type: input.measure_type,
            compressed: input.compressed,
            row_bytes: input.row_bytes(),
        })
    }

    fn helpers(&self, args: &Self::Args) -> usize {
        args.nthreads
    }

    async fn execute(
        &self,
        _args: &Self::Args,
        plan: &Self::Plan,
        item: &WorkItem,
        executor: &mut Executor<'_>,
    ) -> Result<(), CubeError> {
        let fragment = item
            .sources
            .first()
            .map(|source| &source.fragment)
            .ok_or_else(|| CubeError::Catalog("split needs a source fragment".to_string()))?;
        let rows = fragment.rows();
        if rows < plan.nsplit {
            return Err(CubeError::InvalidParam {
                name: "nsplit".to_string(),
                reason: format!(
                    "fragment {} holds only {rows} rows",
                    fragment.relative_index
                ),
            });
        }
        let position = plan
            .input_ids
            .position(fragment.relative_index)
            .ok_or_else(|| {
                CubeError::Catalog(format!(
                    "fragment {} is not part of the input",
                    fragment.relative_index
                ))
            })?;
        for part in 0..plan.nsplit {
            let share = PartitionPlan::plan(rows, plan.nsplit, part);
            let first = fragment.key_start + share.start_offset;
            let task = FragmentTask {
                relative_index: position * plan.nsplit + part + 1,
                primitive: Primitive::Copy,
                row_filter: Some(format!("{first}:{}", first + share.share - 1)),
            };
            executor.write(item, task).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::catalog::Catalog;
    use crate::engine::run_operator;
    use crate::error::Status;
    use crate::report::Report;
    use crate::test_utils::{self, TestEnv};

    async fn split(env: &TestEnv, params: OperatorParams, workers: usize) -> Report {
        run_operator(Split, params, workers, &env.backends)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn split_in_two() {
        let env = test_utils::setup(2).await;
        let pid = env.create_cube(4).await;
        let params = OperatorParams::new().with("cube", &pid).with("nsplit", "2");
        let report = split(&env, params, 3).await;
        assert_eq!(Status::Success, report.status, "{report:?}");
        let output = test_utils::output_pid(&report);

        let cube = env.cube(&output).await;
        assert_eq!("1:8", cube.fragment_ids.to_string());
        assert_eq!(1, cube.tuples_per_fragment);
        assert_eq!(8, cube.rows);
        assert_eq!(12, env.catalog.fragment_count().await);
        assert_eq!(env.values(&pid).await, env.values(&output).await);

        let layout = env
            .catalog
            .fragment_layout(cube.id, &cube.fragment_ids)
            .await
            .unwrap();
        for fragment in &layout.fragments {
            assert_eq!(fragment.relative_index, fragment.key_start);
            assert_eq!(1, fragment.rows());
        }
    }

    #[tokio::test]
    async fn uneven_split_with_helpers() {
        let env = test_utils::setup(1).await;
        let pid = env
            .create(
                OperatorParams::new()
                    .with("dims", "x|t")
                    .with("dim_sizes", "28|2")
                    .with("nfrag", "4"),
            )
            .await;
        let params = OperatorParams::new()
            .with("cube", &pid)
            .with("nsplit", "3")
            .with("nthreads", "3");
        let report = split(&env, params, 2).await;
        assert_eq!(Status::Success, report.status, "{report:?}");
        let output = test_utils::output_pid(&report);
        let cube = env.cube(&output).await;
        assert_eq!(12, cube.fragment_ids.count());
        assert_eq!(3, cube.tuples_per_fragment);

        let layout = env
            .catalog
            .fragment_layout(cube.id, &cube.fragment_ids)
            .await
            .unwrap();
        let rows: Vec<u64> = layout.fragments.iter().map(|f| f.rows()).collect();
        assert_eq!(vec![3, 2, 2, 3, 2, 2, 3, 2, 2, 3, 2, 2], rows);
        assert_eq!(env.values(&pid).await, env.values(&output).await);
    }

    #[tokio::test]
    async fn too_many_parts() {
        let env = test_utils::setup(1).await;
        let pid = env.create_cube(2).await;
        for nsplit in ["3", "0"] {
            let params = OperatorParams::new().with("cube", &pid).with("nsplit", nsplit);
            let report = split(&env, params, 2).await;
            assert_eq!(Status::InvalidParam, report.status);
        }
        assert_eq!(1, env.catalog.datacube_count().await);
    }
}
