//! `reduce`: collapse the implicit dimension with a reduction.

use async_trait::async_trait;

use crate::engine::{Executor, FragmentTask, InitOutcome, InitScope, Operator, WorkItem};
use crate::error::CubeError;
use crate::kernels::{Primitive, ReduceKind};
use crate::models::{DType, Dimension, NewDatacube, OperatorParams};
use crate::operators::input_cube;

pub struct Reduce;

#[derive(Debug)]
pub struct ReduceArgs {
    cube: String,
    operation: ReduceKind,
}

#[async_trait]
impl Operator for Reduce {
    type Args = ReduceArgs;
    type Plan = ReduceKind;
    const NAME: &'static str = "reduce";

    fn parse_args(&self, params: &OperatorParams) -> Result<Self::Args, CubeError> {
        Ok(ReduceArgs {
            cube: input_cube(params)?,
            operation: params.required("operation")?.parse()?,
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
        let mut output = NewDatacube::derived_from(&input);
        if args.operation == ReduceKind::Count {
            output.measure_type = DType::Long;
        }
        let dimensions = input
            .dimensions
            .iter()
            .map(|dim| -> Result<Dimension, CubeError> {
                if dim.explicit {
                    return Ok(dim.clone());
                }
                Ok(Dimension {
                    size: 1,
                    labels: dim.select_labels(&[1])?,
                    ..dim.clone()
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        scope.create_output(output, dimensions).await?;
        Ok(InitOutcome {
            plan: args.operation,
            work: input.fragment_ids.clone(),
            measure_type: input.measure_type,
            compressed: input.compressed,
            row_bytes: input.row_bytes(),
        })
    }

    async fn execute(
        &self,
        _args: &Self::Args,
        plan: &Self::Plan,
        item: &WorkItem,
        executor: &mut Executor<'_>,
    ) -> Result<(), CubeError> {
        let task = FragmentTask {
            relative_index: item.relative_index,
            primitive: Primitive::Reduce(*plan),
            row_filter: None,
        };
        executor.write(item, task).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::run_operator;
    use crate::error::Status;
    use crate::test_utils;

    async fn reduce(env: &test_utils::TestEnv, pid: &str, operation: &str) -> String {
        let params = OperatorParams::new()
            .with("cube", pid)
            .with("operation", operation);
        let report = run_operator(Reduce, params, 3, &env.backends).await.unwrap();
        assert_eq!(Status::Success, report.status, "{report:?}");
        test_utils::output_pid(&report)
    }

    #[tokio::test]
    async fn sum_and_max() {
        let env = test_utils::setup(2).await;
        let pid = env.create_cube(4).await;
        let input = env.values(&pid).await;

        let sum = env.values(&reduce(&env, &pid, "sum").await).await;
        let max = env.values(&reduce(&env, &pid, "MAX").await).await;
        assert_eq!(8, sum.len());
        for ((key, row), ((sum_key, sum), (_, max))) in input.iter().zip(sum.iter().zip(&max)) {
            assert_eq!(key, sum_key);
            let expected: f64 = row.iter().sum();
            assert!((expected - sum[0]).abs() < 1e-9);
            assert_eq!(row.iter().cloned().fold(f64::MIN, f64::max), max[0]);
        }
    }

    #[tokio::test]
    async fn output_metadata() {
        let env = test_utils::setup(1).await;
        let pid = env.create_cube(2).await;
        let output = env.cube(&reduce(&env, &pid, "avg").await).await;
        let input = env.cube(&pid).await;
        assert_eq!(1, output.array_length());
        assert_eq!(input.explicit_sizes(), output.explicit_sizes());
        assert_eq!(input.fragment_ids, output.fragment_ids);
        assert_eq!(DType::Double, output.measure_type);
        let implicit = output.implicit_dim().unwrap();
        assert_eq!(8, implicit.labels.len());
    }

    #[tokio::test]
    async fn count_yields_long() {
        let env = test_utils::setup(1).await;
        let pid = env.create_cube(2).await;
        let output = reduce(&env, &pid, "count").await;
        assert_eq!(DType::Long, env.cube(&output).await.measure_type);
        for (_, row) in env.values(&output).await {
            assert_eq!(vec![4.0], row);
        }
    }

    #[tokio::test]
    async fn unknown_operation() {
        let env = test_utils::setup(1).await;
        let pid = env.create_cube(2).await;
        let params = OperatorParams::new()
            .with("cube", pid)
            .with("operation", "median");
        let report = run_operator(Reduce, params, 2, &env.backends).await.unwrap();
        assert_eq!(Status::InvalidParam, report.status);
        assert_eq!(1, env.catalog.datacube_count().await);
    }
}
