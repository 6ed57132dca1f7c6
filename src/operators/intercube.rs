//! `intercube`: combine two comparable datacubes element by element.

use async_trait::async_trait;

use crate::engine::{Executor, FragmentTask, InitOutcome, InitScope, Operator, WorkItem};
use crate::error::CubeError;
use crate::kernels::{IntercubeKind, Primitive};
use crate::matcher::check_comparable;
use crate::models::{NewDatacube, OperatorParams};
use crate::operators::input_cube;

pub struct Intercube;

#[derive(Debug)]
pub struct IntercubeArgs {
    cube: String,
    cube2: String,
    operation: IntercubeKind,
}

#[async_trait]
impl Operator for Intercube {
    type Args = IntercubeArgs;
    type Plan = IntercubeKind;
    const NAME: &'static str = "intercube";

    fn parse_args(&self, params: &OperatorParams) -> Result<Self::Args, CubeError> {
        Ok(IntercubeArgs {
            cube: input_cube(params)?,
            cube2: params.required("cube2")?.to_string(),
            operation: match params.get("operation") {
                Some(operation) => operation.parse()?,
                None => IntercubeKind::Sub,
            },
        })
    }

    fn inputs(&self, args: &Self::Args) -> Vec<String> {
        vec![args.cube.clone(), args.cube2.clone()]
    }

    async fn init(
        &self,
        args: &Self::Args,
        scope: &mut InitScope<'_>,
    ) -> Result<InitOutcome<Self::Plan>, CubeError> {
        let first = scope.input(0)?.clone();
        check_comparable(&first, scope.input(1)?)?;
        scope
            .create_output(NewDatacube::derived_from(&first), first.dimensions.clone())
            .await?;
        Ok(InitOutcome {
            plan: args.operation,
            work: first.fragment_ids.clone(),
            measure_type: first.measure_type,
            compressed: first.compressed,
            row_bytes: first.row_bytes(),
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
            primitive: Primitive::Intercube(*plan),
            row_filter: None,
        };
        executor.write(item, task).await?;
        Ok(())
    }
}
