//! `cubesize`: measure the stored size of a datacube.

use async_trait::async_trait;
use byte_unit::{Byte, Unit};
use strum_macros::{Display, EnumString};

use crate::engine::{CommitScope, Executor, InitOutcome, InitScope, Operator, WorkItem};
use crate::error::CubeError;
use crate::models::OperatorParams;
use crate::operators::input_cube;
use crate::report::Report;

pub struct CubeSize;

/// Unit of the reported size. Multiples are powers of 1024.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum SizeUnit {
    B,
    KB,
    MB,
    GB,
    TB,
    PB,
}

impl SizeUnit {
    fn unit(self) -> Unit {
        match self {
            SizeUnit::B => Unit::B,
            SizeUnit::KB => Unit::KiB,
            SizeUnit::MB => Unit::MiB,
            SizeUnit::GB => Unit::GiB,
            SizeUnit::TB => Unit::TiB,
            SizeUnit::PB => Unit::PiB,
        }
    }
}

#[derive(Debug)]
pub struct CubeSizeArgs {
    cube: String,
    unit: SizeUnit,
}

#[async_trait]
impl Operator for CubeSize {
    type Args = CubeSizeArgs;
    type Plan = ();
    const NAME: &'static str = "cubesize";

    fn parse_args(&self, params: &OperatorParams) -> Result<Self::Args, CubeError> {
        Ok(CubeSizeArgs {
            cube: input_cube(params)?,
            unit: params.parse_or("byte_unit", SizeUnit::B)?,
        })
    }

    fn inputs(&self, args: &Self::Args) -> Vec<String> {
        vec![args.cube.clone()]
    }

    async fn init(
        &self,
        _args: &Self::Args,
        scope: &mut InitScope<'_>,
    ) -> Result<InitOutcome<()>, CubeError> {
        let input = scope.input(0)?;
        Ok(InitOutcome {
            plan: (),
            work: input.fragment_ids.clone(),
            measure_type: input.measure_type,
            compressed: input.compressed,
            row_bytes: 0,
        })
    }

    async fn execute(
        &self,
        _args: &Self::Args,
        _plan: &(),
        item: &WorkItem,
        executor: &mut Executor<'_>,
    ) -> Result<(), CubeError> {
        let bytes = executor.byte_size(item, 0).await?;
        executor.accumulate(i64::try_from(bytes)?);
        Ok(())
    }

    async fn commit(
        &self,
        args: &Self::Args,
        _plan: &(),
        scope: CommitScope<'_>,
    ) -> Result<Report, CubeError> {
        let input = scope
            .input_ids
            .first()
            .copied()
            .ok_or_else(|| CubeError::Catalog("cubesize has no input".to_string()))?;
        let bytes = u64::try_from(scope.accumulated)?;
        scope
            .backends
            .catalog
            .update_datacube_size(input, bytes)
            .await?;
        let size = Byte::from_u64(bytes)
            .get_adjusted_unit(args.unit.unit())
            .get_value();
        Ok(Report::new(Self::NAME).grid(
            "cubesize",
            "Datacube Size",
            &["PID", "SIZE", "UNIT"],
            vec![vec![
                scope.input_pid(0)?,
                size.to_string(),
                args.unit.to_string(),
            ]],
        ))
    }
}
