//! Array operators.
//!
//! Each operator implements the [Operator](crate::engine::Operator) trait and is invoked by name
//! through [invoke].

pub mod create_cube;
pub mod cube_size;
pub mod intercube;
pub mod reduce;
pub mod split;
pub mod subset;

use crate::engine::{run_operator, Backends, Operator};
use crate::error::CubeError;
use crate::models::OperatorParams;
use crate::report::Report;

use create_cube::CreateCube;
use cube_size::CubeSize;
use intercube::Intercube;
use reduce::Reduce;
use split::Split;
use subset::SubsetOp;

/// Names of the registered operators.
pub const OPERATORS: &[&str] = &[
    CreateCube::NAME,
    CubeSize::NAME,
    Intercube::NAME,
    Reduce::NAME,
    Split::NAME,
    SubsetOp::NAME,
];

/// Run the operator called `name` on a group of `workers` workers.
///
/// Operator names are matched case-insensitively.
pub async fn invoke(
    name: &str,
    params: OperatorParams,
    workers: usize,
    backends: &Backends,
) -> Result<Report, CubeError> {
    let workers = workers.max(1);
    match name.to_ascii_lowercase().as_str() {
        "createcube" => run_operator(CreateCube, params, workers, backends).await,
        "cubesize" => run_operator(CubeSize, params, workers, backends).await,
        "intercube" => run_operator(Intercube, params, workers, backends).await,
        "reduce" => run_operator(Reduce, params, workers, backends).await,
        "split" => run_operator(Split, params, workers, backends).await,
        "subset" => run_operator(SubsetOp, params, workers, backends).await,
        _ => Err(CubeError::UnsupportedOperator {
            operator: name.to_string(),
        }),
    }
}

/// PID of the input datacube, under its usual aliases.
pub(crate) fn input_cube(params: &OperatorParams) -> Result<String, CubeError> {
    Ok(params.required_any(&["cube", "datacube_input"])?.to_string())
}

/// A count parameter that must be at least one.
pub(crate) fn positive(params: &OperatorParams, key: &str, default: u64) -> Result<u64, CubeError> {
    let value = params.parse_or(key, default)?;
    if value == 0 {
        return Err(CubeError::InvalidParam {
            name: key.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}
