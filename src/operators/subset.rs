//! `subset`: select index or coordinate ranges along any dimension.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::coordinates::resolve_by_dtype;
use crate::engine::{Executor, FragmentTask, InitOutcome, InitScope, Operator, WorkItem};
use crate::error::CubeError;
use crate::kernels::Primitive;
use crate::models::{Dimension, NewDatacube, OperatorParams};
use crate::operators::input_cube;
use crate::subset::{count_selected, Subset};

pub struct SubsetOp;

/// How filters address a dimension
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SubsetType {
    /// 1-based indices
    Index,
    /// Coordinate values
    Coord,
}

#[derive(Debug)]
pub struct SubsetArgs {
    cube: String,
    /// Filter expression per dimension name
    filters: Vec<(String, String)>,
    subset_type: SubsetType,
    offset: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubsetPlan {
    /// Explicit sizes of the input, outer-first
    sizes: Vec<u64>,
    /// Index expression per explicit dimension
    filters: Vec<String>,
    /// Index expression over the measure array
    implicit: String,
    array_length: u64,
}

fn invalid(name: &str, reason: impl Into<String>) -> CubeError {
    CubeError::InvalidParam {
        name: name.to_string(),
        reason: reason.into(),
    }
}

impl SubsetArgs {
    fn filter_of(&self, dim: &str) -> Option<&str> {
        self.filters
            .iter()
            .find(|(name, _)| name == dim)
            .map(|(_, filter)| filter.as_str())
    }

    /// Resolve the filter of one dimension onto indices.
    fn resolve(&self, dim: &Dimension) -> Result<Subset, CubeError> {
        let Some(expr) = self.filter_of(&dim.name) else {
            return Ok(Subset::full(dim.size));
        };
        match self.subset_type {
            SubsetType::Index => Subset::parse(expr, dim.size),
            SubsetType::Coord => {
                Ok(resolve_by_dtype(expr, dim.coord_type, &dim.labels, self.offset)?.subset)
            }
        }
    }
}

#[async_trait]
impl Operator for SubsetOp {
    type Args = SubsetArgs;
    type Plan = SubsetPlan;
    const NAME: &'static str = "subset";

    fn parse_args(&self, params: &OperatorParams) -> Result<Self::Args, CubeError> {
        let dims = params
            .list("subset_dims")
            .ok_or_else(|| CubeError::MissingParam("subset_dims".to_string()))?;
        let filters = params
            .list("subset_filter")
            .ok_or_else(|| CubeError::MissingParam("subset_filter".to_string()))?;
        if dims.len() != filters.len() {
            return Err(invalid(
                "subset_filter",
                format!("{} filters for {} dimensions", filters.len(), dims.len()),
            ));
        }
        for (position, dim) in dims.iter().enumerate() {
            if dims[..position].contains(dim) {
                return Err(invalid("subset_dims", format!("dimension {dim} is repeated")));
            }
        }
        let offset: f64 = params.parse_or("offset", 0.0)?;
        if offset.is_nan() || offset < 0.0 {
            return Err(invalid("offset", "must not be negative"));
        }
        Ok(SubsetArgs {
            cube: input_cube(params)?,
            filters: dims
                .iter()
                .zip(filters)
                .map(|(dim, filter)| (dim.to_string(), filter.to_string()))
                .collect(),
            subset_type: params.parse_or("subset_type", SubsetType::Index)?,
            offset,
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
        for (name, _) in &args.filters {
            if !input.dimensions.iter().any(|dim| &dim.name == name) {
                return Err(invalid("subset_dims", format!("unknown dimension {name}")));
            }
        }

        let mut dimensions = Vec::with_capacity(input.dimensions.len());
        let mut filters = Vec::new();
        let mut implicit = Subset::full(input.array_length());
        for dim in &input.dimensions {
            let subset = args.resolve(dim)?;
            let indices = subset.distinct_indices(dim.size);
            if indices.is_empty() {
                return Err(invalid(
                    "subset_filter",
                    format!("no index of dimension {} is selected", dim.name),
                ));
            }
            dimensions.push(Dimension {
                size: indices.len() as u64,
                labels: dim.select_labels(&indices)?,
                ..dim.clone()
            });
            if dim.explicit {
                filters.push(subset);
            } else {
                implicit = subset;
            }
        }

        let sizes = input.explicit_sizes();
        // Project row ids onto each explicit dimension, innermost sizes first.
        let projections: Vec<Vec<u64>> = (0..sizes.len())
            .map(|d| sizes[d..].iter().rev().copied().collect())
            .collect();
        let selection: Vec<(&Subset, &[u64])> = filters
            .iter()
            .zip(&projections)
            .map(|(filter, sizes)| (filter, sizes.as_slice()))
            .collect();
        let rows = count_selected(input.rows, &selection);

        let output = NewDatacube {
            rows,
            ..NewDatacube::derived_from(&input)
        };
        scope.create_output(output, dimensions).await?;
        Ok(InitOutcome {
            plan: SubsetPlan {
                sizes,
                filters: filters.iter().map(Subset::to_string).collect(),
                implicit: implicit.to_string(),
                array_length: input.array_length(),
            },
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
        let filters = plan
            .filters
            .iter()
            .zip(&plan.sizes)
            .map(|(filter, size)| Subset::parse(filter, *size))
            .collect::<Result<Vec<_>, _>>()?;
        let primitive = Primitive::Subset {
            sizes: plan.sizes.clone(),
            filters,
            implicit: Subset::parse(&plan.implicit, plan.array_length)?,
        };
        let task = FragmentTask {
            relative_index: item.relative_index,
            primitive,
            row_filter: None,
        };
        executor.write(item, task).await?;
        Ok(())
    }
}
