//! Fragment transformation primitives.
//!
//! Storage servers evaluate these kernels while executing a transform request. A primitive is
//! addressed by name with a list of string arguments, so that requests stay opaque to the engine.
//! Each row holds a flat key and a measure array of the datacube's element type.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use ndarray::{Array1, Zip};
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::array;
use crate::error::CubeError;
use crate::models::DType;
use crate::subset::{self, Subset};

/// Trait for measure elements.
pub trait Element:
    Clone
    + Copy
    + PartialOrd
    + FromPrimitive
    + ToPrimitive
    + std::fmt::Debug
    + zerocopy::AsBytes
    + zerocopy::FromBytes
{
}

/// Blanket implementation of Element.
impl<T> Element for T where
    T: Clone
        + Copy
        + PartialOrd
        + FromPrimitive
        + ToPrimitive
        + std::fmt::Debug
        + zerocopy::AsBytes
        + zerocopy::FromBytes
{
}

/// One stored row: a flat key and its raw measure array
#[derive(Clone, Debug, PartialEq)]
pub struct RawRow {
    pub key: u64,
    pub measure: Bytes,
}

/// Rows produced by a kernel
#[derive(Clone, Debug, PartialEq)]
pub struct KernelOutput {
    pub measure_type: DType,
    pub rows: Vec<RawRow>,
}

/// Per-row reduction of the measure array
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReduceKind {
    Sum,
    Avg,
    Max,
    Min,
    Count,
}

/// Element-wise combination of two measure arrays
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IntercubeKind {
    Sum,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

fn parse_kind<T: Copy + fmt::Display>(name: &str, kinds: &[T]) -> Result<T, CubeError> {
    kinds
        .iter()
        .copied()
        .find(|kind| kind.to_string().eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| CubeError::InvalidParam {
            name: "operation".to_string(),
            reason: format!("unknown operation \"{name}\""),
        })
}

impl FromStr for ReduceKind {
    type Err = CubeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        use ReduceKind::*;
        parse_kind(name, &[Sum, Avg, Max, Min, Count])
    }
}

impl FromStr for IntercubeKind {
    type Err = CubeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        use IntercubeKind::*;
        parse_kind(name, &[Sum, Sub, Mul, Div, Max, Min])
    }
}

/// A fragment transformation
#[derive(Clone, Debug, PartialEq)]
pub enum Primitive {
    /// Generate rows `key_start..=key_end` of pseudo-random values
    Fill {
        key_start: u64,
        key_end: u64,
        array_length: u64,
        seed: u64,
    },
    /// Copy the rows of the first source
    Copy,
    /// Reduce each measure array to one element
    Reduce(ReduceKind),
    /// Keep rows and elements selected by per-dimension filters and renumber the keys
    Subset {
        /// Explicit dimension sizes, outer-first
        sizes: Vec<u64>,
        /// One filter per explicit dimension, outer-first
        filters: Vec<Subset>,
        /// Filter over the measure array
        implicit: Subset,
    },
    /// Combine the rows of two sources element by element
    Intercube(IntercubeKind),
}

impl Primitive {
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Fill { .. } => "fill",
            Primitive::Copy => "copy",
            Primitive::Reduce(_) => "reduce",
            Primitive::Subset { .. } => "subset",
            Primitive::Intercube(_) => "intercube",
        }
    }

    /// Arguments of the primitive in request form.
    pub fn args(&self) -> Vec<String> {
        match self {
            Primitive::Fill {
                key_start,
                key_end,
                array_length,
                seed,
            } => [key_start, key_end, array_length, seed]
                .iter()
                .map(|v| v.to_string())
                .collect(),
            Primitive::Copy => Vec::new(),
            Primitive::Reduce(kind) => vec![kind.to_string()],
            Primitive::Subset {
                sizes,
                filters,
                implicit,
            } => vec![
                sizes
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                filters
                    .iter()
                    .map(Subset::to_string)
                    .collect::<Vec<_>>()
                    .join("|"),
                implicit.to_string(),
            ],
            Primitive::Intercube(kind) => vec![kind.to_string()],
        }
    }

    /// Parse a primitive from its request form.
    pub fn parse(name: &str, args: &[String]) -> Result<Self, CubeError> {
        let invalid = |reason: &str| CubeError::Storage(format!("primitive {name}: {reason}"));
        let number = |value: &str| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|_| invalid(&format!("\"{value}\" is not a number")))
        };
        match (name, args) {
            ("fill", [key_start, key_end, array_length, seed]) => Ok(Primitive::Fill {
                key_start: number(key_start.as_str())?,
                key_end: number(key_end.as_str())?,
                array_length: number(array_length.as_str())?,
                seed: number(seed.as_str())?,
            }),
            ("copy", []) => Ok(Primitive::Copy),
            ("reduce", [kind]) => Ok(Primitive::Reduce(kind.parse()?)),
            ("subset", [sizes, filters, implicit]) => {
                let sizes = sizes
                    .split(',')
                    .map(number)
                    .collect::<Result<Vec<_>, _>>()?;
                let filters: Vec<&str> = filters.split('|').collect();
                if filters.len() != sizes.len() {
                    return Err(invalid("one filter per dimension is required"));
                }
                let filters = filters
                    .iter()
                    .zip(&sizes)
                    .map(|(filter, size)| Subset::parse(filter, *size))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Primitive::Subset {
                    sizes,
                    filters,
                    implicit: Subset::parse(implicit, 0)?,
                })
            }
            ("intercube", [kind]) => Ok(Primitive::Intercube(kind.parse()?)),
            _ => Err(invalid("unknown primitive or wrong argument count")),
        }
    }

    /// Apply the primitive to the rows of its sources.
    ///
    /// This method dispatches to `apply_t` based on the `measure_type`.
    pub fn apply(
        &self,
        measure_type: DType,
        sources: &[Vec<RawRow>],
    ) -> Result<KernelOutput, CubeError> {
        // Convert runtime data type into concrete types.
        match measure_type {
            DType::Byte => self.apply_t::<i8>(measure_type, sources),
            DType::Short => self.apply_t::<i16>(measure_type, sources),
            DType::Int => self.apply_t::<i32>(measure_type, sources),
            DType::Long => self.apply_t::<i64>(measure_type, sources),
            DType::Float => self.apply_t::<f32>(measure_type, sources),
            DType::Double => self.apply_t::<f64>(measure_type, sources),
        }
    }

    fn apply_t<T: Element>(
        &self,
        measure_type: DType,
        sources: &[Vec<RawRow>],
    ) -> Result<KernelOutput, CubeError> {
        let rows = match self {
            Primitive::Fill {
                key_start,
                key_end,
                array_length,
                seed,
            } => fill::<T>(*key_start, *key_end, *array_length, *seed)?,
            Primitive::Copy => first_source(sources)?.to_vec(),
            Primitive::Reduce(kind) => {
                let rows = reduce::<T>(*kind, first_source(sources)?)?;
                if *kind == ReduceKind::Count {
                    return Ok(KernelOutput {
                        measure_type: DType::Long,
                        rows,
                    });
                }
                rows
            }
            Primitive::Subset {
                sizes,
                filters,
                implicit,
            } => select::<T>(sizes, filters, implicit, first_source(sources)?)?,
            Primitive::Intercube(kind) => intercube::<T>(*kind, sources)?,
        };
        Ok(KernelOutput { measure_type, rows })
    }
}

fn first_source(sources: &[Vec<RawRow>]) -> Result<&[RawRow], CubeError> {
    sources
        .first()
        .map(Vec::as_slice)
        .ok_or_else(|| CubeError::Storage("primitive needs a source fragment".to_string()))
}

/// Convert a computed value back to the element type.
fn from_f64<T: Element>(value: f64) -> Result<T, CubeError> {
    T::from_f64(value)
        .filter(|v| v.to_f64().map_or(false, f64::is_finite))
        .ok_or_else(|| {
            CubeError::Storage(format!(
                "value {value} does not fit in {}",
                std::any::type_name::<T>()
            ))
        })
}

fn to_array<T: Element>(measure: &[u8]) -> Result<Array1<f64>, CubeError> {
    Ok(array::decode::<T>(measure)?
        .iter()
        .map(|v| v.to_f64().unwrap_or(f64::NAN))
        .collect())
}

/// Deterministic pseudo-random value in `[0, 100)` for element `j` of row `key`.
pub fn fill_value(key: u64, j: u64, seed: u64) -> f64 {
    let hash = key
        .wrapping_mul(7919)
        .wrapping_add(j.wrapping_mul(104_729))
        .wrapping_add(seed);
    (hash % 1000) as f64 / 10.0
}

fn fill<T: Element>(
    key_start: u64,
    key_end: u64,
    array_length: u64,
    seed: u64,
) -> Result<Vec<RawRow>, CubeError> {
    if key_start == 0 {
        return Ok(Vec::new());
    }
    (key_start..=key_end)
        .map(|key| {
            let values = (0..array_length)
                .map(|j| from_f64::<T>(fill_value(key, j, seed)))
                .collect::<Result<Vec<T>, _>>()?;
            Ok(RawRow {
                key,
                measure: array::encode(&values),
            })
        })
        .collect()
}

fn reduce<T: Element>(kind: ReduceKind, rows: &[RawRow]) -> Result<Vec<RawRow>, CubeError> {
    rows.iter()
        .map(|row| {
            let values = to_array::<T>(&row.measure)?;
            if values.is_empty() && kind != ReduceKind::Count {
                return Err(CubeError::Storage(format!(
                    "cannot perform {kind} on an empty array"
                )));
            }
            let measure = match kind {
                ReduceKind::Count => array::encode(&[values.len() as i64]),
                ReduceKind::Sum => array::encode(&[from_f64::<T>(values.sum())?]),
                ReduceKind::Avg => {
                    let mean = values.mean().unwrap_or(f64::NAN);
                    array::encode(&[from_f64::<T>(mean)?])
                }
                ReduceKind::Max => {
                    let max = values.fold(f64::NEG_INFINITY, |acc, v| acc.max(*v));
                    array::encode(&[from_f64::<T>(max)?])
                }
                ReduceKind::Min => {
                    let min = values.fold(f64::INFINITY, |acc, v| acc.min(*v));
                    array::encode(&[from_f64::<T>(min)?])
                }
            };
            Ok(RawRow {
                key: row.key,
                measure,
            })
        })
        .collect()
}

/// Keep selected rows and elements; keys are renumbered over the reduced dimension sizes.
fn select<T: Element>(
    sizes: &[u64],
    filters: &[Subset],
    implicit: &Subset,
    rows: &[RawRow],
) -> Result<Vec<RawRow>, CubeError> {
    if filters.len() != sizes.len() {
        return Err(CubeError::Storage(
            "one filter per dimension is required".to_string(),
        ));
    }
    let sizes: Vec<u64> = sizes.iter().rev().copied().collect();
    let filters: Vec<&Subset> = filters.iter().rev().collect();
    // ranks[d][i]: number of selected indices of dimension d up to and including i
    let mut ranks = Vec::with_capacity(sizes.len());
    for (size, filter) in sizes.iter().zip(&filters) {
        let mut table = vec![0; usize::try_from(*size)? + 1];
        let mut selected = 0;
        for (index, rank) in table.iter_mut().enumerate().skip(1) {
            if filter.contains(index as u64) {
                selected += 1;
            }
            *rank = selected;
        }
        ranks.push(table);
    }
    let new_sizes: Vec<u64> = ranks
        .iter()
        .map(|table| table.last().copied().unwrap_or(0))
        .collect();

    let mut selected_rows = Vec::new();
    for row in rows {
        let coordinates = subset::id_to_coordinates(row.key, &sizes);
        if !coordinates
            .iter()
            .zip(&filters)
            .all(|(coordinate, filter)| filter.contains(*coordinate))
        {
            continue;
        }
        let new_coordinates: Vec<u64> = coordinates
            .iter()
            .zip(&ranks)
            .map(|(coordinate, table)| {
                usize::try_from(*coordinate)
                    .ok()
                    .and_then(|c| table.get(c).copied())
                    .unwrap_or(0)
            })
            .collect();
        let values = array::decode::<T>(&row.measure)?;
        let kept: Vec<T> = values
            .iter()
            .enumerate()
            .filter(|(j, _)| implicit.contains(*j as u64 + 1))
            .map(|(_, v)| *v)
            .collect();
        selected_rows.push(RawRow {
            key: subset::coordinates_to_id(&new_coordinates, &new_sizes),
            measure: array::encode(&kept),
        });
    }
    Ok(selected_rows)
}

fn intercube<T: Element>(
    kind: IntercubeKind,
    sources: &[Vec<RawRow>],
) -> Result<Vec<RawRow>, CubeError> {
    let (a, b) = match sources {
        [a, b] => (a, b),
        _ => {
            return Err(CubeError::Storage(
                "intercube needs two source fragments".to_string(),
            ))
        }
    };
    if a.len() != b.len() {
        return Err(CubeError::Comparison(format!(
            "fragments hold {} and {} rows",
            a.len(),
            b.len()
        )));
    }
    a.iter()
        .zip(b)
        .map(|(row_a, row_b)| {
            if row_a.key != row_b.key {
                return Err(CubeError::Comparison(format!(
                    "row keys {} and {} differ",
                    row_a.key, row_b.key
                )));
            }
            let xa = to_array::<T>(&row_a.measure)?;
            let xb = to_array::<T>(&row_b.measure)?;
            if xa.len() != xb.len() {
                return Err(CubeError::Comparison(format!(
                    "measure arrays of row {} differ in length",
                    row_a.key
                )));
            }
            let combined: Array1<f64> = match kind {
                IntercubeKind::Sum => &xa + &xb,
                IntercubeKind::Sub => &xa - &xb,
                IntercubeKind::Mul => &xa * &xb,
                IntercubeKind::Div => &xa / &xb,
                IntercubeKind::Max => Zip::from(&xa).and(&xb).map_collect(|x, y| x.max(*y)),
                IntercubeKind::Min => Zip::from(&xa).and(&xb).map_collect(|x, y| x.min(*y)),
            };
            let values = combined
                .iter()
                .map(|v| from_f64::<T>(*v))
                .collect::<Result<Vec<T>, _>>()?;
            Ok(RawRow {
                key: row_a.key,
                measure: array::encode(&values),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row<T: Element>(key: u64, values: &[T]) -> RawRow {
        RawRow {
            key,
            measure: array::encode(values),
        }
    }

    fn values<T: Element>(row: &RawRow) -> Vec<T> {
        array::decode::<T>(&row.measure).unwrap()
    }

    #[test]
    fn args_round_trip_through_parse() {
        let primitives = [
            Primitive::Fill {
                key_start: 1,
                key_end: 4,
                array_length: 3,
                seed: 7,
            },
            Primitive::Copy,
            Primitive::Reduce(ReduceKind::Avg),
            Primitive::Subset {
                sizes: vec![4, 3],
                filters: vec![
                    Subset::parse("1:2", 4).unwrap(),
                    Subset::parse("1,3", 3).unwrap(),
                ],
                implicit: Subset::parse("2:5", 0).unwrap(),
            },
            Primitive::Intercube(IntercubeKind::Sub),
        ];
        for primitive in primitives {
            let parsed = Primitive::parse(primitive.name(), &primitive.args()).unwrap();
            assert_eq!(primitive, parsed);
        }
        assert!(Primitive::parse("explode", &[]).is_err());
        assert!(Primitive::parse("reduce", &["median".to_string()]).is_err());
    }

    #[test]
    fn fill_is_deterministic() {
        let primitive = Primitive::Fill {
            key_start: 5,
            key_end: 7,
            array_length: 4,
            seed: 1,
        };
        let output = primitive.apply(DType::Double, &[]).unwrap();
        assert_eq!(DType::Double, output.measure_type);
        assert_eq!(vec![5, 6, 7], output.rows.iter().map(|r| r.key).collect::<Vec<_>>());
        let first: Vec<f64> = values(&output.rows[0]);
        assert_eq!(4, first.len());
        assert_eq!(fill_value(5, 2, 1), first[2]);
        assert!(first.iter().all(|v| (0.0..100.0).contains(v)));
        assert_eq!(output, primitive.apply(DType::Double, &[]).unwrap());
    }

    #[test]
    fn fill_integers_truncate() {
        let output = Primitive::Fill {
            key_start: 1,
            key_end: 1,
            array_length: 2,
            seed: 0,
        }
        .apply(DType::Byte, &[])
        .unwrap();
        let expected: Vec<i8> = (0..2).map(|j| fill_value(1, j, 0) as i8).collect();
        assert_eq!(expected, values::<i8>(&output.rows[0]));
    }

    #[test]
    fn reduce_rows() {
        let rows = vec![row(1, &[1.0_f64, 5.0, 3.0]), row(2, &[-2.0_f64, 4.0, 1.0])];
        let apply = |kind| {
            Primitive::Reduce(kind)
                .apply(DType::Double, &[rows.clone()])
                .unwrap()
        };
        let sums: Vec<f64> = apply(ReduceKind::Sum).rows.iter().flat_map(values::<f64>).collect();
        assert_eq!(vec![9.0, 3.0], sums);
        let maxes: Vec<f64> = apply(ReduceKind::Max).rows.iter().flat_map(values::<f64>).collect();
        assert_eq!(vec![5.0, 4.0], maxes);
        let mins: Vec<f64> = apply(ReduceKind::Min).rows.iter().flat_map(values::<f64>).collect();
        assert_eq!(vec![1.0, -2.0], mins);
        let avgs: Vec<f64> = apply(ReduceKind::Avg).rows.iter().flat_map(values::<f64>).collect();
        assert_eq!(vec![3.0, 1.0], avgs);
        let counts = apply(ReduceKind::Count);
        assert_eq!(DType::Long, counts.measure_type);
        let counts: Vec<i64> = counts.rows.iter().flat_map(values::<i64>).collect();
        assert_eq!(vec![3, 3], counts);
    }

    #[test]
    fn reduce_overflow_is_an_error() {
        let rows = vec![row(1, &[100_i8, 100])];
        assert!(matches!(
            Primitive::Reduce(ReduceKind::Sum).apply(DType::Byte, &[rows]),
            Err(CubeError::Storage(_))
        ));
    }

    #[test]
    fn reduce_empty_array() {
        let rows = vec![row::<f32>(1, &[])];
        assert!(Primitive::Reduce(ReduceKind::Max)
            .apply(DType::Float, &[rows])
            .is_err());
    }

    #[test]
    fn subset_renumbers_keys() {
        // 3 (outer) x 2 (inner) grid; keys 1..=6 with the inner dimension fastest.
        let rows: Vec<RawRow> = (1..=6).map(|key| row(key, &[key as i32, 10, 20])).collect();
        let primitive = Primitive::Subset {
            sizes: vec![3, 2],
            filters: vec![
                Subset::parse("2:3", 3).unwrap(),
                Subset::parse("2", 2).unwrap(),
            ],
            implicit: Subset::parse("1,3", 0).unwrap(),
        };
        let output = primitive.apply(DType::Int, &[rows]).unwrap();
        // Old keys 4 (outer 2, inner 2) and 6 (outer 3, inner 2) survive.
        assert_eq!(vec![1, 2], output.rows.iter().map(|r| r.key).collect::<Vec<_>>());
        assert_eq!(vec![4, 20], values::<i32>(&output.rows[0]));
        assert_eq!(vec![6, 20], values::<i32>(&output.rows[1]));
    }

    #[test]
    fn intercube_combines_matching_rows() {
        let a = vec![row(1, &[5.0_f32, 6.0]), row(2, &[1.0_f32, 2.0])];
        let b = vec![row(1, &[1.0_f32, 8.0]), row(2, &[1.0_f32, 1.0])];
        let output = Primitive::Intercube(IntercubeKind::Sub)
            .apply(DType::Float, &[a.clone(), b.clone()])
            .unwrap();
        assert_eq!(vec![4.0, -2.0], values::<f32>(&output.rows[0]));
        assert_eq!(vec![0.0, 1.0], values::<f32>(&output.rows[1]));
        let output = Primitive::Intercube(IntercubeKind::Max)
            .apply(DType::Float, &[a, b])
            .unwrap();
        assert_eq!(vec![5.0, 8.0], values::<f32>(&output.rows[0]));
    }

    #[test]
    fn intercube_mismatched_rows() {
        let a = vec![row(1, &[1_i64])];
        let b = vec![row(2, &[1_i64])];
        assert!(matches!(
            Primitive::Intercube(IntercubeKind::Sum).apply(DType::Long, &[a.clone(), b]),
            Err(CubeError::Comparison(_))
        ));
        assert!(matches!(
            Primitive::Intercube(IntercubeKind::Sum).apply(DType::Long, &[a.clone(), vec![]]),
            Err(CubeError::Comparison(_))
        ));
        assert!(Primitive::Intercube(IntercubeKind::Sum)
            .apply(DType::Long, &[a])
            .is_err());
    }

    #[test]
    fn intercube_division_by_zero() {
        let a = vec![row(1, &[1_i32])];
        let b = vec![row(1, &[0_i32])];
        assert!(matches!(
            Primitive::Intercube(IntercubeKind::Div).apply(DType::Int, &[a, b]),
            Err(CubeError::Storage(_))
        ));
    }
}
