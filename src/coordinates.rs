//! Resolution of coordinate-value subsets onto index subsets.
//!
//! A value expression has the same shape as an index expression (see [crate::subset]) but its
//! bounds are coordinate values. Coordinates of a dimension are assumed to be monotonic.

use num_traits::ToPrimitive;
use tracing::warn;

use crate::array;
use crate::error::CubeError;
use crate::models::DType;
use crate::subset::{has_keyword, parse_error, ClauseKind, RangeClause, Subset, BEGIN, END};

/// A value subset resolved onto indices, with its rendered index expression.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedSubset {
    pub subset: Subset,
    /// Index expression of `subset`. It is empty when no coordinate is selected, and an empty
    /// expression does not parse: check [ResolvedSubset::is_empty] before handing it on.
    pub expression: String,
}

impl ResolvedSubset {
    /// Whether no coordinate is selected.
    pub fn is_empty(&self) -> bool {
        self.subset.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct ValueClause {
    kind: ClauseKind,
    start: f64,
    end: f64,
    stride: u64,
}

impl ValueClause {
    /// Widen the clause by `offset`: a single value becomes a clamped window around it, an
    /// interval has its upper bound extended.
    fn inflate(self, offset: f64, min: f64, max: f64) -> Self {
        if offset <= 0.0 {
            return self;
        }
        match self.kind {
            ClauseKind::Single => ValueClause {
                kind: ClauseKind::Interval,
                start: (self.start - offset).max(min),
                end: (self.start + offset).min(max),
                stride: 1,
            },
            ClauseKind::Interval | ClauseKind::Stride => ValueClause {
                end: self.end + offset,
                ..self
            },
        }
    }
}

/// Resolve a value subset against a dimension's raw coordinates.
///
/// # Arguments
///
/// * `expr`: Value subset expression
/// * `type_name`: Name of the coordinate type, matched case-insensitively
/// * `coordinates`: Raw coordinate bytes
/// * `offset`: Window half-width around single values, or extension of interval upper bounds
pub fn resolve_by_value(
    expr: &str,
    type_name: &str,
    coordinates: &[u8],
    offset: f64,
) -> Result<ResolvedSubset, CubeError> {
    resolve_by_dtype(expr, type_name.parse()?, coordinates, offset)
}

/// Resolve a value subset against raw coordinates of a known type.
pub fn resolve_by_dtype(
    expr: &str,
    dtype: DType,
    coordinates: &[u8],
    offset: f64,
) -> Result<ResolvedSubset, CubeError> {
    match dtype {
        DType::Byte => resolve_values(expr, &array::decode::<i8>(coordinates)?, offset),
        DType::Short => resolve_values(expr, &array::decode::<i16>(coordinates)?, offset),
        DType::Int => resolve_values(expr, &array::decode::<i32>(coordinates)?, offset),
        DType::Long => resolve_values(expr, &array::decode::<i64>(coordinates)?, offset),
        DType::Float => resolve_values(expr, &array::decode::<f32>(coordinates)?, offset),
        DType::Double => resolve_values(expr, &array::decode::<f64>(coordinates)?, offset),
    }
}

/// Resolve a value subset against typed coordinates.
pub fn resolve_values<T: ToPrimitive>(
    expr: &str,
    coordinates: &[T],
    offset: f64,
) -> Result<ResolvedSubset, CubeError> {
    let values: Vec<f64> = coordinates
        .iter()
        .map(|c| c.to_f64().unwrap_or(f64::NAN))
        .collect();
    let (first, last) = match (values.first(), values.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Err(parse_error(expr, "dimension has no coordinates")),
    };
    let ascending = first <= last;
    let (min, max) = if ascending { (first, last) } else { (last, first) };

    let mut resolved = Vec::new();
    for clause in parse_value_clauses(expr, min, max)? {
        match locate(&values, ascending, clause.inflate(offset, min, max)) {
            Some(clause) => resolved.push(clause),
            None => warn!(
                expr,
                start = clause.start,
                end = clause.end,
                "subset clause matches no coordinate"
            ),
        }
    }
    let subset = Subset::from_clauses(resolved, values.len() as u64);
    let expression = subset.to_string();
    Ok(ResolvedSubset { subset, expression })
}

fn parse_value(expr: &str, field: &str, min: f64, max: f64, closing: bool) -> Result<f64, CubeError> {
    if has_keyword(field, BEGIN) {
        if closing {
            return Err(parse_error(expr, "\"begin\" cannot close a range"));
        }
        return Ok(min);
    }
    if has_keyword(field, END) {
        return Ok(max);
    }
    match field.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(parse_error(expr, format!("\"{field}\" is not a coordinate value"))),
    }
}

fn parse_value_clauses(expr: &str, min: f64, max: f64) -> Result<Vec<ValueClause>, CubeError> {
    if expr.trim().is_empty() {
        return Err(parse_error(expr, "expression is empty"));
    }
    expr.split(',')
        .map(|clause| {
            if clause.trim().is_empty() {
                return Ok(ValueClause {
                    kind: ClauseKind::Interval,
                    start: min,
                    end: max,
                    stride: 1,
                });
            }
            let fields: Vec<&str> = clause.split(':').map(str::trim).collect();
            let mut parsed = match fields.as_slice() {
                [value] => {
                    let value = parse_value(expr, value, min, max, false)?;
                    ValueClause {
                        kind: ClauseKind::Single,
                        start: value,
                        end: value,
                        stride: 1,
                    }
                }
                [start, end] => ValueClause {
                    kind: ClauseKind::Interval,
                    start: parse_value(expr, start, min, max, false)?,
                    end: parse_value(expr, end, min, max, true)?,
                    stride: 1,
                },
                [start, stride, end] => ValueClause {
                    kind: ClauseKind::Stride,
                    start: parse_value(expr, start, min, max, false)?,
                    stride: match stride.parse::<u64>() {
                        Ok(stride) if stride > 0 => stride,
                        _ => return Err(parse_error(expr, "stride must be a positive index step")),
                    },
                    end: parse_value(expr, end, min, max, true)?,
                },
                _ => return Err(parse_error(expr, "a clause has at most three fields")),
            };
            if parsed.start > parsed.end {
                std::mem::swap(&mut parsed.start, &mut parsed.end);
            }
            Ok(parsed)
        })
        .collect()
}

/// Map a value clause onto 1-based indices. Returns `None` when the clause lies entirely outside
/// the coordinate range.
///
/// An interval resolves to its bounding indices: from the first coordinate at or past its start
/// to the first coordinate at or past its end, capped at the last coordinate. Over
/// `[10, 20, 30, 40]` the interval `15:25` therefore resolves to `2:3`.
fn locate(values: &[f64], ascending: bool, clause: ValueClause) -> Option<RangeClause> {
    if clause.kind == ClauseKind::Single {
        return nearest(values, clause.start).map(RangeClause::single);
    }
    let (first, last) = if ascending {
        let first = values.iter().position(|c| *c >= clause.start)?;
        if values[first] > clause.end && first == 0 {
            return None;
        }
        let last = values
            .iter()
            .position(|c| *c >= clause.end)
            .unwrap_or(values.len() - 1);
        (first, last)
    } else {
        let first = values.iter().position(|c| *c <= clause.end)?;
        if values[first] < clause.start && first == 0 {
            return None;
        }
        let last = values
            .iter()
            .position(|c| *c <= clause.start)
            .unwrap_or(values.len() - 1);
        (first, last)
    };
    let (start, end) = (first as u64 + 1, last.max(first) as u64 + 1);
    Some(if start == end {
        RangeClause::single(start)
    } else if clause.kind == ClauseKind::Stride {
        RangeClause::strided(start, clause.stride, end)
    } else {
        RangeClause::interval(start, end)
    })
}

/// 1-based index of the coordinate closest to `value`; ties go to the later index.
fn nearest(values: &[f64], value: f64) -> Option<u64> {
    let mut best = None;
    let mut best_distance = f64::INFINITY;
    for (index, coordinate) in values.iter().enumerate() {
        let distance = (coordinate - value).abs();
        if distance <= best_distance {
            best = Some(index as u64 + 1);
            best_distance = distance;
        }
    }
    best
}
