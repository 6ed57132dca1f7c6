//! Subset expressions and flat-id index arithmetic.
//!
//! A subset selects 1-based, inclusive indices along one dimension. Expressions are
//! comma-separated lists of clauses, each with up to three colon-separated fields:
//!
//! * `value`: a single index
//! * `start:end`: an interval
//! * `start:stride:end`: a strided interval
//!
//! The keywords `begin` and `end` stand for the first index and the dimension size. An empty
//! clause selects the whole dimension. Keywords are recognised by prefix, case-insensitively.

use std::fmt;

use crate::error::CubeError;

pub(crate) const BEGIN: &str = "begin";
pub(crate) const END: &str = "end";

/// Shape of a subset clause
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClauseKind {
    Single,
    Interval,
    Stride,
}

/// One clause of a subset: `start..=end` stepping by `stride`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RangeClause {
    pub kind: ClauseKind,
    pub start: u64,
    pub end: u64,
    pub stride: u64,
}

impl RangeClause {
    pub fn single(index: u64) -> Self {
        RangeClause {
            kind: ClauseKind::Single,
            start: index,
            end: index,
            stride: 1,
        }
    }

    pub fn interval(start: u64, end: u64) -> Self {
        RangeClause {
            kind: ClauseKind::Interval,
            start,
            end,
            stride: 1,
        }
    }

    pub fn strided(start: u64, stride: u64, end: u64) -> Self {
        RangeClause {
            kind: ClauseKind::Stride,
            start,
            end,
            stride,
        }
    }

    /// Number of indices selected by the clause.
    pub fn count(&self) -> u64 {
        1 + (self.end - self.start) / self.stride
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.start && index <= self.end && (index - self.start) % self.stride == 0
    }

    pub fn indices(&self) -> impl Iterator<Item = u64> {
        let stride = usize::try_from(self.stride).unwrap_or(usize::MAX);
        (self.start..=self.end).step_by(stride)
    }
}

impl fmt::Display for RangeClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ClauseKind::Single => write!(f, "{}", self.start),
            ClauseKind::Interval => write!(f, "{}:{}", self.start, self.end),
            ClauseKind::Stride => write!(f, "{}:{}:{}", self.start, self.stride, self.end),
        }
    }
}

/// An ordered list of clauses over a dimension of size `max`.
///
/// A `max` of zero means the dimension size is unknown: the `end` keyword and empty clauses are
/// then rejected and no upper bound is enforced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subset {
    clauses: Vec<RangeClause>,
    total: u64,
    max: u64,
}

/// Role of a field within a clause.
#[derive(Clone, Copy, PartialEq)]
enum Field {
    Start,
    Stride,
    End,
}

impl Subset {
    /// Parse a subset expression.
    ///
    /// # Arguments
    ///
    /// * `expr`: Comma-separated clauses
    /// * `max`: Dimension size, or zero when unknown
    pub fn parse(expr: &str, max: u64) -> Result<Self, CubeError> {
        if expr.trim().is_empty() {
            return Err(parse_error(expr, "expression is empty"));
        }
        let clauses = expr
            .split(',')
            .map(|clause| parse_clause(expr, clause, max))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_clauses(clauses, max))
    }

    /// Subset selecting every index of a dimension.
    pub fn full(max: u64) -> Self {
        if max == 0 {
            return Self::empty();
        }
        Self::from_clauses(vec![RangeClause::interval(1, max)], max)
    }

    pub fn empty() -> Self {
        Subset {
            clauses: Vec::new(),
            total: 0,
            max: 0,
        }
    }

    pub(crate) fn from_clauses(clauses: Vec<RangeClause>, max: u64) -> Self {
        let total = clauses.iter().map(RangeClause::count).sum();
        Subset {
            clauses,
            total,
            max,
        }
    }

    pub fn clauses(&self) -> &[RangeClause] {
        &self.clauses
    }

    /// Sum of the clause counts. Overlapping clauses are counted once per clause.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn contains(&self, index: u64) -> bool {
        self.clauses.iter().any(|clause| clause.contains(index))
    }

    /// Selected indices in clause order.
    pub fn indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.clauses.iter().flat_map(RangeClause::indices)
    }

    /// Selected indices in ascending order without repeats, up to `max`.
    pub fn distinct_indices(&self, max: u64) -> Vec<u64> {
        (1..=max).filter(|index| self.contains(*index)).collect()
    }

    /// Count the flat ids in `1..=initial_size` whose index passes this subset.
    ///
    /// # Arguments
    ///
    /// * `initial_size`: Number of flat ids to consider
    /// * `sizes`: Dimension sizes, fastest-varying first, used to project each id onto the
    ///   slowest dimension listed. `None` tests the id itself.
    pub fn size(&self, initial_size: u64, sizes: Option<&[u64]>) -> u64 {
        count_selected(initial_size, &[(self, sizes.unwrap_or(&[]))])
    }
}

impl fmt::Display for Subset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, clause) in self.clauses.iter().enumerate() {
            if position > 0 {
                f.write_str(",")?;
            }
            write!(f, "{clause}")?;
        }
        Ok(())
    }
}

/// Count the flat ids in `1..=initial_size` accepted by every filter.
///
/// Each filter is paired with the dimension sizes, fastest-varying first, that project an id onto
/// the filtered dimension. Empty sizes test the id itself.
pub fn count_selected(initial_size: u64, filters: &[(&Subset, &[u64])]) -> u64 {
    (1..=initial_size)
        .filter(|id| {
            filters
                .iter()
                .all(|(subset, sizes)| subset.contains(id_to_index(*id, sizes)))
        })
        .count() as u64
}

/// Index along the slowest of `sizes` (listed fastest-first) of a 1-based flat id.
pub fn id_to_index(id: u64, sizes: &[u64]) -> u64 {
    match sizes.split_last() {
        None => id,
        Some((bound, inner)) => id_to_index_blocked(id, inner.iter().product(), *bound),
    }
}

/// Index of a 1-based flat id along a dimension whose indices repeat in blocks of `block_size`
/// ids and wrap after `bound_count` indices.
pub fn id_to_index_blocked(id: u64, block_size: u64, bound_count: u64) -> u64 {
    1 + (id.saturating_sub(1) / block_size.max(1)) % bound_count.max(1)
}

/// Per-dimension 1-based coordinates of a flat id, both fastest-first.
pub fn id_to_coordinates(id: u64, sizes: &[u64]) -> Vec<u64> {
    let mut block_size = 1;
    sizes
        .iter()
        .map(|size| {
            let index = id_to_index_blocked(id, block_size, *size);
            block_size *= size;
            index
        })
        .collect()
}

/// Flat id of per-dimension 1-based coordinates, both fastest-first.
pub fn coordinates_to_id(coordinates: &[u64], sizes: &[u64]) -> u64 {
    let mut block_size = 1;
    let mut id = 1;
    for (coordinate, size) in coordinates.iter().zip(sizes) {
        id += coordinate.saturating_sub(1) * block_size;
        block_size *= size;
    }
    id
}

pub(crate) fn parse_error(expr: &str, reason: impl Into<String>) -> CubeError {
    CubeError::Parse {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

/// Whether `field` starts with `keyword`, ignoring ASCII case.
pub(crate) fn has_keyword(field: &str, keyword: &str) -> bool {
    field
        .get(..keyword.len())
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case(keyword))
}

fn parse_field(expr: &str, field: &str, max: u64, role: Field) -> Result<u64, CubeError> {
    if has_keyword(field, BEGIN) {
        return match role {
            Field::Start => Ok(1),
            Field::End => Err(parse_error(expr, "\"begin\" cannot close a range")),
            Field::Stride => Err(parse_error(expr, "a stride cannot be a keyword")),
        };
    }
    if has_keyword(field, END) {
        if role == Field::Stride {
            return Err(parse_error(expr, "a stride cannot be a keyword"));
        }
        if max == 0 {
            return Err(parse_error(expr, "\"end\" needs a known dimension size"));
        }
        return Ok(max);
    }
    field
        .parse::<u64>()
        .map_err(|_| parse_error(expr, format!("\"{field}\" is not a valid index")))
}

fn parse_clause(expr: &str, clause: &str, max: u64) -> Result<RangeClause, CubeError> {
    if clause.trim().is_empty() {
        if max == 0 {
            return Err(parse_error(expr, "an empty clause needs a known dimension size"));
        }
        return Ok(RangeClause::interval(1, max));
    }
    let fields: Vec<&str> = clause.split(':').map(str::trim).collect();
    let mut parsed = match fields.as_slice() {
        [value] => RangeClause::single(parse_field(expr, value, max, Field::Start)?),
        [start, end] => RangeClause::interval(
            parse_field(expr, start, max, Field::Start)?,
            parse_field(expr, end, max, Field::End)?,
        ),
        [start, stride, end] => RangeClause::strided(
            parse_field(expr, start, max, Field::Start)?,
            parse_field(expr, stride, max, Field::Stride)?,
            parse_field(expr, end, max, Field::End)?,
        ),
        _ => return Err(parse_error(expr, "a clause has at most three fields")),
    };
    if parsed.start > parsed.end {
        std::mem::swap(&mut parsed.start, &mut parsed.end);
    }
    if parsed.start == 0 {
        return Err(parse_error(expr, "indices start at 1"));
    }
    if parsed.stride == 0 {
        return Err(parse_error(expr, "stride must be positive"));
    }
    if max > 0 && parsed.end > max {
        return Err(CubeError::Bounds {
            what: "index",
            value: parsed.end,
            max,
        });
    }
    Ok(parsed)
}
