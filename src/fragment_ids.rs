//! Compact fragment-id range strings such as `1:4,7,9:2:15`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CubeError;
use crate::subset::{RangeClause, Subset};

/// A set of relative fragment indices, kept in its compact range form.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FragmentIds(Subset);

impl FragmentIds {
    pub fn parse(ids: &str) -> Result<Self, CubeError> {
        Ok(FragmentIds(Subset::parse(ids, 0)?))
    }

    /// `count` ids starting at `start`, `stride` apart.
    pub fn build(start: u64, stride: u64, count: u64) -> Self {
        let clause = match count {
            0 => return Self::empty(),
            1 => RangeClause::single(start),
            _ if stride == 1 => RangeClause::interval(start, start + count - 1),
            _ => RangeClause::strided(start, stride, start + (count - 1) * stride),
        };
        FragmentIds(Subset::from_clauses(vec![clause], 0))
    }

    pub fn empty() -> Self {
        FragmentIds(Subset::empty())
    }

    pub fn count(&self) -> u64 {
        self.0.total()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.0.contains(id)
    }

    /// Ids in range order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.indices()
    }

    /// Zero-based position of an id in range order.
    pub fn position(&self, id: u64) -> Option<u64> {
        self.iter().position(|other| other == id).map(|p| p as u64)
    }

    /// The `count` ids starting at zero-based position `offset`, as a compact range.
    pub fn slice(&self, offset: u64, count: u64) -> Self {
        let mut clauses = Vec::new();
        let mut skip = offset;
        let mut remaining = count;
        for clause in self.0.clauses() {
            if remaining == 0 {
                break;
            }
            let available = clause.count();
            if skip >= available {
                skip -= available;
                continue;
            }
            let taken = remaining.min(available - skip);
            let start = clause.start + skip * clause.stride;
            clauses.push(match taken {
                1 => RangeClause::single(start),
                _ if clause.stride == 1 => RangeClause::interval(start, start + taken - 1),
                _ => RangeClause::strided(start, clause.stride, start + (taken - 1) * clause.stride),
            });
            remaining -= taken;
            skip = 0;
        }
        FragmentIds(Subset::from_clauses(clauses, 0))
    }
}

impl fmt::Display for FragmentIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl TryFrom<String> for FragmentIds {
    type Error = CubeError;

    fn try_from(ids: String) -> Result<Self, Self::Error> {
        if ids.trim().is_empty() {
            return Ok(Self::empty());
        }
        Self::parse(&ids)
    }
}

impl From<FragmentIds> for String {
    fn from(ids: FragmentIds) -> Self {
        ids.to_string()
    }
}
