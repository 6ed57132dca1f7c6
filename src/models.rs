//! Data types and associated functions and methods

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use url::Url;
use validator::{Validate, ValidationError};

use crate::array;
use crate::error::CubeError;
use crate::fragment_ids::FragmentIds;

pub type ContainerId = u64;
pub type DatacubeId = u64;
pub type DbmsId = u64;
pub type DbId = u64;
pub type FolderId = u64;
pub type FragmentId = u64;

/// Supported measure and coordinate data types
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    /// [i8]
    Byte,
    /// [i16]
    Short,
    /// [i32]
    Int,
    /// [i64]
    Long,
    /// [f32]
    Float,
    /// [f64]
    Double,
}

impl DType {
    /// Returns the size of the associated type in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Self::Byte => std::mem::size_of::<i8>(),
            Self::Short => std::mem::size_of::<i16>(),
            Self::Int => std::mem::size_of::<i32>(),
            Self::Long => std::mem::size_of::<i64>(),
            Self::Float => std::mem::size_of::<f32>(),
            Self::Double => std::mem::size_of::<f64>(),
        }
    }
}

impl FromStr for DType {
    type Err = CubeError;

    /// Type names are matched case-insensitively.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let name = name.trim();
        [
            Self::Byte,
            Self::Short,
            Self::Int,
            Self::Long,
            Self::Float,
            Self::Double,
        ]
        .into_iter()
        .find(|dtype| dtype.to_string().eq_ignore_ascii_case(name))
        .ok_or_else(|| CubeError::UnsupportedType(name.to_string()))
    }
}

/// Persistent identifier of a datacube: `<base>/<container id>/<datacube id>`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Pid {
    pub container_id: ContainerId,
    pub datacube_id: DatacubeId,
}

impl Pid {
    /// Parse a PID URL. Only the last two path segments are significant.
    pub fn parse(pid: &str) -> Result<Self, CubeError> {
        let invalid = |reason: &str| CubeError::InvalidParam {
            name: "pid".to_string(),
            reason: format!("\"{pid}\": {reason}"),
        };
        let url = Url::parse(pid.trim()).map_err(|err| invalid(&err.to_string()))?;
        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let datacube = segments.pop();
        let container = segments.pop();
        match (container, datacube) {
            (Some(container), Some(datacube)) => Ok(Pid {
                container_id: container
                    .parse()
                    .map_err(|_| invalid("container id is not a number"))?,
                datacube_id: datacube
                    .parse()
                    .map_err(|_| invalid("datacube id is not a number"))?,
            }),
            _ => Err(invalid("expected <base>/<container>/<datacube>")),
        }
    }

    /// Render the PID below a base URL.
    pub fn to_url(self, base: &Url) -> String {
        format!(
            "{}/{}/{}",
            base.as_str().trim_end_matches('/'),
            self.container_id,
            self.datacube_id
        )
    }
}

/// A folder-scoped namespace of datacubes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub folder_id: FolderId,
    pub name: String,
}

/// A datacube dimension with its coordinate labels
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub size: u64,
    /// Explicit dimensions index rows, the implicit dimension indexes the measure array.
    pub explicit: bool,
    pub coord_type: DType,
    /// Raw coordinate values, one `coord_type` element per index.
    pub labels: Bytes,
}

impl Dimension {
    /// Dimension labelled with its own 1-based indices.
    pub fn indexed(name: &str, size: u64, explicit: bool) -> Self {
        let labels: Vec<f64> = (1..=size).map(|i| i as f64).collect();
        Dimension {
            name: name.to_string(),
            size,
            explicit,
            coord_type: DType::Double,
            labels: array::encode(&labels),
        }
    }

    /// Labels for the given 1-based indices, in order.
    pub fn select_labels(&self, indices: &[u64]) -> Result<Bytes, CubeError> {
        let width = self.coord_type.size_of();
        let mut labels = BytesMut::with_capacity(indices.len() * width);
        for index in indices {
            let start = usize::try_from(index.saturating_sub(1))? * width;
            let label = self
                .labels
                .get(start..start + width)
                .ok_or(CubeError::Bounds {
                    what: "coordinate index",
                    value: *index,
                    max: self.size,
                })?;
            labels.extend_from_slice(label);
        }
        Ok(labels.freeze())
    }
}

/// Datacube metadata as stored in the catalog
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Datacube {
    pub id: DatacubeId,
    pub container_id: ContainerId,
    pub measure: String,
    pub measure_type: DType,
    pub fragment_ids: FragmentIds,
    pub tuples_per_fragment: u64,
    /// Total number of rows over all fragments
    pub rows: u64,
    pub compressed: bool,
    /// Explicit dimensions outer-first, followed by the implicit dimension
    pub dimensions: Vec<Dimension>,
    pub size_bytes: Option<u64>,
    pub description: Option<String>,
}

impl Datacube {
    pub fn explicit_dims(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.iter().filter(|dim| dim.explicit)
    }

    pub fn implicit_dim(&self) -> Option<&Dimension> {
        self.dimensions.iter().find(|dim| !dim.explicit)
    }

    /// Explicit dimension sizes, outer-first.
    pub fn explicit_sizes(&self) -> Vec<u64> {
        self.explicit_dims().map(|dim| dim.size).collect()
    }

    /// Number of measure elements per row.
    pub fn array_length(&self) -> u64 {
        self.implicit_dim().map_or(1, |dim| dim.size)
    }

    /// Uncompressed size of one row's measure in bytes.
    pub fn row_bytes(&self) -> u64 {
        self.array_length() * self.measure_type.size_of() as u64
    }
}

/// Datacube row to insert into the catalog
#[derive(Clone, Debug, PartialEq)]
pub struct NewDatacube {
    pub container_id: ContainerId,
    pub measure: String,
    pub measure_type: DType,
    pub fragment_ids: FragmentIds,
    pub tuples_per_fragment: u64,
    pub rows: u64,
    pub compressed: bool,
    pub description: Option<String>,
}

impl NewDatacube {
    /// Output datacube with the same shape and placement metadata as `input`.
    pub fn derived_from(input: &Datacube) -> Self {
        NewDatacube {
            container_id: input.container_id,
            measure: input.measure.clone(),
            measure_type: input.measure_type,
            fragment_ids: input.fragment_ids.clone(),
            tuples_per_fragment: input.tuples_per_fragment,
            rows: input.rows,
            compressed: input.compressed,
            description: None,
        }
    }
}

/// A storage server
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct DbmsInstance {
    pub id: DbmsId,
    pub host: String,
    pub port: u16,
}

/// A database on a storage server
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct DbInstance {
    pub id: DbId,
    pub dbms_id: DbmsId,
    pub name: String,
    /// Datacube whose creation allocated this database.
    pub owner: Option<DatacubeId>,
}

/// Catalog row of a stored fragment
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FragmentRef {
    pub id: FragmentId,
    pub datacube_id: DatacubeId,
    pub relative_index: u64,
    pub db_instance_id: DbId,
    /// Key range of the rows held; a zero start marks an empty fragment.
    pub key_start: u64,
    pub key_end: u64,
    pub name: String,
}

impl FragmentRef {
    pub fn rows(&self) -> u64 {
        if self.key_start == 0 {
            0
        } else {
            self.key_end - self.key_start + 1
        }
    }
}

/// Fragment row to insert into the catalog
#[derive(Clone, Debug, PartialEq)]
pub struct NewFragment {
    pub datacube_id: DatacubeId,
    pub relative_index: u64,
    pub db_instance_id: DbId,
    pub key_start: u64,
    pub key_end: u64,
    pub name: String,
}

/// Where a fragment lives: a database on a storage server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub dbms: DbmsInstance,
    pub db: DbInstance,
}

/// An input fragment with its physical placement
#[derive(Clone, Debug, PartialEq)]
pub struct SourceFragment {
    pub fragment: FragmentRef,
    pub placement: Placement,
}

/// Physical layout of (a subset of) a datacube's fragments.
///
/// DBMS instances, databases and fragments are each ordered by id, fragments by relative index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CubeLayout {
    pub dbms: Vec<DbmsInstance>,
    pub dbs: Vec<DbInstance>,
    pub fragments: Vec<FragmentRef>,
}

impl CubeLayout {
    pub fn dbs_of(&self, dbms_id: DbmsId) -> impl Iterator<Item = &DbInstance> + '_ {
        self.dbs.iter().filter(move |db| db.dbms_id == dbms_id)
    }

    /// Indices into `fragments` of the fragments stored in a database.
    pub fn fragments_of(&self, db_id: DbId) -> Vec<usize> {
        self.fragments
            .iter()
            .enumerate()
            .filter(|(_, fragment)| fragment.db_instance_id == db_id)
            .map(|(index, _)| index)
            .collect()
    }

    /// First fragment of the first database of a DBMS holding any fragment.
    pub fn first_fragment_of_dbms(&self, dbms_id: DbmsId) -> Option<usize> {
        self.dbs_of(dbms_id)
            .find_map(|db| self.fragments_of(db.id).first().copied())
    }

    /// Fragment indices in DBMS, database, fragment order.
    pub fn ordered(&self) -> Vec<usize> {
        self.dbms
            .iter()
            .flat_map(|dbms| self.dbs_of(dbms.id))
            .flat_map(|db| self.fragments_of(db.id))
            .collect()
    }

    /// Resolve the placement of a fragment.
    pub fn source(&self, index: usize) -> Result<SourceFragment, CubeError> {
        let fragment = self
            .fragments
            .get(index)
            .ok_or_else(|| CubeError::Catalog(format!("no fragment at layout index {index}")))?;
        let db = self
            .dbs
            .iter()
            .find(|db| db.id == fragment.db_instance_id)
            .ok_or_else(|| CubeError::NotFound(format!("db instance {}", fragment.db_instance_id)))?;
        let dbms = self
            .dbms
            .iter()
            .find(|dbms| dbms.id == db.dbms_id)
            .ok_or_else(|| CubeError::NotFound(format!("dbms instance {}", db.dbms_id)))?;
        Ok(SourceFragment {
            fragment: fragment.clone(),
            placement: Placement {
                dbms: dbms.clone(),
                db: db.clone(),
            },
        })
    }
}

/// Task history row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub job_id: String,
    pub operator: String,
    pub inputs: Vec<DatacubeId>,
    pub output: Option<DatacubeId>,
}

/// Operator parameters: a flat `key=value` map.
///
/// List-valued parameters separate their items with `|`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OperatorParams(BTreeMap<String, String>);

impl OperatorParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn required(&self, key: &str) -> Result<&str, CubeError> {
        self.get(key)
            .ok_or_else(|| CubeError::MissingParam(key.to_string()))
    }

    /// First present parameter out of several aliases.
    pub fn required_any(&self, keys: &[&str]) -> Result<&str, CubeError> {
        keys.iter()
            .find_map(|key| self.get(key))
            .ok_or_else(|| CubeError::MissingParam(keys.join("|")))
    }

    pub fn parse_required<T>(&self, key: &str) -> Result<T, CubeError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        parse_value(key, self.required(key)?)
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, CubeError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(value) => parse_value(key, value),
            None => Ok(default),
        }
    }

    /// Split a list-valued parameter on `|`.
    pub fn list(&self, key: &str) -> Option<Vec<&str>> {
        self.get(key)
            .map(|value| value.split('|').map(str::trim).collect())
    }

    /// Parse a `yes`/`no` flag.
    pub fn flag(&self, key: &str, default: bool) -> Result<bool, CubeError> {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(value) => match value.as_str() {
                "yes" | "true" | "1" => Ok(true),
                "no" | "false" | "0" => Ok(false),
                _ => Err(CubeError::InvalidParam {
                    name: key.to_string(),
                    reason: format!("\"{value}\" is not yes or no"),
                }),
            },
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for OperatorParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        OperatorParams(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, CubeError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| CubeError::InvalidParam {
            name: key.to_string(),
            reason: format!("\"{value}\": {err}"),
        })
}

/// Request body of an operator invocation
#[derive(Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_invocation"))]
pub struct InvocationRequest {
    /// Operator parameters
    #[serde(default)]
    pub params: OperatorParams,
    /// Number of workers to run the operator with
    #[validate(range(min = 1, max = 1024, message = "workers must be between 1 and 1024"))]
    pub workers: Option<usize>,
}

/// Validate an invocation request
fn validate_invocation(request: &InvocationRequest) -> Result<(), ValidationError> {
    if request.params.keys().any(|key| key.trim().is_empty()) {
        return Err(ValidationError::new("parameter names must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_test::{assert_de_tokens, assert_de_tokens_error, Token};

    #[test]
    fn dtype_from_str_is_case_insensitive() {
        assert_eq!(DType::Double, "DOUBLE".parse().unwrap());
        assert_eq!(DType::Byte, "byte".parse().unwrap());
        assert_eq!(DType::Long, " Long ".parse().unwrap());
        assert!(matches!(
            "complex".parse::<DType>(),
            Err(CubeError::UnsupportedType(name)) if name == "complex"
        ));
    }

    #[test]
    fn dtype_sizes() {
        assert_eq!(1, DType::Byte.size_of());
        assert_eq!(2, DType::Short.size_of());
        assert_eq!(4, DType::Float.size_of());
        assert_eq!(8, DType::Double.size_of());
    }

    #[test]
    fn pid_round_trip() {
        let base = Url::parse("http://localhost/cubeops/").unwrap();
        let pid = Pid::parse("http://localhost/cubeops/3/17").unwrap();
        assert_eq!(3, pid.container_id);
        assert_eq!(17, pid.datacube_id);
        assert_eq!("http://localhost/cubeops/3/17", pid.to_url(&base));
    }

    #[test]
    fn pid_invalid() {
        assert!(Pid::parse("not a url").is_err());
        assert!(Pid::parse("http://localhost/17").is_err());
        assert!(Pid::parse("http://localhost/a/b").is_err());
    }

    #[test]
    fn dimension_select_labels() {
        let dim = Dimension::indexed("time", 4, true);
        let labels = dim.select_labels(&[2, 4]).unwrap();
        assert_eq!(vec![2.0, 4.0], array::decode::<f64>(&labels).unwrap());
        assert!(matches!(
            dim.select_labels(&[5]),
            Err(CubeError::Bounds { value: 5, .. })
        ));
    }

    #[test]
    fn layout_ordering() {
        let dbms = |id| DbmsInstance {
            id,
            host: "localhost".to_string(),
            port: 0,
        };
        let db = |id, dbms_id| DbInstance {
            id,
            dbms_id,
            name: format!("db{id}"),
            owner: None,
        };
        let fragment = |id, relative_index, db_instance_id| FragmentRef {
            id,
            datacube_id: 1,
            relative_index,
            db_instance_id,
            key_start: 1,
            key_end: 1,
            name: format!("f{id}"),
        };
        let layout = CubeLayout {
            dbms: vec![dbms(1), dbms(2)],
            dbs: vec![db(10, 2), db(11, 1)],
            fragments: vec![fragment(100, 1, 11), fragment(101, 2, 10), fragment(102, 3, 11)],
        };
        assert_eq!(vec![0, 2, 1], layout.ordered());
        assert_eq!(Some(1), layout.first_fragment_of_dbms(2));
        let source = layout.source(1).unwrap();
        assert_eq!(2, source.placement.dbms.id);
        assert_eq!(10, source.placement.db.id);
    }

    #[test]
    fn params_accessors() {
        let params: OperatorParams = [
            ("cube", "http://localhost/1/2"),
            ("dim", "lat|lon"),
            ("nthreads", "4"),
            ("compressed", "yes"),
        ]
        .into_iter()
        .collect();
        assert_eq!("http://localhost/1/2", params.required("cube").unwrap());
        assert_eq!(Some(vec!["lat", "lon"]), params.list("dim"));
        assert_eq!(4, params.parse_required::<usize>("nthreads").unwrap());
        assert_eq!(1, params.parse_or::<u64>("nsplit", 1).unwrap());
        assert!(params.flag("compressed", false).unwrap());
        assert!(matches!(
            params.required("missing"),
            Err(CubeError::MissingParam(_))
        ));
        assert!(matches!(
            params.parse_required::<u64>("dim"),
            Err(CubeError::InvalidParam { .. })
        ));
    }

    #[test]
    fn test_invocation_tokens() {
        assert_de_tokens(
            &InvocationRequest {
                params: OperatorParams::new().with("cube", "http://localhost/1/2"),
                workers: Some(4),
            },
            &[
                Token::Struct {
                    name: "InvocationRequest",
                    len: 2,
                },
                Token::Str("params"),
                Token::Map { len: Some(1) },
                Token::Str("cube"),
                Token::Str("http://localhost/1/2"),
                Token::MapEnd,
                Token::Str("workers"),
                Token::Some,
                Token::U32(4),
                Token::StructEnd,
            ],
        );
    }

    #[test]
    fn test_invocation_defaults() {
        assert_de_tokens(
            &InvocationRequest {
                params: OperatorParams::new(),
                workers: None,
            },
            &[
                Token::Struct {
                    name: "InvocationRequest",
                    len: 0,
                },
                Token::StructEnd,
            ],
        );
    }

    #[test]
    fn test_invocation_unknown_field() {
        assert_de_tokens_error::<InvocationRequest>(
            &[
                Token::Struct {
                    name: "InvocationRequest",
                    len: 1,
                },
                Token::Str("threads"),
            ],
            "unknown field `threads`, expected `params` or `workers`",
        )
    }

    #[test]
    fn test_invocation_validation() {
        let request = InvocationRequest {
            params: OperatorParams::new(),
            workers: Some(0),
        };
        assert!(request.validate().is_err());
        let request = InvocationRequest {
            params: OperatorParams::new().with(" ", "x"),
            workers: Some(2),
        };
        assert!(request.validate().is_err());
        let request = InvocationRequest {
            params: OperatorParams::new().with("cube", "x"),
            workers: Some(2),
        };
        assert!(request.validate().is_ok());
    }
}
