//! Operator reports.
//!
//! Every invocation returns one [Report]: the final status plus a list of keyed text and grid
//! objects. The `objkeys` parameter selects which objects are kept.

use axum::{
    http::header,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::error::Status;
use crate::models::OperatorParams;

/// One keyed element of a report
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReportObject {
    Text {
        key: String,
        title: String,
        message: String,
    },
    Grid {
        key: String,
        title: String,
        keys: Vec<String>,
        values: Vec<Vec<String>>,
    },
}

impl ReportObject {
    pub fn key(&self) -> &str {
        match self {
            ReportObject::Text { key, .. } | ReportObject::Grid { key, .. } => key,
        }
    }
}

/// Result of an operator invocation
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Report {
    pub operator: String,
    pub status: Status,
    /// Message of the error that caused a failed invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub objects: Vec<ReportObject>,
}

impl Report {
    /// An empty successful report.
    pub fn new(operator: &str) -> Self {
        Report {
            operator: operator.to_string(),
            status: Status::Success,
            error: None,
            objects: Vec::new(),
        }
    }

    pub fn failed(operator: &str, status: Status, error: Option<String>) -> Self {
        Report {
            status,
            error,
            ..Self::new(operator)
        }
    }

    pub fn text(mut self, key: &str, title: &str, message: impl Into<String>) -> Self {
        self.objects.push(ReportObject::Text {
            key: key.to_string(),
            title: title.to_string(),
            message: message.into(),
        });
        self
    }

    pub fn grid(
        mut self,
        key: &str,
        title: &str,
        keys: &[&str],
        values: Vec<Vec<String>>,
    ) -> Self {
        self.objects.push(ReportObject::Grid {
            key: key.to_string(),
            title: title.to_string(),
            keys: keys.iter().map(|key| key.to_string()).collect(),
            values,
        });
        self
    }

    pub fn object(&self, key: &str) -> Option<&ReportObject> {
        self.objects.iter().find(|object| object.key() == key)
    }

    /// Keep only the objects selected by `keys`.
    pub fn select(mut self, keys: &ObjKeys) -> Self {
        self.objects.retain(|object| keys.selects(object.key()));
        self
    }
}

impl IntoResponse for Report {
    fn into_response(self) -> Response {
        match serde_json::to_string(&self) {
            Ok(body) => (
                self.status.http_status(),
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                body,
            )
                .into_response(),
            Err(err) => crate::error::CubeError::from(err).into_response(),
        }
    }
}

/// Report object filter
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ObjKeys {
    #[default]
    All,
    Only(Vec<String>),
}

impl ObjKeys {
    /// Read the `objkeys` parameter. A missing value or `all` keeps every object.
    pub fn from_params(params: &OperatorParams) -> Self {
        match params.list("objkeys") {
            None => ObjKeys::All,
            Some(keys) if keys.iter().any(|key| key.eq_ignore_ascii_case("all")) => ObjKeys::All,
            Some(keys) => ObjKeys::Only(keys.into_iter().map(str::to_string).collect()),
        }
    }

    pub fn selects(&self, key: &str) -> bool {
        match self {
            ObjKeys::All => true,
            ObjKeys::Only(keys) => keys.iter().any(|selected| selected == key),
        }
    }
}
