//! Domain types describing a worker's interface.
//!
//! The JSON encoding (camelCase keys, upper-case methods) is what the
//! runtime serves from `/_foldadmin/manifest`.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The HTTP methods a worker may register a route under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Put,
    Post,
    Delete,
    Patch,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 5] = [
        HttpMethod::Get,
        HttpMethod::Put,
        HttpMethod::Post,
        HttpMethod::Delete,
        HttpMethod::Patch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }

    /// PUT and POST carry a JSON body and are gated on the content type.
    pub fn requires_json_body(&self) -> bool {
        matches!(self, HttpMethod::Put | HttpMethod::Post)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(HttpMethod::Get),
            "PUT" => Ok(HttpMethod::Put),
            "POST" => Ok(HttpMethod::Post),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            other => Err(ManifestError::InvalidMethod(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// Semantic version of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Build metadata attached by the tooling that produced the worker image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub maintainer: String,
    pub image: String,
    pub tag: String,
    pub path: String,
}

/// A single `(method, handler, path pattern)` registration.
///
/// Path patterns use `:name` segments for parameters, e.g. `/hello/:name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub http_method: HttpMethod,
    pub handler: String,
    pub path_spec: String,
}

impl Route {
    pub fn new(http_method: HttpMethod, handler: impl Into<String>, path_spec: impl Into<String>) -> Self {
        Self {
            http_method,
            handler: handler.into(),
            path_spec: path_spec.into(),
        }
    }

    /// Names of the `:name` parameter segments, in order.
    pub fn param_names(&self) -> Vec<&str> {
        self.path_spec
            .split('/')
            .filter_map(|segment| segment.strip_prefix(':'))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.path_spec.is_empty() {
            return Err(ManifestError::EmptyPath {
                handler: self.handler.clone(),
            });
        }
        if self.handler.is_empty() {
            return Err(ManifestError::EmptyHandler {
                path: self.path_spec.clone(),
            });
        }
        if !self.path_spec.starts_with('/') {
            return Err(ManifestError::InvalidPath {
                path: self.path_spec.clone(),
                reason: "must start with '/'",
            });
        }
        if self.param_names().iter().any(|name| name.is_empty()) {
            return Err(ManifestError::InvalidPath {
                path: self.path_spec.clone(),
                reason: "parameter segment is missing a name",
            });
        }
        if !self.param_names().iter().all(|name| is_param_name(name)) {
            return Err(ManifestError::InvalidPath {
                path: self.path_spec.clone(),
                reason: "parameter name may only contain letters, digits, '_' and '-'",
            });
        }
        Ok(())
    }
}

fn is_param_name(name: &str) -> bool {
    name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

/// Snapshot of a worker's interface, fetched once per start cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub version: Version,
    pub build_info: BuildInfo,
    pub routes: Vec<Route>,
}

impl Manifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Validates every route; the route list itself may be empty.
    pub fn validate(&self) -> Result<(), ManifestError> {
        self.routes.iter().try_for_each(Route::validate)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn write_json<W: Write>(&self, writer: &mut W) -> Result<(), ManifestError> {
        serde_json::to_writer(&mut *writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
