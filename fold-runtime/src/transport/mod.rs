//! Worker transport: the RPC between the runtime and the worker process.
//!
//! - [`frame`]: length-prefixed, call-id tagged frames
//! - [`wire`]: protobuf messages inside the frames
//! - [`server`]: worker-side ingress server
//!
//! This module holds the HTTP-shaped [`Request`] / [`Response`] values and
//! the conversions to and from their wire form.

use std::collections::{BTreeMap, HashMap};

use fold_manifest::{BuildInfo, HttpMethod, Manifest, Route, Version};

use crate::error::TransportError;

pub mod frame;
pub mod server;
pub mod wire;

use wire::{WireBuildInfo, WireManifest, WireMethod, WireRequest, WireResponse, WireRoute, WireValues, WireVersion};

/// Ordered multi-value map used for headers and query parameters.
pub type MultiMap = BTreeMap<String, Vec<String>>;

/// An inbound HTTP request, flattened for delivery to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: HttpMethod,
    pub path: String,
    pub raw_query: String,
    pub fragment: String,
    pub proto_major: i32,
    pub proto_minor: i32,
    pub host: String,
    pub remote_addr: String,
    pub request_uri: String,
    /// Body length when the client declared one, `-1` otherwise.
    pub content_length: i64,
    pub body: Vec<u8>,
    pub headers: MultiMap,
    pub path_params: BTreeMap<String, String>,
    pub query_params: MultiMap,
    /// Path pattern of the route that matched, e.g. `/hello/:name`.
    pub route: String,
}

impl Request {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            method,
            request_uri: path.clone(),
            path,
            raw_query: String::new(),
            fragment: String::new(),
            proto_major: 1,
            proto_minor: 1,
            host: String::new(),
            remote_addr: String::new(),
            content_length: -1,
            body: Vec::new(),
            headers: MultiMap::new(),
            path_params: BTreeMap::new(),
            query_params: MultiMap::new(),
            route: String::new(),
        }
    }

    /// Sets the body and declares its length.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.content_length = self.body.len() as i64;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn with_path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    fn check_content_length(&self) -> Result<(), TransportError> {
        if self.content_length >= 0 && self.content_length as usize != self.body.len() {
            return Err(TransportError::ContentLengthMismatch {
                declared: self.content_length,
                actual: self.body.len(),
            });
        }
        Ok(())
    }
}

/// A worker's answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: i32,
    pub body: Vec<u8>,
    pub headers: MultiMap,
}

impl Response {
    pub fn new(status: i32) -> Self {
        Self {
            status,
            body: Vec::new(),
            headers: MultiMap::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(name.into()).or_default().push(value.into());
        self
    }

    /// JSON response with the matching content type.
    pub fn json(status: i32, value: &serde_json::Value) -> Self {
        Self::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Method mapping
// ---------------------------------------------------------------------------

pub fn method_to_wire(method: HttpMethod) -> WireMethod {
    match method {
        HttpMethod::Get => WireMethod::Get,
        HttpMethod::Put => WireMethod::Put,
        HttpMethod::Post => WireMethod::Post,
        HttpMethod::Delete => WireMethod::Delete,
        HttpMethod::Patch => WireMethod::Patch,
    }
}

pub fn method_from_wire(value: i32) -> Result<HttpMethod, TransportError> {
    let method = WireMethod::try_from(value).map_err(|_| TransportError::InvalidMethod(value.to_string()))?;
    Ok(match method {
        WireMethod::Get => HttpMethod::Get,
        WireMethod::Put => HttpMethod::Put,
        WireMethod::Post => HttpMethod::Post,
        WireMethod::Delete => HttpMethod::Delete,
        WireMethod::Patch => HttpMethod::Patch,
    })
}

fn values_to_wire(map: &MultiMap) -> HashMap<String, WireValues> {
    map.iter()
        .map(|(key, values)| (key.clone(), WireValues { values: values.clone() }))
        .collect()
}

fn values_from_wire(map: HashMap<String, WireValues>) -> MultiMap {
    map.into_iter().map(|(key, list)| (key, list.values)).collect()
}

// ---------------------------------------------------------------------------
// Request / Response
// ---------------------------------------------------------------------------

pub fn encode_request(request: &Request) -> Result<WireRequest, TransportError> {
    request.check_content_length()?;
    Ok(WireRequest {
        http_method: method_to_wire(request.method) as i32,
        path: request.path.clone(),
        raw_query: request.raw_query.clone(),
        fragment: request.fragment.clone(),
        proto_major: request.proto_major,
        proto_minor: request.proto_minor,
        host: request.host.clone(),
        remote_addr: request.remote_addr.clone(),
        request_uri: request.request_uri.clone(),
        content_length: request.content_length,
        body: request.body.clone(),
        headers: values_to_wire(&request.headers),
        path_params: request
            .path_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        query_params: values_to_wire(&request.query_params),
        route: request.route.clone(),
    })
}

pub fn decode_request(wire: WireRequest) -> Result<Request, TransportError> {
    let request = Request {
        method: method_from_wire(wire.http_method)?,
        path: wire.path,
        raw_query: wire.raw_query,
        fragment: wire.fragment,
        proto_major: wire.proto_major,
        proto_minor: wire.proto_minor,
        host: wire.host,
        remote_addr: wire.remote_addr,
        request_uri: wire.request_uri,
        content_length: wire.content_length,
        body: wire.body,
        headers: values_from_wire(wire.headers),
        path_params: wire.path_params.into_iter().collect(),
        query_params: values_from_wire(wire.query_params),
        route: wire.route,
    };
    request.check_content_length()?;
    Ok(request)
}

fn check_status(status: i32) -> Result<(), TransportError> {
    if !(100..=599).contains(&status) {
        return Err(TransportError::InvalidStatus(status));
    }
    Ok(())
}

pub fn encode_response(response: &Response) -> Result<WireResponse, TransportError> {
    check_status(response.status)?;
    Ok(WireResponse {
        status: response.status,
        body: response.body.clone(),
        headers: values_to_wire(&response.headers),
    })
}

pub fn decode_response(wire: WireResponse) -> Result<Response, TransportError> {
    check_status(wire.status)?;
    Ok(Response {
        status: wire.status,
        body: wire.body,
        headers: values_from_wire(wire.headers),
    })
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

pub fn encode_manifest(manifest: &Manifest) -> WireManifest {
    WireManifest {
        name: manifest.name.clone(),
        version: Some(WireVersion {
            major: manifest.version.major,
            minor: manifest.version.minor,
            patch: manifest.version.patch,
        }),
        build_info: Some(WireBuildInfo {
            maintainer: manifest.build_info.maintainer.clone(),
            image: manifest.build_info.image.clone(),
            tag: manifest.build_info.tag.clone(),
            path: manifest.build_info.path.clone(),
        }),
        routes: manifest
            .routes
            .iter()
            .map(|route| WireRoute {
                http_method: method_to_wire(route.http_method) as i32,
                handler: route.handler.clone(),
                path_spec: route.path_spec.clone(),
            })
            .collect(),
    }
}

/// Absent version or build info decode to their defaults.
pub fn decode_manifest(wire: WireManifest) -> Result<Manifest, TransportError> {
    let version = wire
        .version
        .map(|v| Version {
            major: v.major,
            minor: v.minor,
            patch: v.patch,
        })
        .unwrap_or_default();
    let build_info = wire
        .build_info
        .map(|b| BuildInfo {
            maintainer: b.maintainer,
            image: b.image,
            tag: b.tag,
            path: b.path,
        })
        .unwrap_or_default();
    let routes = wire
        .routes
        .into_iter()
        .map(|route| {
            Ok(Route {
                http_method: method_from_wire(route.http_method)?,
                handler: route.handler,
                path_spec: route.path_spec,
            })
        })
        .collect::<Result<Vec<_>, TransportError>>()?;
    Ok(Manifest {
        name: wire.name,
        version,
        build_info,
        routes,
    })
}
