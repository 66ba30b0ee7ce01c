//! Protobuf messages carried inside [`Frame`](super::frame::Frame) payloads.
//!
//! Field tags are part of the worker contract; never renumber them.

use std::collections::HashMap;

/// HTTP method enum as it appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WireMethod {
    Get = 0,
    Put = 1,
    Post = 2,
    Delete = 3,
    Patch = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ManifestRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireVersion {
    #[prost(uint32, tag = "1")]
    pub major: u32,
    #[prost(uint32, tag = "2")]
    pub minor: u32,
    #[prost(uint32, tag = "3")]
    pub patch: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireBuildInfo {
    #[prost(string, tag = "1")]
    pub maintainer: String,
    #[prost(string, tag = "2")]
    pub image: String,
    #[prost(string, tag = "3")]
    pub tag: String,
    #[prost(string, tag = "4")]
    pub path: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireRoute {
    #[prost(enumeration = "WireMethod", tag = "1")]
    pub http_method: i32,
    #[prost(string, tag = "2")]
    pub handler: String,
    #[prost(string, tag = "3")]
    pub path_spec: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireManifest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub version: Option<WireVersion>,
    #[prost(message, optional, tag = "3")]
    pub build_info: Option<WireBuildInfo>,
    #[prost(message, repeated, tag = "4")]
    pub routes: Vec<WireRoute>,
}

/// Ordered multi-value list (headers, query parameters).
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireValues {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireRequest {
    #[prost(enumeration = "WireMethod", tag = "1")]
    pub http_method: i32,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, tag = "3")]
    pub raw_query: String,
    #[prost(string, tag = "4")]
    pub fragment: String,
    #[prost(int32, tag = "5")]
    pub proto_major: i32,
    #[prost(int32, tag = "6")]
    pub proto_minor: i32,
    #[prost(string, tag = "7")]
    pub host: String,
    #[prost(string, tag = "8")]
    pub remote_addr: String,
    #[prost(string, tag = "9")]
    pub request_uri: String,
    #[prost(int64, tag = "10")]
    pub content_length: i64,
    #[prost(bytes = "vec", tag = "11")]
    pub body: Vec<u8>,
    #[prost(map = "string, message", tag = "12")]
    pub headers: HashMap<String, WireValues>,
    #[prost(map = "string, string", tag = "13")]
    pub path_params: HashMap<String, String>,
    #[prost(map = "string, message", tag = "14")]
    pub query_params: HashMap<String, WireValues>,
    #[prost(string, tag = "15")]
    pub route: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireResponse {
    #[prost(int32, tag = "1")]
    pub status: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
    #[prost(map = "string, message", tag = "3")]
    pub headers: HashMap<String, WireValues>,
}

/// Payload of an `Error` frame: the call failed inside the worker.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireError {
    #[prost(string, tag = "1")]
    pub message: String,
}
