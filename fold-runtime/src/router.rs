//! HTTP router built from a worker manifest.
//!
//! Admin routes under `/_foldadmin` are registered first. Every manifest
//! route forwards the request to a [`RequestDoer`] and copies the worker's
//! answer back. [`Router::configure`] swaps the whole table at once; requests
//! already dispatched finish against the table they started with.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::rejection::PathRejection;
use axum::extract::{ConnectInfo, Path, Query, Request as HttpRequest};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Version as HttpVersion};
use axum::response::Response as HttpResponse;
use axum::routing::{get, MethodFilter, MethodRouter};
use fold_manifest::{HttpMethod, Manifest, Route};
use serde_json::json;
use tower::ServiceExt;

use crate::error::IngressError;
use crate::transport::{MultiMap, Request, Response};

pub const ADMIN_PREFIX: &str = "/_foldadmin";
pub const HEALTHZ_PATH: &str = "/_foldadmin/healthz";
pub const MANIFEST_PATH: &str = "/_foldadmin/manifest";

/// Upper bound on a buffered request body.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Forwards one request to the worker.
#[async_trait]
pub trait RequestDoer: Send + Sync {
    async fn do_request(&self, request: Request) -> Result<Response, IngressError>;
}

#[derive(Clone)]
struct Table {
    manifest: Arc<Manifest>,
    routes: axum::Router,
}

pub struct Router {
    doer: Arc<dyn RequestDoer>,
    table: RwLock<Table>,
}

impl Router {
    /// A router serving only the admin routes until configured.
    pub fn new(doer: Arc<dyn RequestDoer>) -> Self {
        let manifest = Arc::new(Manifest::default());
        let routes = build_routes(&manifest, &doer);
        Self {
            doer,
            table: RwLock::new(Table { manifest, routes }),
        }
    }

    pub fn configure(&self, manifest: Manifest) {
        let manifest = Arc::new(manifest);
        let routes = build_routes(&manifest, &self.doer);
        tracing::info!(
            service = %manifest.name,
            version = %manifest.version,
            routes = manifest.routes.len(),
            "router configured",
        );
        let table = Table { manifest, routes };
        match self.table.write() {
            Ok(mut current) => *current = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
    }

    pub fn manifest(&self) -> Arc<Manifest> {
        self.snapshot().manifest
    }

    pub async fn serve(&self, request: HttpRequest) -> HttpResponse {
        let routes = self.snapshot().routes;
        match routes.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    fn snapshot(&self) -> Table {
        match self.table.read() {
            Ok(table) => table.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Route table construction
// ---------------------------------------------------------------------------

fn build_routes(manifest: &Arc<Manifest>, doer: &Arc<dyn RequestDoer>) -> axum::Router {
    let current = manifest.clone();
    let mut router = axum::Router::new()
        .route(HEALTHZ_PATH, get(healthz).fallback(method_not_allowed))
        .route(
            MANIFEST_PATH,
            get(move || {
                let manifest = current.clone();
                async move { manifest_response(&manifest) }
            })
            .fallback(method_not_allowed),
        );

    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, MethodRouter> = HashMap::new();
    let mut registered: HashSet<(HttpMethod, String)> = HashSet::new();
    let mut shapes = ParamShapes::default();

    for route in &manifest.routes {
        if let Err(reason) = admit(route, &registered, &mut shapes) {
            tracing::warn!(
                method = %route.http_method,
                path = %route.path_spec,
                handler = %route.handler,
                reason = %reason,
                "skipping manifest route",
            );
            continue;
        }
        registered.insert((route.http_method, route.path_spec.clone()));

        let path = axum_path(&route.path_spec);
        let handler = {
            let route = Arc::new(route.clone());
            let doer = doer.clone();
            move |params: PathParams, request: HttpRequest| {
                let route = route.clone();
                let doer = doer.clone();
                async move { dispatch(doer, route, params, request).await }
            }
        };
        let methods = match grouped.remove(&path) {
            Some(existing) => existing,
            None => {
                order.push(path.clone());
                MethodRouter::new()
            }
        };
        grouped.insert(path, methods.on(method_filter(route.http_method), handler));
    }

    for path in order {
        if let Some(methods) = grouped.remove(&path) {
            match register(&router, &path, methods.fallback(method_not_allowed)) {
                Ok(next) => router = next,
                Err(reason) => tracing::warn!(path = %path, reason = %reason, "skipping manifest path"),
            }
        }
    }
    router.fallback(not_found)
}

/// Adds `path` to a copy of `router`. axum panics on patterns its matcher
/// rejects; that panic becomes an error and `router` is left untouched.
fn register(router: &axum::Router, path: &str, methods: MethodRouter) -> Result<axum::Router, String> {
    let candidate = router.clone();
    panic::catch_unwind(AssertUnwindSafe(move || candidate.route(path, methods))).map_err(|payload| {
        payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|text| text.to_string()))
            .unwrap_or_else(|| "route rejected by matcher".to_string())
    })
}

fn admit(
    route: &Route,
    registered: &HashSet<(HttpMethod, String)>,
    shapes: &mut ParamShapes,
) -> Result<(), String> {
    route.validate().map_err(|err| err.to_string())?;
    if route.path_spec == ADMIN_PREFIX || route.path_spec.starts_with("/_foldadmin/") {
        return Err("path is reserved for admin routes".to_string());
    }
    if registered.contains(&(route.http_method, route.path_spec.clone())) {
        return Err("duplicate route".to_string());
    }
    shapes.admit(&route.path_spec)
}

/// Parameter names seen at each path shape. Two patterns that differ only
/// in a parameter's name cannot share a routing tree.
#[derive(Default)]
struct ParamShapes {
    names: HashMap<String, String>,
}

impl ParamShapes {
    fn admit(&mut self, path_spec: &str) -> Result<(), String> {
        let mut shape = String::new();
        let mut fresh = Vec::new();
        for segment in path_spec.split('/').skip(1) {
            shape.push('/');
            match segment.strip_prefix(':') {
                Some(name) => {
                    shape.push(':');
                    match self.names.get(&shape) {
                        Some(existing) if existing != name => {
                            return Err(format!("parameter ':{name}' conflicts with ':{existing}'"));
                        }
                        Some(_) => {}
                        None => fresh.push((shape.clone(), name.to_string())),
                    }
                }
                None => shape.push_str(segment),
            }
        }
        self.names.extend(fresh);
        Ok(())
    }
}

/// `/hello/:name` becomes `/hello/{name}`; literal braces are escaped.
fn axum_path(path_spec: &str) -> String {
    path_spec
        .split('/')
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) => format!("{{{name}}}"),
            None => segment.replace('{', "{{").replace('}', "}}"),
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn method_filter(method: HttpMethod) -> MethodFilter {
    match method {
        HttpMethod::Get => MethodFilter::GET,
        HttpMethod::Put => MethodFilter::PUT,
        HttpMethod::Post => MethodFilter::POST,
        HttpMethod::Delete => MethodFilter::DELETE,
        HttpMethod::Patch => MethodFilter::PATCH,
    }
}

type PathParams = Result<Path<HashMap<String, String>>, PathRejection>;

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

async fn dispatch(
    doer: Arc<dyn RequestDoer>,
    route: Arc<Route>,
    params: PathParams,
    request: HttpRequest,
) -> HttpResponse {
    if route.http_method.requires_json_body() && !accepts_json(request.headers()) {
        return json_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
            None,
        );
    }

    // Only the five manifest methods reach the worker; HEAD lands here via GET.
    let Ok(method) = request.method().as_str().parse::<HttpMethod>() else {
        return method_not_allowed().await;
    };

    let path_params = match params {
        Ok(Path(params)) => params.into_iter().collect(),
        Err(PathRejection::MissingPathParams(_)) => BTreeMap::new(),
        Err(rejection) => {
            return json_error(StatusCode::BAD_REQUEST, "Malformed path parameter", Some(rejection.body_text()));
        }
    };

    let request = match build_request(method, &route, path_params, request).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    match doer.do_request(request).await {
        Ok(response) => write_response(response),
        Err(err) if err.is_transport_failure() => {
            tracing::warn!(route = %route.path_spec, error = %err, "worker call failed");
            json_error(StatusCode::BAD_GATEWAY, "Cannot service request", Some(err.to_string()))
        }
        Err(err) => {
            tracing::error!(route = %route.path_spec, error = %err, "request could not be encoded");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to process request",
                Some(err.to_string()),
            )
        }
    }
}

fn accepts_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONTENT_TYPE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("application/json"))
}

async fn build_request(
    method: HttpMethod,
    route: &Route,
    path_params: BTreeMap<String, String>,
    request: HttpRequest,
) -> Result<Request, HttpResponse> {
    let (parts, body) = request.into_parts();

    // Lossy: bad escapes stay literal, invalid UTF-8 becomes U+FFFD.
    let pairs = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri)
        .map(|Query(pairs)| pairs)
        .unwrap_or_default();
    let mut query_params = MultiMap::new();
    for (key, value) in pairs {
        query_params.entry(key).or_default().push(value);
    }

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body.to_vec(),
        Err(err) => {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "Failed to read request body",
                Some(err.to_string()),
            ))
        }
    };

    let mut headers = MultiMap::new();
    for (name, value) in &parts.headers {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let content_length = if parts.headers.contains_key(header::CONTENT_LENGTH) {
        body.len() as i64
    } else {
        -1
    };
    let (proto_major, proto_minor) = proto_version(parts.version);
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|authority| authority.to_string()))
        .unwrap_or_default();
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    Ok(Request {
        method,
        path: parts.uri.path().to_string(),
        raw_query: parts.uri.query().unwrap_or_default().to_string(),
        fragment: String::new(),
        proto_major,
        proto_minor,
        host,
        remote_addr,
        request_uri: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string()),
        content_length,
        body,
        headers,
        path_params,
        query_params,
        route: route.path_spec.clone(),
    })
}

fn proto_version(version: HttpVersion) -> (i32, i32) {
    match version {
        HttpVersion::HTTP_09 => (0, 9),
        HttpVersion::HTTP_10 => (1, 0),
        HttpVersion::HTTP_2 => (2, 0),
        HttpVersion::HTTP_3 => (3, 0),
        _ => (1, 1),
    }
}

fn write_response(response: Response) -> HttpResponse {
    let status = u16::try_from(response.status)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok());
    let Some(status) = status else {
        return invalid_response(format!("status {}", response.status));
    };

    let mut out = HttpResponse::new(Body::from(response.body));
    *out.status_mut() = status;
    for (name, values) in response.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            return invalid_response(format!("header name '{name}'"));
        };
        for value in values {
            let Ok(value) = HeaderValue::from_str(&value) else {
                return invalid_response(format!("value of header '{name}'"));
            };
            out.headers_mut().append(name.clone(), value);
        }
    }
    out
}

fn invalid_response(what: String) -> HttpResponse {
    tracing::error!(detail = %what, "worker returned an unusable response");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Invalid response from service",
        Some(format!("invalid {what}")),
    )
}

// ---------------------------------------------------------------------------
// Admin and error handlers
// ---------------------------------------------------------------------------

async fn healthz() -> HttpResponse {
    json_body(StatusCode::OK, json!({ "status": "OK" }).to_string().into_bytes())
}

fn manifest_response(manifest: &Manifest) -> HttpResponse {
    match manifest.to_json_bytes() {
        Ok(bytes) => json_body(StatusCode::OK, bytes),
        Err(err) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to marshal manifest to JSON",
            Some(err.to_string()),
        ),
    }
}

pub(crate) async fn not_found() -> HttpResponse {
    json_error(StatusCode::NOT_FOUND, "Resource not found", None)
}

pub(crate) async fn method_not_allowed() -> HttpResponse {
    json_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed", None)
}

/// JSON error body carrying `title` and an optional `detail`.
pub fn json_error(status: StatusCode, title: &str, detail: Option<String>) -> HttpResponse {
    let body = match detail {
        Some(detail) => json!({ "title": title, "detail": detail }),
        None => json!({ "title": title }),
    };
    json_body(status, body.to_string().into_bytes())
}

pub(crate) fn json_body(status: StatusCode, body: Vec<u8>) -> HttpResponse {
    let mut response = HttpResponse::new(Body::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}
