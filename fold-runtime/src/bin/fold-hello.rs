//! Demo worker.
//!
//! Binds the socket named by `SOCK_ADDR` and serves:
//!
//! - `GET /hello/:name` → `{"greeting": "<greeting>, <name>!"}`
//! - `POST /items` → echoes the JSON body with 201
//! - `GET /crash` → exits with status 1
//!
//! The greeting defaults to `Hello`; an optional first argument names a file
//! whose trimmed contents replace it, read once at startup.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use fold_manifest::{HttpMethod, Manifest, Route, Version};
use fold_runtime::addr::SOCK_ADDR_ENV;
use fold_runtime::config::Stage;
use fold_runtime::logging::init_tracing;
use fold_runtime::transport::server::{bind, serve, IngressService};
use fold_runtime::transport::{Request, Response};
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct Hello {
    greeting: String,
}

#[async_trait]
impl IngressService for Hello {
    fn manifest(&self) -> Manifest {
        let mut manifest = Manifest::new("fold-hello")
            .with_route(Route::new(HttpMethod::Get, "hello", "/hello/:name"))
            .with_route(Route::new(HttpMethod::Post, "create_item", "/items"))
            .with_route(Route::new(HttpMethod::Get, "crash", "/crash"));
        manifest.version = Version {
            major: 0,
            minor: 1,
            patch: 0,
        };
        manifest
    }

    async fn handle(&self, request: Request) -> Response {
        match request.route.as_str() {
            "/hello/:name" => {
                let name = request.path_params.get("name").map(String::as_str).unwrap_or("world");
                Response::json(200, &json!({ "greeting": format!("{}, {name}!", self.greeting) }))
            }
            "/items" => Response::new(201)
                .with_header("Content-Type", "application/json")
                .with_body(request.body),
            "/crash" => {
                tracing::warn!("crash requested");
                std::process::exit(1);
            }
            other => Response::json(404, &json!({ "title": format!("no handler for {other}") })),
        }
    }
}

fn load_greeting(path: Option<&Path>) -> Result<String, String> {
    let Some(path) = path else {
        return Ok("Hello".to_string());
    };
    let greeting = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read greeting file {}: {e}", path.display()))?;
    Ok(greeting.trim().to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing(Stage::from_env_value(std::env::var("FOLD_STAGE").ok().as_deref()));

    let Ok(socket) = std::env::var(SOCK_ADDR_ENV) else {
        eprintln!("fold-hello: {SOCK_ADDR_ENV} is not set");
        return ExitCode::from(2);
    };
    let greeting_file = std::env::args().nth(1);
    let greeting = match load_greeting(greeting_file.as_deref().map(Path::new)) {
        Ok(greeting) => greeting,
        Err(err) => {
            eprintln!("fold-hello: {err}");
            return ExitCode::from(2);
        }
    };

    let listener = match bind(Path::new(&socket)) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("fold-hello: {err}");
            return ExitCode::from(2);
        }
    };
    tracing::info!(socket = %socket, greeting = %greeting, "fold-hello listening");

    match serve(listener, Arc::new(Hello { greeting }), CancellationToken::new()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fold-hello: {err}");
            ExitCode::FAILURE
        }
    }
}
