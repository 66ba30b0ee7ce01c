//! JSON roundtrip tests for `fold-manifest` types.
//!
//! Each `#[case]` is isolated, with no shared state.

use fold_manifest::{BuildInfo, HttpMethod, Manifest, Route, Version};
use rstest::rstest;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn empty_manifest() -> Manifest {
    Manifest::new("empty")
}

fn full_manifest() -> Manifest {
    Manifest {
        name: "shopping".to_string(),
        version: Version { major: 1, minor: 4, patch: 2 },
        build_info: BuildInfo {
            maintainer: "team@fold.sh".to_string(),
            image: "fold/shopping".to_string(),
            tag: "1.4.2".to_string(),
            path: "services/shopping".to_string(),
        },
        routes: vec![
            Route::new(HttpMethod::Get, "listCarts", "/carts"),
            Route::new(HttpMethod::Put, "putItem", "/carts/:cart/items/:item"),
            Route::new(HttpMethod::Delete, "deleteCart", "/carts/:cart"),
        ],
    }
}

fn unicode_manifest() -> Manifest {
    Manifest::new("サービス-сервис").with_route(Route::new(HttpMethod::Patch, "обновить", "/élément/:id"))
}

// ---------------------------------------------------------------------------
// Parameterised roundtrip test
// ---------------------------------------------------------------------------

#[rstest]
#[case("empty_routes", empty_manifest())]
#[case("all_fields", full_manifest())]
#[case("unicode_strings", unicode_manifest())]
fn manifest_roundtrip(#[case] label: &str, #[case] manifest: Manifest) {
    let bytes = manifest
        .to_json_bytes()
        .unwrap_or_else(|e| panic!("[{label}] serialize failed: {e}"));
    let back = Manifest::from_json_slice(&bytes)
        .unwrap_or_else(|e| panic!("[{label}] deserialize failed: {e}"));
    assert_eq!(manifest, back, "[{label}] manifest");
}

#[test]
fn json_encoding_uses_camel_case_keys_and_upper_case_methods() {
    let manifest = Manifest::new("svc").with_route(Route::new(HttpMethod::Get, "hello", "/hello/:name"));
    let value: serde_json::Value =
        serde_json::from_slice(&manifest.to_json_bytes().expect("encode")).expect("decode");

    assert_eq!(value["name"], "svc");
    assert_eq!(value["buildInfo"]["image"], "");
    assert_eq!(value["routes"][0]["httpMethod"], "GET");
    assert_eq!(value["routes"][0]["pathSpec"], "/hello/:name");
    assert_eq!(value["version"]["major"], 0);
}

#[test]
fn write_json_matches_to_json_bytes() {
    let manifest = full_manifest();
    let mut written = Vec::new();
    manifest.write_json(&mut written).expect("write");
    assert_eq!(written, manifest.to_json_bytes().expect("encode"));
}

#[test]
fn manifest_survives_a_file_on_disk() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("manifest.json");
    let manifest = full_manifest();

    let mut file = std::fs::File::create(&path).expect("create");
    manifest.write_json(&mut file).expect("write");
    drop(file);

    let bytes = std::fs::read(&path).expect("read");
    assert_eq!(Manifest::from_json_slice(&bytes).expect("parse"), manifest);
}

// ---------------------------------------------------------------------------
// HttpMethod roundtrip (all variants)
// ---------------------------------------------------------------------------

#[rstest]
#[case(HttpMethod::Get, "GET")]
#[case(HttpMethod::Put, "PUT")]
#[case(HttpMethod::Post, "POST")]
#[case(HttpMethod::Delete, "DELETE")]
#[case(HttpMethod::Patch, "PATCH")]
fn http_method_string_roundtrip(#[case] method: HttpMethod, #[case] text: &str) {
    assert_eq!(method.to_string(), text);
    assert_eq!(text.parse::<HttpMethod>().expect("parse"), method);
    let json = serde_json::to_string(&method).expect("serialize");
    assert_eq!(json, format!("\"{text}\""));
}

#[test]
fn version_displays_as_semver() {
    let version = Version { major: 2, minor: 0, patch: 11 };
    assert_eq!(version.to_string(), "2.0.11");
}
