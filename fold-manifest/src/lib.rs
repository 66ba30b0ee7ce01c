//! Fold manifest library: the worker interface description shared by the
//! runtime and the worker SDKs.
//!
//! - [`types`]: [`Manifest`], [`Route`], [`HttpMethod`], [`Version`], [`BuildInfo`]
//! - [`error`]: [`ManifestError`]

pub mod error;
pub mod types;

pub use error::ManifestError;
pub use types::{BuildInfo, HttpMethod, Manifest, Route, Version};
