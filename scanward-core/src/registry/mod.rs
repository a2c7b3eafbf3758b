//! Container registry discovery.
//!
//! A registry URL names a repository host and an image mask such as
//! `team/*:1.*`. [`RegistryCatalog`] expands the mask into concrete
//! `name:tag` references, optionally with their content digests.

pub mod client;
pub mod context;
pub mod glob;

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::model::OrderedMap;

pub use client::RegistryClient;
pub use context::{Credentials, KnownRegistries, RegistryContext};
pub use glob::Glob;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Read each image's `Docker-Content-Digest`.
    pub digests: bool,
    /// List everything below the mask (`<mask>/*:*`) and report names
    /// relative to it.
    pub expand_mask: bool,
}

/// Images a context resolved to, plus failures that only affected part of
/// the listing.
#[derive(Debug, Default)]
pub struct ImageListing {
    /// `name:tag` to digest (when requested and available).
    pub images: OrderedMap<Option<String>>,
    pub errors: Vec<RegistryError>,
}

#[async_trait]
pub trait RegistryCatalog: Send + Sync {
    /// Fails as a whole only when the catalog itself cannot be read.
    async fn list_images(
        &self,
        ctx: &RegistryContext,
        query: ListQuery,
    ) -> Result<ImageListing, RegistryError>;
}

/// Splits an image mask into name and tag masks. The tag defaults to `*`.
pub fn split_mask(mask: &str) -> (&str, &str) {
    match mask.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (mask, "*"),
    }
}

/// Mask used to enumerate everything below a destination prefix.
pub fn expanded_mask(prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        "*:*".to_string()
    } else {
        format!("{prefix}/*:*")
    }
}
