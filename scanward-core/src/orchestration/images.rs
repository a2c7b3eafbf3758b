//! Setup and per-item handling specific to image jobs.

use std::sync::Arc;

use crate::container::ContainerRuntime;
use crate::model::{JobError, OrderedMap};
use crate::registry::{
    KnownRegistries, ListQuery, RegistryCatalog, RegistryContext,
};
use tracing::{debug, warn};

/// Destination registry state resolved before the first item.
#[derive(Debug)]
pub struct Destination {
    pub ctx: RegistryContext,
    /// Images already present, relative to the destination mask, with digests.
    pub existing: OrderedMap<Option<String>>,
}

/// Everything an image job needs to process its items.
#[derive(Debug)]
pub struct ImageSession {
    pub source: RegistryContext,
    pub destination: Option<Destination>,
    pub skip_existing: bool,
}

impl ImageSession {
    /// The destination already holds `item` with the same digest.
    pub fn already_published(&self, item: &str, source_digest: Option<&str>) -> bool {
        if !self.skip_existing {
            return false;
        }
        let Some(destination) = self.destination.as_ref() else {
            return false;
        };
        match (destination.existing.get(item), source_digest) {
            (Some(Some(existing)), Some(digest)) => existing == digest,
            _ => false,
        }
    }
}

/// Outcome of the setup phase.
#[derive(Debug, Default)]
pub struct SetupOutcome {
    pub session: Option<ImageSession>,
    pub items: OrderedMap<Option<String>>,
    pub errors: Vec<JobError>,
}

pub(crate) struct ImageSetup<'a> {
    pub(crate) registry: &'a Arc<dyn RegistryCatalog>,
    pub(crate) runtime: &'a Arc<dyn ContainerRuntime>,
    pub(crate) known: &'a KnownRegistries,
}

impl ImageSetup<'_> {
    /// Resolves the source images and prepares the destination. Only an
    /// unparsable source is fatal (`session` is `None`).
    pub(crate) async fn prepare(
        &self,
        source: Option<&str>,
        destination: Option<&str>,
        skip_existing: bool,
    ) -> SetupOutcome {
        let mut outcome = SetupOutcome::default();

        let source_ctx = match source.map(|s| RegistryContext::parse(s, self.known)) {
            Some(Ok(ctx)) => ctx,
            Some(Err(err)) => {
                outcome.errors.push(
                    JobError::new(err.code(), "unable to create registry context")
                        .with_details(err.to_string()),
                );
                return outcome;
            }
            None => {
                outcome
                    .errors
                    .push(JobError::new(-1, "unable to create registry context").with_details("no source"));
                return outcome;
            }
        };

        if let Err(err) = self
            .runtime
            .login(&source_ctx.repository, source_ctx.credentials.as_ref())
            .await
        {
            outcome.errors.push(
                JobError::new(err.code(), format!("unable login to source {}", source_ctx.repository))
                    .with_details(err.output()),
            );
        }

        let query = ListQuery {
            digests: skip_existing,
            expand_mask: false,
        };
        match self.registry.list_images(&source_ctx, query).await {
            Ok(listing) => {
                outcome.items = listing.images;
                outcome.errors.extend(listing.errors.into_iter().map(|err| {
                    JobError::new(err.code(), "unable to resolve image tags").with_details(err.to_string())
                }));
            }
            Err(err) => {
                warn!(registry = %source_ctx.repository, error = %err, "unable to resolve source images");
                outcome
                    .errors
                    .push(JobError::new(err.code(), "Invalid source").with_details(err.to_string()));
            }
        }

        let destination = match destination {
            Some(url) => self.prepare_destination(url, skip_existing, &mut outcome.errors).await,
            None => None,
        };

        debug!(
            source = %source_ctx.repository,
            images = outcome.items.len(),
            destination = destination.is_some(),
            "image job prepared"
        );
        outcome.session = Some(ImageSession {
            source: source_ctx,
            destination,
            skip_existing,
        });
        outcome
    }

    async fn prepare_destination(
        &self,
        url: &str,
        skip_existing: bool,
        errors: &mut Vec<JobError>,
    ) -> Option<Destination> {
        let ctx = match RegistryContext::parse(url, self.known) {
            Ok(ctx) => ctx,
            Err(err) => {
                errors.push(
                    JobError::new(err.code(), "unable to create destination registry context")
                        .with_details(err.to_string()),
                );
                return None;
            }
        };

        if let Err(err) = self.runtime.login(&ctx.repository, ctx.credentials.as_ref()).await {
            errors.push(
                JobError::new(err.code(), format!("unable login to destination {}", ctx.repository))
                    .with_details(err.output()),
            );
        }

        let mut existing = OrderedMap::new();
        if skip_existing {
            let query = ListQuery {
                digests: true,
                expand_mask: true,
            };
            match self.registry.list_images(&ctx, query).await {
                Ok(listing) => {
                    existing = listing.images;
                    errors.extend(listing.errors.into_iter().map(|err| {
                        JobError::new(err.code(), "Unable to get images hash from destination registry")
                            .with_details(err.to_string())
                    }));
                }
                Err(err) => errors.push(
                    JobError::new(err.code(), "Unable to get images hash from destination registry")
                        .with_details(err.to_string()),
                ),
            }
        }

        Some(Destination { ctx, existing })
    }
}
