//! Container runtime used to stage images for scanning and to publish clean
//! ones.

pub mod podman;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::registry::Credentials;

pub use podman::Podman;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Logs in to `repository` (`host[:port]`). Succeeds without doing
    /// anything when there are no credentials.
    async fn login(&self, repository: &str, credentials: Option<&Credentials>) -> Result<(), EngineError>;

    /// Pulls `repository/image` and returns the local image id.
    async fn pull(&self, repository: &str, image: &str, tls: bool) -> Result<String, EngineError>;

    async fn tag(&self, source: &str, destination: &str) -> Result<(), EngineError>;

    async fn push(&self, destination: &str, tls: bool) -> Result<(), EngineError>;

    /// Removes a local image copy.
    async fn remove(&self, image_id: &str) -> Result<(), EngineError>;
}
