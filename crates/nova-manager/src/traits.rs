use crate::error::Result;
use crate::types::{Flavor, Image, Keypair, Server, ServerAction, ServerCreate, ServerQuery};

/// The slice of the compute API the manager needs.
///
/// Implemented by [`crate::OpenStackSession`] for real clouds and by
/// [`crate::MemoryCompute`] for tests and development.
#[allow(async_fn_in_trait)]
pub trait ComputeApi {
    /// List servers, optionally filtered by a name regex.
    async fn list_servers(&self, query: &ServerQuery) -> Result<Vec<Server>>;

    /// Fetch a server by id. A missing server is reported as [`crate::VmError::NotFound`].
    async fn get_server(&self, id: &str) -> Result<Server>;

    async fn create_server(&self, request: &ServerCreate) -> Result<Server>;

    async fn delete_server(&self, id: &str) -> Result<()>;

    async fn server_action(&self, id: &str, action: ServerAction) -> Result<()>;

    /// Find a flavor by exact name.
    async fn find_flavor(&self, name: &str) -> Result<Option<Flavor>>;

    /// Find an image by exact name.
    async fn find_image(&self, name: &str) -> Result<Option<Image>>;

    async fn find_keypair(&self, name: &str) -> Result<Option<Keypair>>;

    /// Ask the service to generate a keypair. The response carries the private key.
    async fn create_keypair(&self, name: &str) -> Result<Keypair>;
}
