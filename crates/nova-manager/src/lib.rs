//! Lifecycle management for per-user machines on an OpenStack compute service.

pub mod backends;
pub mod config;
pub mod error;
pub mod keypair;
pub mod ops;
pub mod poll;
pub mod traits;
pub mod types;

use std::path::PathBuf;

pub use backends::memory::{Calls, MemoryCompute};
pub use backends::openstack::OpenStackSession;
pub use error::{Result, VmError};
pub use keypair::{EnsuredKeypair, KeyStore, ensure_keypair};
pub use ops::{
    CreateRequest, CreatedVm, ManageAction, ManageOutcome, Progress, Reporter, VmManager,
};
pub use poll::PollPolicy;
pub use traits::ComputeApi;
pub use types::{Server, ServerStatus};

/// Where to find credentials for [`connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub cloud: String,
    pub config_file: Option<PathBuf>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            cloud: config::DEFAULT_CLOUD.to_string(),
            config_file: None,
        }
    }
}

/// Load the named profile from `clouds.yaml` and authenticate.
pub async fn connect(options: &ConnectOptions) -> Result<OpenStackSession> {
    let path = config::discover(options.config_file.as_deref())?;
    let cloud = config::load(&path, &options.cloud)?;
    OpenStackSession::connect(&cloud).await
}
