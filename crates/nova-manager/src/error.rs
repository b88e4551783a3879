use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmError>;

#[derive(Debug, Error, Diagnostic)]
pub enum VmError {
    #[error("no clouds.yaml found (searched: {searched})")]
    #[diagnostic(
        code(nova::config::not_found),
        help("place clouds.yaml in the working directory, ~/.config/openstack or /etc/openstack, or set OS_CLIENT_CONFIG_FILE")
    )]
    ConfigNotFound { searched: String },

    #[error("failed to parse {}: {detail}", .path.display())]
    #[diagnostic(code(nova::config::parse))]
    ConfigParse { path: PathBuf, detail: String },

    #[error("cloud profile '{name}' not found in {}", .path.display())]
    #[diagnostic(code(nova::config::profile_not_found))]
    ProfileNotFound { name: String, path: PathBuf },

    #[error("cloud profile '{cloud}' is incomplete: {detail}")]
    #[diagnostic(code(nova::config::invalid_profile))]
    InvalidProfile { cloud: String, detail: String },

    #[error("unsupported auth_type '{auth_type}' for cloud '{cloud}'")]
    #[diagnostic(
        code(nova::config::unsupported_auth),
        help("supported auth types are 'password' and 'v3applicationcredential'")
    )]
    UnsupportedAuth { cloud: String, auth_type: String },

    #[error("authentication against {auth_url} failed: {detail}")]
    #[diagnostic(code(nova::auth::failed))]
    Authentication { auth_url: String, detail: String },

    #[error("no '{service}' endpoint in the service catalog (interface {interface}, region {region})")]
    #[diagnostic(code(nova::auth::endpoint_not_found))]
    EndpointNotFound {
        service: String,
        interface: String,
        region: String,
    },

    #[error("failed to create keypair '{name}': {detail}")]
    #[diagnostic(code(nova::keypair::create_failed))]
    KeypairCreation { name: String, detail: String },

    #[error("failed to write {}", .path.display())]
    #[diagnostic(code(nova::keypair::write_failed))]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} '{name}' not found")]
    #[diagnostic(code(nova::not_found))]
    NotFound { kind: &'static str, name: String },

    #[error("{method} {url} returned {status}: {detail}")]
    #[diagnostic(code(nova::api))]
    Api {
        method: &'static str,
        url: String,
        status: u16,
        detail: String,
    },

    #[error("HTTP request failed: {0}")]
    #[diagnostic(code(nova::http))]
    Http(#[from] reqwest::Error),

    #[error("'{name}' did not reach {target} within {timeout:?} ({polls} polls, last status {last})")]
    #[diagnostic(
        code(nova::poll::timeout),
        help("raise --poll-timeout if the cloud is slow to settle")
    )]
    PollTimeout {
        name: String,
        target: String,
        last: String,
        polls: u32,
        timeout: Duration,
    },

    #[error(transparent)]
    #[diagnostic(code(nova::io))]
    Io(#[from] std::io::Error),
}

impl VmError {
    /// True for the 404 mapping of a lookup, which delete polling treats as completion.
    pub fn is_not_found(&self) -> bool {
        matches!(self, VmError::NotFound { .. })
    }
}
