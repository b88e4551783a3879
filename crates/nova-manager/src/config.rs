//! `clouds.yaml` discovery and profile loading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, VmError};

/// Profile used when none is given on the command line or in `OS_CLOUD`.
pub const DEFAULT_CLOUD: &str = "nectar";

/// Environment variable naming an explicit config file.
pub const CONFIG_FILE_ENV: &str = "OS_CLIENT_CONFIG_FILE";

const FILE_NAMES: &[&str] = &["clouds.yaml", "clouds.yml"];
const SYSTEM_CONFIG_DIR: &str = "/etc/openstack";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudsFile {
    #[serde(default)]
    pub clouds: HashMap<String, CloudProfile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudProfile {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub region_name: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    pub auth_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(alias = "tenant_name")]
    pub project_name: Option<String>,
    #[serde(alias = "tenant_id")]
    pub project_id: Option<String>,
    pub user_domain_name: Option<String>,
    pub user_domain_id: Option<String>,
    pub project_domain_name: Option<String>,
    pub project_domain_id: Option<String>,
    pub application_credential_id: Option<String>,
    pub application_credential_secret: Option<String>,
}

/// Credentials extracted from a profile, ready to send to Keystone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password {
        username: String,
        password: String,
        user_domain: Domain,
        project: Project,
    },
    ApplicationCredential {
        id: String,
        secret: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    Id(String),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Project {
    Id(String),
    Name { name: String, domain: Domain },
}

/// A profile resolved from a specific file.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub name: String,
    pub path: PathBuf,
    pub auth_url: String,
    pub method: AuthMethod,
    pub region: Option<String>,
    pub interface: String,
}

impl CloudProfile {
    fn resolve(self, name: &str, path: &Path) -> Result<CloudConfig> {
        let invalid = |detail: &str| VmError::InvalidProfile {
            cloud: name.to_string(),
            detail: detail.to_string(),
        };

        let auth = self.auth;
        let auth_url = auth
            .auth_url
            .ok_or_else(|| invalid("auth.auth_url is missing"))?;

        let method = match self.auth_type.as_deref().unwrap_or("password") {
            "password" | "v3password" => {
                let username = auth
                    .username
                    .ok_or_else(|| invalid("auth.username is missing"))?;
                let password = auth
                    .password
                    .ok_or_else(|| invalid("auth.password is missing"))?;
                let user_domain = domain(auth.user_domain_id, auth.user_domain_name);
                let project = match (auth.project_id, auth.project_name) {
                    (Some(id), _) => Project::Id(id),
                    (None, Some(project_name)) => Project::Name {
                        name: project_name,
                        domain: domain(auth.project_domain_id, auth.project_domain_name),
                    },
                    (None, None) => {
                        return Err(invalid("auth.project_name or auth.project_id is required"));
                    }
                };
                AuthMethod::Password {
                    username,
                    password,
                    user_domain,
                    project,
                }
            }
            "v3applicationcredential" => AuthMethod::ApplicationCredential {
                id: auth
                    .application_credential_id
                    .ok_or_else(|| invalid("auth.application_credential_id is missing"))?,
                secret: auth
                    .application_credential_secret
                    .ok_or_else(|| invalid("auth.application_credential_secret is missing"))?,
            },
            other => {
                return Err(VmError::UnsupportedAuth {
                    cloud: name.to_string(),
                    auth_type: other.to_string(),
                });
            }
        };

        Ok(CloudConfig {
            name: name.to_string(),
            path: path.to_path_buf(),
            auth_url,
            method,
            region: self.region_name,
            interface: self.interface.unwrap_or_else(|| "public".to_string()),
        })
    }
}

fn domain(id: Option<String>, name: Option<String>) -> Domain {
    match (id, name) {
        (Some(id), _) => Domain::Id(id),
        (None, Some(name)) => Domain::Name(name),
        (None, None) => Domain::Id("default".to_string()),
    }
}

/// Candidate config files in search order.
fn candidates(
    env_override: Option<PathBuf>,
    cwd: Option<PathBuf>,
    user_config: Option<PathBuf>,
) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(p) = env_override {
        paths.push(p);
    }
    let dirs = [
        cwd,
        user_config.map(|d| d.join("openstack")),
        Some(PathBuf::from(SYSTEM_CONFIG_DIR)),
    ];
    for dir in dirs.into_iter().flatten() {
        for file in FILE_NAMES {
            paths.push(dir.join(file));
        }
    }
    paths
}

fn first_existing(paths: &[PathBuf]) -> Result<PathBuf> {
    paths
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| VmError::ConfigNotFound {
            searched: paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
}

/// Locate `clouds.yaml`.
///
/// An explicit path must exist. Otherwise `OS_CLIENT_CONFIG_FILE`, the working directory,
/// `~/.config/openstack` and `/etc/openstack` are tried in that order.
pub fn discover(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return first_existing(&[path.to_path_buf()]);
    }
    let paths = candidates(
        std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from),
        std::env::current_dir().ok(),
        dirs::config_dir(),
    );
    let found = first_existing(&paths)?;
    debug!(path = %found.display(), "using cloud config");
    Ok(found)
}

/// Parse a config file and resolve the named profile.
pub fn load(path: &Path, cloud: &str) -> Result<CloudConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| VmError::ConfigParse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    parse(&text, path, cloud)
}

fn parse(text: &str, path: &Path, cloud: &str) -> Result<CloudConfig> {
    let file: CloudsFile = serde_yaml::from_str(text).map_err(|e| VmError::ConfigParse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let mut clouds = file.clouds;
    let profile = clouds
        .remove(cloud)
        .ok_or_else(|| VmError::ProfileNotFound {
            name: cloud.to_string(),
            path: path.to_path_buf(),
        })?;
    profile.resolve(cloud, path)
}
