//! Create, list and manage a user's machines.
//!
//! Machines belong to a user by name: `<user>-<N>` with `N` a decimal index. New machines
//! take one past the highest index in use.

use std::fmt;

use tracing::{info, warn};

use crate::error::Result;
use crate::keypair::{EnsuredKeypair, KeyStore, ensure_keypair};
use crate::poll::{PollPolicy, Probe};
use crate::traits::ComputeApi;
use crate::types::{
    Flavor, Image, SecurityGroupRef, Server, ServerAction, ServerCreate, ServerQuery, ServerStatus,
};

pub const DEFAULT_FLAVOR: &str = "m2.medium";
pub const DEFAULT_IMAGE: &str = "NeCTAR CentOS 7 x86_64";
pub const SECURITY_GROUP: &str = "default";
pub const AVAILABILITY_ZONE: &str = "intersect";

/// Index of `name` among `user_id`'s machines, as decimal digits without leading zeros.
///
/// Indices are compared as digit strings so that no suffix is too large to number past.
pub fn machine_index<'n>(user_id: &str, name: &'n str) -> Option<&'n str> {
    let suffix = name.strip_prefix(user_id)?.strip_prefix('-')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match suffix.trim_start_matches('0') {
        "" => Some("0"),
        digits => Some(digits),
    }
}

/// Add one to a run of decimal digits.
fn increment(digits: &str) -> String {
    let mut out: Vec<u8> = digits.bytes().collect();
    for d in out.iter_mut().rev() {
        if *d == b'9' {
            *d = b'0';
        } else {
            *d += 1;
            return out.into_iter().map(char::from).collect();
        }
    }
    std::iter::once('1').chain(out.into_iter().map(char::from)).collect()
}

/// Name for the next machine of `user_id` given the names already in use.
pub fn next_machine_name<'n>(user_id: &str, existing: impl IntoIterator<Item = &'n str>) -> String {
    let next = existing
        .into_iter()
        .filter_map(|name| machine_index(user_id, name))
        .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
        .map_or_else(|| "0".to_string(), increment);
    format!("{user_id}-{next}")
}

/// Backslash-escape regex metacharacters; Nova matches `name` filters as a regex.
pub fn escape_pattern(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if ".*+?()[]{}|^$\\".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Nova name filter for a user's machines.
fn user_pattern(user_id: &str) -> String {
    format!("{}-[0-9]+", escape_pattern(user_id))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub user_id: String,
    pub flavor: String,
    pub image: String,
}

impl CreateRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            flavor: DEFAULT_FLAVOR.to_string(),
            image: DEFAULT_IMAGE.to_string(),
        }
    }
}

/// A machine that reached ACTIVE after creation.
#[derive(Debug, Clone)]
pub struct CreatedVm {
    pub server: Server,
    pub keypair: EnsuredKeypair,
    pub flavor: Option<Flavor>,
    pub image: Option<Image>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManageAction {
    Status,
    Suspend,
    Resume,
    Reboot,
    Delete,
}

impl fmt::Display for ManageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManageAction::Status => "status",
            ManageAction::Suspend => "suspend",
            ManageAction::Resume => "resume",
            ManageAction::Reboot => "reboot",
            ManageAction::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// What a manage command did. Unmet preconditions are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManageOutcome {
    NotFound,
    Status(ServerStatus),
    Suspended(Server),
    AlreadySuspended(ServerStatus),
    Resumed(Server),
    AlreadyActive(ServerStatus),
    Rebooted(Server),
    Deleted,
    DeleteAborted,
}

pub fn delete_prompt(name: &str) -> String {
    format!("This action cannot be reversed. Are you sure you want to delete '{name}' (y/n)?")
}

/// Milestones of a running operation, reported as they happen.
#[derive(Debug, Clone, Copy)]
pub enum Progress<'a> {
    /// The user's keypair is in place; the VM has not been submitted yet.
    Keypair(&'a EnsuredKeypair),
    /// The create request was accepted. Waiting for ACTIVE follows.
    Submitted(&'a Server),
    /// About to submit `action`. Waiting for its result follows.
    Acting { action: ManageAction, name: &'a str },
}

/// Receives [`Progress`] and answers the delete prompt.
pub trait Reporter {
    fn progress(&mut self, event: Progress<'_>) -> Result<()>;

    /// Raw answer to a yes/no question. The default declines.
    fn confirm(&mut self, _prompt: &str) -> Result<String> {
        Ok(String::new())
    }
}

/// VM lifecycle operations over a compute session.
pub struct VmManager<'a, C> {
    api: &'a C,
    poll: PollPolicy,
}

impl<'a, C: ComputeApi> VmManager<'a, C> {
    pub fn new(api: &'a C, poll: PollPolicy) -> Self {
        Self { api, poll }
    }

    /// All machines of `user_id`, in the order the service lists them.
    pub async fn user_servers(&self, user_id: &str) -> Result<Vec<Server>> {
        let servers = self
            .api
            .list_servers(&ServerQuery::detailed(user_pattern(user_id)))
            .await?;
        Ok(servers
            .into_iter()
            .filter(|s| machine_index(user_id, &s.name).is_some())
            .collect())
    }

    pub async fn create(
        &self,
        request: &CreateRequest,
        keys: &KeyStore,
        reporter: &mut impl Reporter,
    ) -> Result<CreatedVm> {
        let user_id = request.user_id.as_str();
        info!(
            user = %user_id,
            flavor = %request.flavor,
            image = %request.image,
            "creating VM"
        );

        let existing = self.user_servers(user_id).await?;
        let name = next_machine_name(user_id, existing.iter().map(|s| s.name.as_str()));

        let flavor = self.api.find_flavor(&request.flavor).await?;
        if flavor.is_none() {
            warn!(flavor = %request.flavor, "flavor not found; passing no flavor reference");
        }
        let image = self.api.find_image(&request.image).await?;
        if image.is_none() {
            warn!(image = %request.image, "image not found; passing no image reference");
        }

        let keypair = ensure_keypair(self.api, user_id, keys).await?;
        reporter.progress(Progress::Keypair(&keypair))?;

        let submitted = self
            .api
            .create_server(&ServerCreate {
                name: name.clone(),
                flavor_ref: flavor.as_ref().map(|f| f.id.clone()),
                image_ref: image.as_ref().map(|i| i.id.clone()),
                key_name: keypair.name().to_string(),
                availability_zone: AVAILABILITY_ZONE.to_string(),
                security_groups: vec![SecurityGroupRef {
                    name: SECURITY_GROUP.to_string(),
                }],
            })
            .await?;
        info!(name = %name, id = %submitted.id, "VM submitted; waiting for ACTIVE");
        reporter.progress(Progress::Submitted(&submitted))?;

        let server = self.wait_for_status(&submitted, ServerStatus::Active).await?;
        Ok(CreatedVm {
            server,
            keypair,
            flavor,
            image,
        })
    }

    /// Look a machine up by exact name.
    pub async fn find(&self, name: &str) -> Result<Option<Server>> {
        let servers = self
            .api
            .list_servers(&ServerQuery::detailed(escape_pattern(name)))
            .await?;
        Ok(servers.into_iter().find(|s| s.name == name))
    }

    /// Run `action` against the machine called `name`.
    ///
    /// Delete asks `reporter` to confirm; only `y` (any case, surrounding whitespace
    /// ignored) goes ahead.
    pub async fn manage(
        &self,
        name: &str,
        action: ManageAction,
        reporter: &mut impl Reporter,
    ) -> Result<ManageOutcome> {
        let Some(server) = self.find(name).await? else {
            return Ok(ManageOutcome::NotFound);
        };

        match action {
            ManageAction::Status => Ok(ManageOutcome::Status(server.status)),
            ManageAction::Suspend => {
                if server.status != ServerStatus::Active {
                    return Ok(ManageOutcome::AlreadySuspended(server.status));
                }
                reporter.progress(Progress::Acting { action, name })?;
                let server = self
                    .fire_and_wait(&server, ServerAction::Suspend, ServerStatus::Suspended)
                    .await?;
                Ok(ManageOutcome::Suspended(server))
            }
            ManageAction::Resume => {
                if server.status != ServerStatus::Suspended {
                    return Ok(ManageOutcome::AlreadyActive(server.status));
                }
                reporter.progress(Progress::Acting { action, name })?;
                let server = self
                    .fire_and_wait(&server, ServerAction::Resume, ServerStatus::Active)
                    .await?;
                Ok(ManageOutcome::Resumed(server))
            }
            ManageAction::Reboot => {
                reporter.progress(Progress::Acting { action, name })?;
                let server = self
                    .fire_and_wait(&server, ServerAction::SoftReboot, ServerStatus::Active)
                    .await?;
                Ok(ManageOutcome::Rebooted(server))
            }
            ManageAction::Delete => {
                let answer = reporter.confirm(&delete_prompt(name))?;
                if !answer.trim().eq_ignore_ascii_case("y") {
                    return Ok(ManageOutcome::DeleteAborted);
                }
                info!(name = %name, "deleting");
                reporter.progress(Progress::Acting { action, name })?;
                self.api.delete_server(&server.id).await?;
                self.wait_for_removal(&server).await?;
                Ok(ManageOutcome::Deleted)
            }
        }
    }

    /// Submit an action, ignoring submission errors, then wait for `target`.
    async fn fire_and_wait(
        &self,
        server: &Server,
        action: ServerAction,
        target: ServerStatus,
    ) -> Result<Server> {
        info!(name = %server.name, action = %action, "submitting action");
        if let Err(e) = self.api.server_action(&server.id, action).await {
            warn!(
                name = %server.name,
                action = %action,
                error = %e,
                "action submission failed; waiting for the target state anyway"
            );
        }
        self.wait_for_status(server, target).await
    }

    async fn wait_for_status(&self, server: &Server, target: ServerStatus) -> Result<Server> {
        let api = self.api;
        let id = server.id.as_str();
        let target_ref = &target;
        self.poll
            .wait(&server.name, &target.to_string(), move || async move {
                let current = api.get_server(id).await?;
                if current.status == *target_ref {
                    Ok(Probe::Ready(current))
                } else {
                    Ok(Probe::Pending(current.status.to_string()))
                }
            })
            .await
    }

    /// Wait until the service no longer knows the server.
    async fn wait_for_removal(&self, server: &Server) -> Result<()> {
        let api = self.api;
        let id = server.id.as_str();
        self.poll
            .wait(&server.name, "deleted", move || async move {
                match api.get_server(id).await {
                    Ok(current) => Ok(Probe::Pending(current.status.to_string())),
                    Err(e) if e.is_not_found() => Ok(Probe::Ready(())),
                    Err(e) => Err(e),
                }
            })
            .await
    }
}
