use std::sync::{Mutex, MutexGuard};

use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tracing::info;

use crate::error::{Result, VmError};
use crate::traits::ComputeApi;
use crate::types::{
    AddressRecord, Addresses, Flavor, Image, Keypair, Server, ServerAction, ServerCreate,
    ServerQuery, ServerStatus,
};

/// In-memory compute service for development and tests.
///
/// Transitions triggered by actions, creation and deletion settle after a configurable number
/// of `get_server` polls, so callers exercise their wait loops. Every mutating call is
/// recorded in [`Calls`].
#[derive(Debug, Default)]
pub struct MemoryCompute {
    state: Mutex<MemoryState>,
}

/// Calls observed by a [`MemoryCompute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Calls {
    pub create_server: Vec<ServerCreate>,
    pub delete_server: Vec<String>,
    pub actions: Vec<(String, ServerAction)>,
    pub create_keypair: Vec<String>,
    pub flavor_lookups: Vec<String>,
    pub image_lookups: Vec<String>,
    pub get_server: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    servers: Vec<MemoryServer>,
    flavors: Vec<Flavor>,
    images: Vec<Image>,
    keypairs: Vec<Keypair>,
    calls: Calls,
    settle_after: u32,
    fail_actions: bool,
    ignore_actions: bool,
    fail_keypairs: bool,
    next_address: u32,
}

#[derive(Debug)]
struct MemoryServer {
    server: Server,
    pending: Option<Pending>,
}

#[derive(Debug)]
enum Pending {
    Status { to: ServerStatus, polls_left: u32 },
    Removal { polls_left: u32 },
}

/// Literal part of a Nova name regex, used to approximate server-side filtering.
fn literal_prefix(pattern: &str) -> String {
    let mut out = String::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => out.push(escaped),
                None => break,
            },
            c if ".*+?()[]{}|^$".contains(c) => break,
            c => out.push(c),
        }
    }
    out
}

fn network(addr: &str) -> Addresses {
    Addresses::new(vec![(
        "private".to_string(),
        vec![AddressRecord {
            addr: addr.to_string(),
            version: Some(4),
            kind: Some("fixed".to_string()),
        }],
    )])
}

impl MemoryCompute {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_flavor(self, name: &str) -> Self {
        self.lock().flavors.push(Flavor {
            id: format!("flavor-{}", uuid::Uuid::new_v4()),
            name: name.to_string(),
        });
        self
    }

    pub fn with_image(self, name: &str) -> Self {
        self.lock().images.push(Image {
            id: format!("image-{}", uuid::Uuid::new_v4()),
            name: name.to_string(),
        });
        self
    }

    /// Seed an existing server, optionally with a single address on a `private` network.
    pub fn with_server(self, name: &str, status: ServerStatus, addr: Option<&str>) -> Self {
        self.lock().servers.push(MemoryServer {
            server: Server {
                id: format!("server-{}", uuid::Uuid::new_v4()),
                name: name.to_string(),
                status,
                addresses: addr.map(network).unwrap_or_default(),
            },
            pending: None,
        });
        self
    }

    pub fn with_keypair(self, name: &str, public_key: &str) -> Self {
        self.lock().keypairs.push(Keypair {
            name: name.to_string(),
            public_key: public_key.to_string(),
            private_key: None,
            fingerprint: None,
        });
        self
    }

    /// Number of `get_server` polls before a transition lands.
    pub fn settle_after(self, polls: u32) -> Self {
        self.lock().settle_after = polls;
        self
    }

    /// Actions still land but their submission reports an error.
    pub fn fail_actions(self) -> Self {
        self.lock().fail_actions = true;
        self
    }

    /// Actions are accepted and never take effect.
    pub fn ignore_actions(self) -> Self {
        self.lock().ignore_actions = true;
        self
    }

    /// Keypair creation is rejected by the service.
    pub fn fail_keypairs(self) -> Self {
        self.lock().fail_keypairs = true;
        self
    }

    pub fn calls(&self) -> Calls {
        self.lock().calls.clone()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.lock()
            .servers
            .iter()
            .map(|s| s.server.name.clone())
            .collect()
    }
}

impl ComputeApi for MemoryCompute {
    async fn list_servers(&self, query: &ServerQuery) -> Result<Vec<Server>> {
        let state = self.lock();
        let prefix = query
            .name
            .as_deref()
            .map(literal_prefix)
            .unwrap_or_default();
        Ok(state
            .servers
            .iter()
            .filter(|s| s.server.name.contains(prefix.as_str()))
            .map(|s| {
                if query.detailed {
                    s.server.clone()
                } else {
                    Server {
                        id: s.server.id.clone(),
                        name: s.server.name.clone(),
                        status: ServerStatus::Unknown,
                        addresses: Addresses::default(),
                    }
                }
            })
            .collect())
    }

    async fn get_server(&self, id: &str) -> Result<Server> {
        let mut state = self.lock();
        state.calls.get_server += 1;
        let not_found = || VmError::NotFound {
            kind: "server",
            name: id.to_string(),
        };
        let idx = state
            .servers
            .iter()
            .position(|s| s.server.id == id)
            .ok_or_else(not_found)?;

        let entry = &mut state.servers[idx];
        match entry.pending.take() {
            Some(Pending::Status { to, polls_left: 0 }) => entry.server.status = to,
            Some(Pending::Status { to, polls_left }) => {
                entry.pending = Some(Pending::Status {
                    to,
                    polls_left: polls_left - 1,
                })
            }
            Some(Pending::Removal { polls_left: 0 }) => {
                state.servers.remove(idx);
                return Err(not_found());
            }
            Some(Pending::Removal { polls_left }) => {
                entry.pending = Some(Pending::Removal {
                    polls_left: polls_left - 1,
                })
            }
            None => {}
        }
        Ok(state.servers[idx].server.clone())
    }

    async fn create_server(&self, request: &ServerCreate) -> Result<Server> {
        let mut state = self.lock();
        state.calls.create_server.push(request.clone());

        if request.flavor_ref.is_none() || request.image_ref.is_none() {
            return Err(VmError::Api {
                method: "POST",
                url: "memory://servers".to_string(),
                status: 400,
                detail: "flavorRef and imageRef are required".to_string(),
            });
        }

        state.next_address += 1;
        let addr = format!("10.0.0.{}", state.next_address + 10);
        let server = Server {
            id: format!("server-{}", uuid::Uuid::new_v4()),
            name: request.name.clone(),
            status: ServerStatus::Other("BUILD".to_string()),
            addresses: network(&addr),
        };
        let polls_left = state.settle_after;
        state.servers.push(MemoryServer {
            server: server.clone(),
            pending: Some(Pending::Status {
                to: ServerStatus::Active,
                polls_left,
            }),
        });
        info!(name = %server.name, id = %server.id, "memory: create");
        Ok(server)
    }

    async fn delete_server(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.delete_server.push(id.to_string());
        let polls_left = state.settle_after;
        let entry = state
            .servers
            .iter_mut()
            .find(|s| s.server.id == id)
            .ok_or_else(|| VmError::NotFound {
                kind: "server",
                name: id.to_string(),
            })?;
        entry.server.status = ServerStatus::Other("DELETED".to_string());
        entry.pending = Some(Pending::Removal { polls_left });
        Ok(())
    }

    async fn server_action(&self, id: &str, action: ServerAction) -> Result<()> {
        let mut state = self.lock();
        state.calls.actions.push((id.to_string(), action));
        let (polls_left, fail, ignore) =
            (state.settle_after, state.fail_actions, state.ignore_actions);

        if !ignore {
            let entry = state
                .servers
                .iter_mut()
                .find(|s| s.server.id == id)
                .ok_or_else(|| VmError::NotFound {
                    kind: "server",
                    name: id.to_string(),
                })?;
            let to = match action {
                ServerAction::Suspend => ServerStatus::Suspended,
                ServerAction::Resume => ServerStatus::Active,
                ServerAction::SoftReboot => {
                    entry.server.status = ServerStatus::Other("REBOOT".to_string());
                    ServerStatus::Active
                }
            };
            entry.pending = Some(Pending::Status { to, polls_left });
        }

        if fail {
            return Err(VmError::Api {
                method: "POST",
                url: format!("memory://servers/{id}/action"),
                status: 409,
                detail: format!("{action} submission rejected"),
            });
        }
        Ok(())
    }

    async fn find_flavor(&self, name: &str) -> Result<Option<Flavor>> {
        let mut state = self.lock();
        state.calls.flavor_lookups.push(name.to_string());
        Ok(state.flavors.iter().find(|f| f.name == name).cloned())
    }

    async fn find_image(&self, name: &str) -> Result<Option<Image>> {
        let mut state = self.lock();
        state.calls.image_lookups.push(name.to_string());
        Ok(state.images.iter().find(|i| i.name == name).cloned())
    }

    async fn find_keypair(&self, name: &str) -> Result<Option<Keypair>> {
        Ok(self.lock().keypairs.iter().find(|k| k.name == name).cloned())
    }

    async fn create_keypair(&self, name: &str) -> Result<Keypair> {
        let mut state = self.lock();
        state.calls.create_keypair.push(name.to_string());
        if state.fail_keypairs {
            return Err(VmError::Api {
                method: "POST",
                url: "memory://os-keypairs".to_string(),
                status: 403,
                detail: "quota exceeded for key pairs".to_string(),
            });
        }
        if state.keypairs.iter().any(|k| k.name == name) {
            return Err(VmError::Api {
                method: "POST",
                url: "memory://os-keypairs".to_string(),
                status: 409,
                detail: format!("keypair '{name}' already exists"),
            });
        }

        let generation_failed = |e: ssh_key::Error| VmError::KeypairCreation {
            name: name.to_string(),
            detail: e.to_string(),
        };
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(generation_failed)?;
        let private_key = key.to_openssh(LineEnding::LF).map_err(generation_failed)?;
        let public_key = key.public_key().to_openssh().map_err(generation_failed)?;

        let keypair = Keypair {
            name: name.to_string(),
            public_key,
            private_key: None,
            fingerprint: None,
        };
        state.keypairs.push(keypair.clone());
        Ok(Keypair {
            private_key: Some(private_key.to_string()),
            ..keypair
        })
    }
}
