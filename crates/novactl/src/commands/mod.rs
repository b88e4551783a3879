pub mod create;
pub mod list;
pub mod manage;

use std::fmt::Display;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use nova_manager::config::DEFAULT_CLOUD;
use nova_manager::{
    ComputeApi, ConnectOptions, EnsuredKeypair, KeyStore, ManageAction, PollPolicy, Progress,
    Reporter, VmManager,
};

/// Printed for any invocation that does not parse.
pub const USAGE: &str = "\
Usage:

   Create a new VM:
      novactl vm create <user_id> [-f \"flavour name\" -i \"image name\"]

   List VMs for given user:
      novactl user <user_id>

   Manage VM for given user:
      novactl vm [status|suspend|resume|reboot|delete] <vm_name>
";

#[derive(Debug, Parser)]
#[command(
    name = "novactl",
    about = "Manage per-user virtual machines on an OpenStack cloud",
    version,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Cloud profile to use from clouds.yaml
    #[arg(long, global = true, env = "OS_CLOUD", default_value = DEFAULT_CLOUD)]
    cloud: String,

    /// Explicit path to clouds.yaml (skips the search path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for newly generated keypairs (default: next to this executable)
    #[arg(long, global = true, env = "NOVACTL_KEY_DIR")]
    key_dir: Option<PathBuf>,

    /// Seconds between status polls
    #[arg(long, global = true, env = "NOVACTL_POLL_INTERVAL", default_value_t = 2)]
    poll_interval: u64,

    /// Seconds to wait for a VM to settle before giving up
    #[arg(long, global = true, env = "NOVACTL_POLL_TIMEOUT", default_value_t = 900)]
    poll_timeout: u64,
}

impl GlobalArgs {
    fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.poll_interval),
            Duration::from_secs(self.poll_timeout),
        )
    }

    fn key_store(&self) -> Result<KeyStore> {
        match self.key_dir {
            Some(ref dir) => Ok(KeyStore::new(dir)),
            None => Ok(KeyStore::beside_executable()?),
        }
    }
}

/// Terminal side of a command: lines go to `out` as they happen, answers come from `input`.
pub struct Console<I, O> {
    input: I,
    out: O,
}

impl<I: BufRead, O: Write> Console<I, O> {
    pub fn new(input: I, out: O) -> Self {
        Self { input, out }
    }

    /// Write one line and flush it.
    pub fn line(&mut self, text: impl Display) -> nova_manager::Result<()> {
        writeln!(self.out, "{text}")?;
        self.out.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn into_output(self) -> O {
        self.out
    }
}

impl<I: BufRead, O: Write> Reporter for Console<I, O> {
    fn progress(&mut self, event: Progress<'_>) -> nova_manager::Result<()> {
        match event {
            Progress::Keypair(EnsuredKeypair::Existing(kp)) => {
                self.line(format_args!("Using existing keypair: '{}'", kp.name))
            }
            Progress::Keypair(EnsuredKeypair::Created { keypair, dir }) => self.line(format_args!(
                "Created new keypair, '{}' and saved it to {}",
                keypair.name,
                dir.display()
            )),
            Progress::Submitted(server) => {
                self.line(format_args!("Successfully created new VM: '{}'", server.name))
            }
            Progress::Acting { action, name } => {
                let verb = match action {
                    ManageAction::Suspend => "Suspending",
                    ManageAction::Resume => "Resuming",
                    ManageAction::Reboot => "Rebooting",
                    ManageAction::Delete => "Deleting",
                    ManageAction::Status => return Ok(()),
                };
                self.line(format_args!("{verb} '{name}'..."))
            }
        }
    }

    fn confirm(&mut self, prompt: &str) -> nova_manager::Result<String> {
        self.line(prompt)?;
        let mut answer = String::new();
        self.input.read_line(&mut answer)?;
        Ok(answer)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or manage a VM
    Vm(VmCommand),
    /// List the VMs of a user
    User(list::ListArgs),
}

#[derive(Debug, Args)]
struct VmCommand {
    #[command(subcommand)]
    action: VmAction,
}

#[derive(Debug, Subcommand)]
enum VmAction {
    /// Create a new VM for a user
    Create(create::CreateArgs),
    /// Show the status of a VM
    Status(manage::ManageArgs),
    /// Suspend an active VM
    Suspend(manage::ManageArgs),
    /// Resume a suspended VM
    Resume(manage::ManageArgs),
    /// Soft-reboot a VM
    Reboot(manage::ManageArgs),
    /// Delete a VM (asks for confirmation)
    Delete(manage::ManageArgs),
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let options = ConnectOptions {
            cloud: self.global.cloud.clone(),
            config_file: self.global.config.clone(),
        };
        let session = nova_manager::connect(&options).await?;
        let keys = self.global.key_store()?;
        let mgr = VmManager::new(&session, self.global.poll_policy());

        let mut console = Console::new(std::io::stdin().lock(), std::io::stdout().lock());
        self.command.dispatch(&mgr, &keys, &mut console).await
    }
}

impl Command {
    async fn dispatch<C: ComputeApi, I: BufRead, O: Write>(
        self,
        mgr: &VmManager<'_, C>,
        keys: &KeyStore,
        console: &mut Console<I, O>,
    ) -> Result<()> {
        match self {
            Command::User(args) => list::run(mgr, args, console).await,
            Command::Vm(VmCommand { action }) => match action {
                VmAction::Create(args) => create::run(mgr, keys, args, console).await,
                VmAction::Status(args) => {
                    manage::run(mgr, args, ManageAction::Status, console).await
                }
                VmAction::Suspend(args) => {
                    manage::run(mgr, args, ManageAction::Suspend, console).await
                }
                VmAction::Resume(args) => {
                    manage::run(mgr, args, ManageAction::Resume, console).await
                }
                VmAction::Reboot(args) => {
                    manage::run(mgr, args, ManageAction::Reboot, console).await
                }
                VmAction::Delete(args) => {
                    manage::run(mgr, args, ManageAction::Delete, console).await
                }
            },
        }
    }
}
