use std::io::{BufRead, Write};

use clap::Args;
use miette::Result;
use nova_manager::ops::{DEFAULT_FLAVOR, DEFAULT_IMAGE};
use nova_manager::{ComputeApi, CreateRequest, KeyStore, VmManager};

use super::Console;

/// Printed when the new VM has no address yet.
pub const NO_ADDRESS: &str = "0.0.0.0";

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// User the VM belongs to; also names its keypair
    pub(crate) user_id: String,

    /// Flavor name
    #[arg(short = 'f', value_name = "FLAVOR", default_value = DEFAULT_FLAVOR)]
    pub(crate) flavor: String,

    /// Image name
    #[arg(short = 'i', value_name = "IMAGE", default_value = DEFAULT_IMAGE)]
    pub(crate) image: String,
}

pub async fn run<C: ComputeApi, I: BufRead, O: Write>(
    mgr: &VmManager<'_, C>,
    keys: &KeyStore,
    args: CreateArgs,
    console: &mut Console<I, O>,
) -> Result<()> {
    console.line(format_args!(
        "Creating a new VM (flavour = '{}' image = '{}') for '{}'...",
        args.flavor, args.image, args.user_id
    ))?;

    let request = CreateRequest {
        user_id: args.user_id,
        flavor: args.flavor,
        image: args.image,
    };
    let created = mgr.create(&request, keys, &mut *console).await?;

    console.line(format_args!(
        "IP address of new VM is: {}",
        created.server.first_address().unwrap_or(NO_ADDRESS)
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_manager::{MemoryCompute, PollPolicy, VmError};
    use std::time::Duration;

    fn args(user: &str) -> CreateArgs {
        CreateArgs {
            user_id: user.into(),
            flavor: "m1.small".into(),
            image: "Ubuntu 20.04".into(),
        }
    }

    #[tokio::test]
    async fn create_reports_name_keypair_and_address() {
        let dir = tempfile::tempdir().unwrap();
        let api = MemoryCompute::new()
            .with_flavor("m1.small")
            .with_image("Ubuntu 20.04")
            .settle_after(1);
        let mgr = VmManager::new(&api, PollPolicy::new(Duration::ZERO, Duration::from_secs(5)));

        let mut console = Console::new(std::io::empty(), Vec::new());
        run(&mgr, &KeyStore::new(dir.path()), args("alice"), &mut console)
            .await
            .unwrap();

        let text = String::from_utf8(console.into_output()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines[0],
            "Creating a new VM (flavour = 'm1.small' image = 'Ubuntu 20.04') for 'alice'..."
        );
        assert_eq!(
            lines[1],
            format!("Created new keypair, 'alice' and saved it to {}", dir.path().display())
        );
        assert_eq!(lines[2], "Successfully created new VM: 'alice-0'");
        assert!(lines[3].starts_with("IP address of new VM is: 10.0.0."));
        assert_eq!(lines.len(), 4);
        assert_eq!(api.server_names(), vec!["alice-0".to_string()]);
    }

    #[tokio::test]
    async fn create_that_never_settles_still_names_the_vm() {
        let dir = tempfile::tempdir().unwrap();
        let api = MemoryCompute::new()
            .with_flavor("m1.small")
            .with_image("Ubuntu 20.04")
            .with_keypair("erin", "ssh-ed25519 AAAA erin")
            .settle_after(u32::MAX);
        let mgr = VmManager::new(
            &api,
            PollPolicy::new(Duration::from_millis(1), Duration::from_millis(30)),
        );

        let mut console = Console::new(std::io::empty(), Vec::new());
        let err = run(&mgr, &KeyStore::new(dir.path()), args("erin"), &mut console)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VmError>(),
            Some(VmError::PollTimeout { .. })
        ));

        assert_eq!(
            String::from_utf8(console.into_output()).unwrap(),
            "Creating a new VM (flavour = 'm1.small' image = 'Ubuntu 20.04') for 'erin'...\n\
             Using existing keypair: 'erin'\n\
             Successfully created new VM: 'erin-0'\n"
        );
    }
}
