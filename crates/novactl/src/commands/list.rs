use std::io::{BufRead, Write};

use clap::Args;
use miette::Result;
use nova_manager::{ComputeApi, VmManager};

use super::Console;
use super::create::NO_ADDRESS;

#[derive(Debug, Args)]
pub struct ListArgs {
    /// User whose VMs to list
    pub(crate) user_id: String,
}

pub async fn run<C: ComputeApi, I: BufRead, O: Write>(
    mgr: &VmManager<'_, C>,
    args: ListArgs,
    console: &mut Console<I, O>,
) -> Result<()> {
    console.line(format_args!("Listing VMs for '{}':", args.user_id))?;

    for server in mgr.user_servers(&args.user_id).await? {
        console.line(format_args!(
            "Name: '{}'\tIP: {}",
            server.name,
            server.first_address().unwrap_or(NO_ADDRESS)
        ))?;
    }

    Ok(())
}
