use std::io::{BufRead, Write};

use clap::Args;
use miette::Result;
use nova_manager::{ComputeApi, ManageAction, ManageOutcome, VmManager};

use super::Console;

#[derive(Debug, Args)]
pub struct ManageArgs {
    /// VM name, e.g. alice-0
    pub(crate) vm_name: String,
}

pub async fn run<C: ComputeApi, I: BufRead, O: Write>(
    mgr: &VmManager<'_, C>,
    args: ManageArgs,
    action: ManageAction,
    console: &mut Console<I, O>,
) -> Result<()> {
    let name = args.vm_name.as_str();
    let outcome = mgr.manage(name, action, &mut *console).await?;

    let message = match outcome {
        ManageOutcome::NotFound => format!("'{name}' could not be found"),
        ManageOutcome::Status(status) => format!("'{name}' status is: {status}"),
        ManageOutcome::Suspended(_) => format!("Suspended '{name}'"),
        ManageOutcome::AlreadySuspended(_) => format!("'{name}' already suspended or inactive"),
        ManageOutcome::Resumed(_) => format!("Resumed '{name}'"),
        ManageOutcome::AlreadyActive(_) => format!("'{name}' already active"),
        ManageOutcome::Rebooted(_) => format!("Rebooted '{name}'"),
        ManageOutcome::Deleted => format!("Deleted '{name}'"),
        ManageOutcome::DeleteAborted => "Aborted delete".to_string(),
    };
    console.line(message)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    use nova_manager::{MemoryCompute, PollPolicy, ServerStatus};

    async fn manage(api: &MemoryCompute, name: &str, action: ManageAction, answer: &str) -> String {
        let mgr = VmManager::new(api, PollPolicy::new(Duration::ZERO, Duration::from_secs(5)));
        let mut console = Console::new(Cursor::new(answer.as_bytes().to_vec()), Vec::new());
        run(
            &mgr,
            ManageArgs {
                vm_name: name.into(),
            },
            action,
            &mut console,
        )
        .await
        .unwrap();
        String::from_utf8(console.into_output()).unwrap()
    }

    #[tokio::test]
    async fn delete_aborts_unless_yes() {
        let api = MemoryCompute::new().with_server("alice-0", ServerStatus::Active, None);
        let text = manage(&api, "alice-0", ManageAction::Delete, "n\n").await;
        assert_eq!(
            text,
            "This action cannot be reversed. Are you sure you want to delete 'alice-0' (y/n)?\n\
             Aborted delete\n"
        );
        assert!(api.calls().delete_server.is_empty());
    }

    #[tokio::test]
    async fn delete_confirmed() {
        let api = MemoryCompute::new()
            .with_server("alice-0", ServerStatus::Active, None)
            .settle_after(1);
        let text = manage(&api, "alice-0", ManageAction::Delete, "y\n").await;
        assert_eq!(
            text,
            "This action cannot be reversed. Are you sure you want to delete 'alice-0' (y/n)?\n\
             Deleting 'alice-0'...\n\
             Deleted 'alice-0'\n"
        );
        assert_eq!(api.calls().delete_server.len(), 1);
        assert!(api.server_names().is_empty());
    }

    #[tokio::test]
    async fn delete_with_closed_stdin_aborts() {
        let api = MemoryCompute::new().with_server("alice-0", ServerStatus::Active, None);
        let text = manage(&api, "alice-0", ManageAction::Delete, "").await;
        assert!(text.ends_with("Aborted delete\n"));
    }

    #[tokio::test]
    async fn status_and_precondition_messages() {
        let api = MemoryCompute::new()
            .with_server("bob-0", ServerStatus::Active, None)
            .with_server("bob-2", ServerStatus::Suspended, None);

        assert_eq!(
            manage(&api, "bob-2", ManageAction::Status, "").await,
            "'bob-2' status is: SUSPENDED\n"
        );
        assert_eq!(
            manage(&api, "bob-2", ManageAction::Suspend, "").await,
            "'bob-2' already suspended or inactive\n"
        );
        assert_eq!(
            manage(&api, "bob-0", ManageAction::Resume, "").await,
            "'bob-0' already active\n"
        );
        assert_eq!(
            manage(&api, "bob-9", ManageAction::Reboot, "").await,
            "'bob-9' could not be found\n"
        );
        assert!(api.calls().actions.is_empty());
    }

    #[tokio::test]
    async fn transitions_report_completion() {
        let api = MemoryCompute::new()
            .with_server("carol-0", ServerStatus::Active, None)
            .settle_after(1);
        assert_eq!(
            manage(&api, "carol-0", ManageAction::Suspend, "").await,
            "Suspending 'carol-0'...\nSuspended 'carol-0'\n"
        );
        assert_eq!(
            manage(&api, "carol-0", ManageAction::Resume, "").await,
            "Resuming 'carol-0'...\nResumed 'carol-0'\n"
        );
        assert_eq!(
            manage(&api, "carol-0", ManageAction::Reboot, "").await,
            "Rebooting 'carol-0'...\nRebooted 'carol-0'\n"
        );
    }
}
