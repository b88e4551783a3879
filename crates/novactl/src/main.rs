use std::ffi::OsString;
use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use tracing_subscriber::EnvFilter;

mod commands;
use commands::{Cli, USAGE};

fn write_failure(out: &mut impl Write, report: &miette::Report) -> io::Result<()> {
    writeln!(out, "Error:")?;
    writeln!(
        out,
        "  Check your Internet connection, clouds.yaml configuration file and availability of the cloud service"
    )?;
    writeln!(out, "  Run 'novactl' to see usage instructions")?;
    writeln!(out, "  Exception Details: {report}")?;
    out.flush()
}

/// Parse arguments. `Ok(None)` means help, version or usage was written and there is
/// nothing left to run.
fn parse_cli<I, T>(args: I, out: &mut impl Write) -> io::Result<Option<Cli>>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let err = match Cli::try_parse_from(args) {
        Ok(cli) => return Ok(Some(cli)),
        Err(e) => e,
    };
    if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
        write!(out, "{}", err.render())?;
    } else {
        tracing::debug!(error = %err, "invalid arguments");
        write!(out, "{USAGE}")?;
    }
    out.flush()?;
    Ok(None)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing: compact format, no timestamps, no targets, on stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = match parse_cli(std::env::args_os(), &mut io::stdout().lock()) {
        Ok(Some(cli)) => cli,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "failed to write to stdout");
            return ExitCode::FAILURE;
        }
    };

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            tracing::debug!(error = ?report, "command failed");
            if let Err(e) = write_failure(&mut io::stdout().lock(), &report) {
                tracing::error!(error = %e, "failed to write failure report");
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rejects every write.
    struct Closed;

    impl Write for Closed {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failure_banner_text() {
        let report = miette::miette!("connection refused");
        let mut out = Vec::new();
        write_failure(&mut out, &report).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Error:\n\
             \x20 Check your Internet connection, clouds.yaml configuration file and availability of the cloud service\n\
             \x20 Run 'novactl' to see usage instructions\n\
             \x20 Exception Details: connection refused\n"
        );
    }

    #[test]
    fn bad_arguments_print_usage() {
        for args in [
            &["novactl"][..],
            &["novactl", "vm", "start", "alice-0"],
            &["novactl", "vm", "create", "alice", "bob"],
        ] {
            let mut out = Vec::new();
            assert!(parse_cli(args.iter().copied(), &mut out).unwrap().is_none());
            assert_eq!(String::from_utf8(out).unwrap(), USAGE);
        }
    }

    #[test]
    fn help_is_written_and_valid_arguments_parse() {
        let mut out = Vec::new();
        assert!(parse_cli(["novactl", "--help"], &mut out).unwrap().is_none());
        assert!(String::from_utf8(out).unwrap().contains("novactl"));

        let mut out = Vec::new();
        assert!(parse_cli(["novactl", "user", "bob"], &mut out).unwrap().is_some());
        assert!(out.is_empty());
    }

    #[test]
    fn unwritable_output_is_an_error() {
        assert!(parse_cli(["novactl", "--version"], &mut Closed).is_err());
        assert!(parse_cli(["novactl", "bogus"], &mut Closed).is_err());
    }
}
