//! Tracing setup.
//!
//! Two kinds of subscriber are used:
//! - a process-wide console subscriber, installed once by the embedding program
//! - a per-run subscriber that writes JSON lines into the run's `main.log` and `patient.log`
//!
//! The per-run subscriber is returned as a [`Dispatch`] and installed with
//! [`tracing::dispatcher::with_default`], so it is thread-local and dropped with the run.
//! While it is installed it replaces the console subscriber on that thread, so it carries its
//! own console layer with the same filter whenever console logging was initialised.

use crate::constants::{MAIN_LOG_TARGET, PATIENT_LOG_TARGET};
use crate::persistence::SimulationPaths;
use crate::{SimulationError, SimulationResult};
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing::Dispatch;
use tracing_subscriber::filter::{Directive, Targets};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

static CONSOLE_DIRECTIVE: OnceLock<Directive> = OnceLock::new();

/// Installs the global console subscriber.
///
/// `RUST_LOG` is honoured and `directive` (e.g. `"abm=info"`) is added on top. Calling this
/// again after a subscriber is installed does nothing.
///
/// # Errors
///
/// Returns `InvalidConfig` if `directive` is not a valid filter directive.
pub fn init_console_logging(directive: &str) -> SimulationResult<()> {
    let directive = directive
        .parse::<Directive>()
        .map_err(|e| SimulationError::InvalidConfig(format!("invalid log directive: {e}")))?;
    let result = tracing_subscriber::registry()
        .with(console_filter(&directive))
        .with(fmt::layer())
        .try_init();
    match result {
        Ok(()) => {
            let _ = CONSOLE_DIRECTIVE.set(directive);
        }
        Err(_) => tracing::debug!("console logging already initialised"),
    }
    Ok(())
}

fn console_filter(directive: &Directive) -> EnvFilter {
    EnvFilter::from_default_env().add_directive(directive.clone())
}

/// Builds the per-run subscriber writing to the run's log files.
///
/// Step messages go to `main.log`; patient state and record warnings go to `patient.log`.
/// Files are created if missing and appended to otherwise. If [`init_console_logging`] has
/// installed a console subscriber, events also reach stdout under the same filter.
///
/// # Errors
///
/// Returns `DirCreation` or `FileWrite` if the directory or log files cannot be created.
pub fn simulation_dispatch(paths: &SimulationPaths) -> SimulationResult<Dispatch> {
    let console = CONSOLE_DIRECTIVE
        .get()
        .map(|directive| (console_filter(directive), std::io::stdout));
    run_dispatch(paths, console)
}

fn run_dispatch<W>(
    paths: &SimulationPaths,
    console: Option<(EnvFilter, W)>,
) -> SimulationResult<Dispatch>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fs::create_dir_all(paths.root()).map_err(SimulationError::DirCreation)?;
    let main = open_log(&paths.main_log())?;
    let patient = open_log(&paths.patient_log())?;

    let subscriber = tracing_subscriber::registry()
        .with(console.map(|(filter, writer)| {
            fmt::layer().with_writer(writer).with_filter(filter)
        }))
        .with(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(main))
                .with_filter(Targets::new().with_target(MAIN_LOG_TARGET, LevelFilter::INFO)),
        )
        .with(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(patient))
                .with_filter(Targets::new().with_target(PATIENT_LOG_TARGET, LevelFilter::TRACE)),
        );
    Ok(Dispatch::new(subscriber))
}

fn open_log(path: &Path) -> SimulationResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(SimulationError::FileWrite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use abm_uuid::SimulationId;
    use tempfile::TempDir;

    #[test]
    fn run_dispatch_splits_targets_into_files() {
        let temp = TempDir::new().expect("temp dir");
        let id = SimulationId::parse("logging_test").expect("simulation id");
        let paths = SimulationPaths::new(temp.path(), &id);

        let dispatch = simulation_dispatch(&paths).expect("dispatch");
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!(target: MAIN_LOG_TARGET, "step message");
            tracing::warn!(target: PATIENT_LOG_TARGET, "record warning");
            tracing::info!(target: "abm::other", "ignored");
        });
        drop(dispatch);

        let main = fs::read_to_string(paths.main_log()).expect("main log");
        let patient = fs::read_to_string(paths.patient_log()).expect("patient log");
        assert!(main.contains("step message"));
        assert!(!main.contains("record warning"));
        assert!(patient.contains("record warning"));
        assert!(patient.contains("\"level\":\"WARN\""));
        assert!(!main.contains("ignored") && !patient.contains("ignored"));
    }

    #[test]
    fn run_dispatch_keeps_console_output() {
        let temp = TempDir::new().expect("temp dir");
        let id = SimulationId::parse("console_test").expect("simulation id");
        let paths = SimulationPaths::new(temp.path(), &id);
        let console_path = temp.path().join("console.log");
        let console = File::create(&console_path).expect("console file");

        let dispatch = run_dispatch(
            &paths,
            Some((EnvFilter::new("abm=info"), Mutex::new(console))),
        )
        .expect("dispatch");
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!(target: MAIN_LOG_TARGET, "step message");
            tracing::debug!(target: PATIENT_LOG_TARGET, "patient detail");
        });
        drop(dispatch);

        let console = fs::read_to_string(&console_path).expect("console output");
        assert!(console.contains("step message"));
        assert!(!console.contains("patient detail"));
        let patient = fs::read_to_string(paths.patient_log()).expect("patient log");
        assert!(patient.contains("patient detail"));
    }

    #[test]
    fn console_logging_can_be_initialised_twice() {
        init_console_logging("abm=info").expect("first init");
        init_console_logging("abm=debug").expect("second init is a no-op");
    }
}
