use crate::config::FileFuzzSettings;
use crate::executor::{ApplicationExecuter, ExecutorError};
use crate::io::{Buffer, ByteOrder};
use crate::mutator::{Evaluator, FileMutator, Mutator, MutatorError};
use crate::oracle::{BugReport, CrashOracle, FindingStore, Oracle, Outcome};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum FileFuzzError {
    #[error(transparent)]
    Mutator(#[from] MutatorError),
    #[error("failed to write payload file: {0}")]
    Payload(std::io::Error),
    #[error("failed to list {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

#[derive(Debug, Default)]
pub struct FileFuzzReport {
    pub files: u64,
    pub executions: u64,
    /// Runs the target did not finish within the timeout.
    pub timeouts: u64,
    pub findings: Vec<BugReport>,
}

impl FileFuzzReport {
    fn absorb(&mut self, other: FileFuzzReport) {
        self.files += other.files;
        self.executions += other.executions;
        self.timeouts += other.timeouts;
        self.findings.extend(other.findings);
    }
}

/// Feeds every `FileMutator` state of an input file to the target as a
/// temporary file named on its command line.
pub struct FileFuzzer {
    app: Box<dyn ApplicationExecuter>,
    settings: FileFuzzSettings,
    oracle: Box<dyn Oracle>,
    store: Option<FindingStore>,
}

impl FileFuzzer {
    pub fn new(app: Box<dyn ApplicationExecuter>, settings: FileFuzzSettings) -> Self {
        Self {
            app,
            settings,
            oracle: Box::new(CrashOracle::new()),
            store: None,
        }
    }

    pub fn with_store(mut self, store: FindingStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_oracle(mut self, oracle: Box<dyn Oracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Fuzzes `path`, or every regular file directly inside it when it is a
    /// directory. Empty files in a directory are skipped.
    pub fn run_path(&mut self, path: &Path) -> Result<FileFuzzReport, FileFuzzError> {
        if !path.is_dir() {
            return self.run(path);
        }

        let entries = std::fs::read_dir(path).map_err(|source| FileFuzzError::ReadDir {
            path: path.to_path_buf(),
            source,
        })?;
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        let mut report = FileFuzzReport::default();
        for file in files {
            match self.run(&file) {
                Ok(file_report) => report.absorb(file_report),
                Err(FileFuzzError::Mutator(e)) => warn!("Skipping {:?}: {e}", file),
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    pub fn run(&mut self, path: &Path) -> Result<FileFuzzReport, FileFuzzError> {
        let mut mutator = FileMutator::from_file(path)?;
        self.run_mutator(&mut mutator)
    }

    /// Executes the target once per mutator state, starting from the state
    /// before the first `mutate()`.
    pub fn run_mutator(
        &mut self,
        mutator: &mut FileMutator,
    ) -> Result<FileFuzzReport, FileFuzzError> {
        let suffix = Path::new(mutator.name())
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let mut report = FileFuzzReport {
            files: 1,
            ..FileFuzzReport::default()
        };
        info!(file = mutator.name(), "Fuzzing file");

        mutator.reset();
        loop {
            let state = mutator.describe();
            let mut buffer = Buffer::new(ByteOrder::BigEndian);
            mutator.evaluate(&mut buffer);
            debug!(%state, len = buffer.len(), "running mutation");
            self.execute_once(
                mutator.name(),
                &state,
                buffer.as_slice(),
                &suffix,
                &mut report,
            )?;

            if !mutator.mutate() || mutator.finished() {
                break;
            }
        }

        info!(
            file = mutator.name(),
            executions = report.executions,
            timeouts = report.timeouts,
            findings = report.findings.len(),
            "File done"
        );
        Ok(report)
    }

    fn execute_once(
        &mut self,
        name: &str,
        state: &str,
        payload: &[u8],
        suffix: &str,
        report: &mut FileFuzzReport,
    ) -> Result<(), FileFuzzError> {
        let mut file = tempfile::Builder::new()
            .prefix("weft-")
            .suffix(suffix)
            .tempfile()
            .map_err(FileFuzzError::Payload)?;
        file.write_all(payload)
            .and_then(|_| file.flush())
            .map_err(FileFuzzError::Payload)?;

        let arguments = self
            .settings
            .argument_template
            .replace("{}", &file.path().display().to_string());
        self.app.set_command_line(&arguments);
        self.app.launch()?;
        report.executions += 1;

        let timeout = self.settings.timeout();
        if !self.app.wait(Some(timeout))? {
            debug!(%state, ?timeout, "target timed out, terminating");
            report.timeouts += 1;
            self.app.terminate()?;
            if !self.app.wait(Some(timeout))? {
                warn!(%state, "Target did not exit after being killed");
            }
            return Ok(());
        }

        let Some((exit_code, reason)) = self.app.status_code() else {
            warn!(%state, "Target has no exit status");
            return Ok(());
        };
        let outcome = Outcome {
            template: name,
            mutator_state: state,
            input: payload,
            exit_code,
            reason,
        };
        if let Some(bug_report) = self.oracle.examine(&outcome) {
            error!(
                file = name,
                %state,
                exit_code,
                "Target crashed: {}",
                bug_report.description
            );
            if let Some(store) = self.store.as_mut() {
                if let Err(e) = store.record(&bug_report) {
                    warn!("Failed to save finding: {e}");
                }
            }
            report.findings.push(bug_report);
        }
        Ok(())
    }
}
