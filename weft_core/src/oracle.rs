use crate::executor::TerminationReason;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Default severity level for crashes detected by `CrashOracle`.
const DEFAULT_CRASH_SEVERITY: u8 = 10;

/// What the campaign knows about one finished execution.
#[derive(Debug, Clone, Copy)]
pub struct Outcome<'a> {
    pub template: &'a str,
    /// `Mutator::describe()` at the time of the run.
    pub mutator_state: &'a str,
    /// Bytes the mutated template produced for this run.
    pub input: &'a [u8],
    pub exit_code: i32,
    pub reason: TerminationReason,
}

/// A finding, as persisted in the findings directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BugReport {
    pub template: String,
    pub mutator_state: String,
    pub reason: TerminationReason,
    pub exit_code: i32,
    /// Stored next to the report as `<input_hash>.bin`.
    #[serde(skip)]
    pub input: Vec<u8>,
    pub input_len: usize,
    pub description: String,
    /// MD5 of `input`, used for deduplication.
    pub input_hash: String,
    pub severity: u8,
}

/// Decides whether an execution outcome is worth reporting.
pub trait Oracle {
    fn examine(&self, outcome: &Outcome<'_>) -> Option<BugReport>;
}

/// Reports every abnormal termination.
#[derive(Debug, Default)]
pub struct CrashOracle;

impl CrashOracle {
    pub fn new() -> Self {
        CrashOracle
    }
}

impl Oracle for CrashOracle {
    fn examine(&self, outcome: &Outcome<'_>) -> Option<BugReport> {
        if !outcome.reason.is_abnormal() {
            return None;
        }
        let input_digest = md5::compute(outcome.input);
        Some(BugReport {
            template: outcome.template.to_string(),
            mutator_state: outcome.mutator_state.to_string(),
            reason: outcome.reason,
            exit_code: outcome.exit_code,
            input: outcome.input.to_vec(),
            input_len: outcome.input.len(),
            description: format!(
                "{} (exit code {})",
                outcome.reason.describe(),
                outcome.exit_code
            ),
            input_hash: format!("{:x}", input_digest),
            severity: DEFAULT_CRASH_SEVERITY,
        })
    }
}

#[derive(Error, Debug)]
pub enum FindingError {
    #[error("failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Writes reports as `<md5>.json` plus the raw payload as `<md5>.bin`,
/// once per distinct payload.
#[derive(Debug)]
pub struct FindingStore {
    dir: PathBuf,
    seen: HashSet<String>,
}

impl FindingStore {
    /// Creates `dir` if needed and remembers the findings already in it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, FindingError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| FindingError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut seen = HashSet::new();
        match fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "json") {
                        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                            seen.insert(stem.to_string());
                        }
                    }
                }
            }
            Err(e) => warn!("Could not list findings in {:?}: {e}", dir),
        }
        debug!(dir = ?dir, known = seen.len(), "findings store opened");
        Ok(Self { dir, seen })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Persists `report`.
    ///
    /// # Returns
    /// `false` if a report with the same payload hash was already stored.
    pub fn record(&mut self, report: &BugReport) -> Result<bool, FindingError> {
        if self.seen.contains(&report.input_hash) {
            return Ok(false);
        }

        let json = serde_json::to_string_pretty(report)?;
        let json_path = self.dir.join(format!("{}.json", report.input_hash));
        fs::write(&json_path, json).map_err(|source| FindingError::Io {
            path: json_path.clone(),
            source,
        })?;

        let bin_path = self.dir.join(format!("{}.bin", report.input_hash));
        fs::write(&bin_path, &report.input).map_err(|source| FindingError::Io {
            path: bin_path.clone(),
            source,
        })?;

        self.seen.insert(report.input_hash.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome<'a>(input: &'a [u8], reason: TerminationReason) -> Outcome<'a> {
        Outcome {
            template: "hello",
            mutator_state: "u8: current=255",
            input,
            exit_code: 139,
            reason,
        }
    }

    #[test]
    fn crash_oracle_detects_crash_and_creates_valid_report() {
        let oracle = CrashOracle::new();
        let input_data: Vec<u8> = vec![0xFF, 0xFE, 0xFD];
        let report = oracle
            .examine(&outcome(&input_data, TerminationReason::SegmentationFault))
            .expect("Oracle should detect a crash and return Some(BugReport)");

        assert_eq!(report.input, input_data, "Report input should match the original input");
        assert_eq!(report.template, "hello");
        assert_eq!(report.mutator_state, "u8: current=255");
        assert_eq!(
            report.input_hash,
            format!("{:x}", md5::compute(&input_data)),
            "Report hash should be the MD5 of the input"
        );
        assert_eq!(report.severity, DEFAULT_CRASH_SEVERITY);
        assert!(report.description.contains("access violation"), "{}", report.description);
    }

    #[test]
    fn crash_oracle_ignores_normal_termination() {
        let oracle = CrashOracle::new();
        assert!(
            oracle
                .examine(&outcome(b"ok", TerminationReason::Normal))
                .is_none(),
            "Oracle should not report on a normal exit"
        );
    }

    #[test]
    fn crash_oracle_reports_every_abnormal_reason() {
        let oracle = CrashOracle::new();
        for reason in [
            TerminationReason::SegmentationFault,
            TerminationReason::BoundsError,
            TerminationReason::UnalignedAccess,
            TerminationReason::StackOverflow,
            TerminationReason::Other,
        ] {
            assert!(
                oracle.examine(&outcome(b"x", reason)).is_some(),
                "{reason:?} should be reported"
            );
        }
    }

    #[test]
    fn store_writes_json_and_payload_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FindingStore::open(dir.path().join("findings")).unwrap();
        let report = CrashOracle::new()
            .examine(&outcome(b"\x00\x01crash", TerminationReason::SegmentationFault))
            .unwrap();

        assert!(store.record(&report).unwrap(), "first report is new");
        assert!(!store.record(&report).unwrap(), "same payload is deduplicated");
        assert_eq!(store.len(), 1);

        let bin = store.dir().join(format!("{}.bin", report.input_hash));
        assert_eq!(fs::read(bin).unwrap(), b"\x00\x01crash".to_vec());

        let json = store.dir().join(format!("{}.json", report.input_hash));
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(json).unwrap()).unwrap();
        assert_eq!(value["template"], "hello");
        assert_eq!(value["reason"], "SegmentationFault");
        assert_eq!(value["exit_code"], 139);
        assert!(value.get("input").is_none(), "payload is not inlined");
    }

    #[test]
    fn reopened_store_remembers_findings() {
        let dir = tempfile::tempdir().unwrap();
        let report = CrashOracle::new()
            .examine(&outcome(b"again", TerminationReason::Other))
            .unwrap();
        {
            let mut store = FindingStore::open(dir.path()).unwrap();
            assert!(store.record(&report).unwrap());
        }
        let mut store = FindingStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(!store.record(&report).unwrap());
    }
}
