//! Classifying delete-invocation output.
//!
//! The delete whitelist:
//!
//! - `ANS1278W`, `ANS1898I`: progress noise, ignored;
//! - `ANS1302E`: no objects matched the query, meaning the whole batch was
//!   already deleted, which is success;
//! - `ANS1345E ... '<path>'`: one object already deleted; the quoted
//!   basename counts as success;
//! - anything else: the invocation failed.
//!
//! A failed invocation with `ANS1345E` partials still credits those
//! identifiers; the rest are re-enqueued. An `ANS1345E` line without a
//! quoted path cannot be attributed and downgrades to plain failure, so the
//! whole set is reprocessed rather than guessed at.

use std::collections::BTreeSet;
use std::path::Path;

use endit_tsm::output::{quoted_path, scan_codes};

/// Result of mining one delete invocation's output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// An unclassified error code (or a silent non-zero exit) appeared.
    failed: bool,
    /// `ANS1302E`: nothing matched, everything was already gone.
    batch_gone: bool,
    /// Identifiers individually reported as already deleted.
    already_deleted: BTreeSet<String>,
}

impl DeleteOutcome {
    /// Classifies `output` together with the advisory exit status.
    ///
    /// A non-zero exit with no diagnostic codes at all (e.g. a killed
    /// client) is a failure; nothing can be credited.
    #[must_use]
    pub fn classify(output: &str, exit_ok: bool) -> Self {
        let mut outcome = Self::default();
        let mut saw_codes = false;

        for (code, line) in scan_codes(output) {
            saw_codes = true;
            match code {
                "ANS1278W" | "ANS1898I" => {}
                "ANS1302E" => outcome.batch_gone = true,
                "ANS1345E" => match quoted_path(line) {
                    Some(path) => {
                        if let Some(name) = Path::new(path).file_name().and_then(|n| n.to_str()) {
                            outcome.already_deleted.insert(name.to_owned());
                        } else {
                            outcome.failed = true;
                        }
                    }
                    None => outcome.failed = true,
                },
                _ => outcome.failed = true,
            }
        }

        if !exit_ok && !saw_codes {
            outcome.failed = true;
        }
        outcome
    }

    /// Splits the attempted identifiers into `(deleted, survivors)`.
    ///
    /// Survivors must be re-enqueued; an empty survivor set means the whole
    /// batch is done.
    #[must_use]
    pub fn partition(&self, attempted: &BTreeSet<String>) -> (BTreeSet<String>, BTreeSet<String>) {
        if !self.failed || self.batch_gone {
            return (attempted.clone(), BTreeSet::new());
        }
        let deleted: BTreeSet<String> = attempted
            .intersection(&self.already_deleted)
            .cloned()
            .collect();
        let survivors: BTreeSet<String> = attempted.difference(&deleted).cloned().collect();
        (deleted, survivors)
    }

    /// Whether any identifiers survive and need another attempt.
    #[must_use]
    pub fn needs_retry(&self, attempted: &BTreeSet<String>) -> bool {
        !self.partition(attempted).1.is_empty()
    }
}
