//! Run reporting: the per-chunk outcomes and collection errors a finished
//! (or aborted) run hands back to its caller.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::run::RunContext;

/// Outcome of one chunk, as reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
  /// Applied and changed the resource.
  Changed,

  /// Applied; the resource was already in the declared state.
  NoChange,

  /// Test mode: changes would be made.
  WouldChange,

  /// The operation reported failure.
  Failed,

  /// Never executed: its requisites stayed unmet (typically a failed or
  /// missing dependency) or the run stopped early.
  Skipped,
}

impl fmt::Display for Outcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Outcome::Changed => "changed",
      Outcome::NoChange => "no change",
      Outcome::WouldChange => "would change",
      Outcome::Failed => "failed",
      Outcome::Skipped => "skipped",
    };
    f.write_str(s)
  }
}

/// Report line for one chunk.
#[derive(Debug, Clone, Serialize)]
pub struct TagReport {
  pub tag: String,
  pub sls: String,
  pub outcome: Outcome,
  pub comment: String,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub changes: Option<Value>,
}

/// Everything a run produced, in execution-list order.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
  pub run_name: String,
  pub test: bool,
  pub cancelled: bool,
  pub entries: Vec<TagReport>,
  pub errors: Vec<String>,
}

impl RunReport {
  pub fn from_run(run: &RunContext, test: bool, cancelled: bool) -> Self {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    for chunk in &run.low {
      if chunk.halt_current_execution {
        continue;
      }
      let tag = chunk.tag();
      if !seen.insert(tag.clone()) {
        continue;
      }

      let entry = match run.running.get(&tag) {
        Some(result) if !result.result => TagReport {
          tag: tag.to_string(),
          sls: chunk.sls.clone(),
          outcome: Outcome::Failed,
          comment: result.comment.clone(),
          changes: result.changes.clone(),
        },
        Some(result) => {
          let outcome = if !result.has_changes() {
            Outcome::NoChange
          } else if test {
            Outcome::WouldChange
          } else {
            Outcome::Changed
          };
          TagReport {
            tag: tag.to_string(),
            sls: chunk.sls.clone(),
            outcome,
            comment: result.comment.clone(),
            changes: result.changes.clone(),
          }
        }
        None => TagReport {
          tag: tag.to_string(),
          sls: chunk.sls.clone(),
          outcome: Outcome::Skipped,
          comment: "not executed".to_string(),
          changes: None,
        },
      };
      entries.push(entry);
    }

    Self {
      run_name: run.run_name.clone(),
      test,
      cancelled,
      entries,
      errors: run.errors.clone(),
    }
  }

  /// True when every chunk applied cleanly and nothing was skipped.
  pub fn succeeded(&self) -> bool {
    !self.cancelled
      && self.errors.is_empty()
      && self
        .entries
        .iter()
        .all(|e| matches!(e.outcome, Outcome::Changed | Outcome::NoChange | Outcome::WouldChange))
  }

  pub fn counts(&self) -> (usize, usize, usize) {
    let mut changed = 0;
    let mut unchanged = 0;
    let mut failed = 0;
    for entry in &self.entries {
      match entry.outcome {
        Outcome::Changed | Outcome::WouldChange => changed += 1,
        Outcome::NoChange => unchanged += 1,
        Outcome::Failed | Outcome::Skipped => failed += 1,
      }
    }
    (changed, unchanged, failed)
  }
}
