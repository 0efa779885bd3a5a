//! Wave sequencing: deciding which chunks are ready to execute.
//!
//! A seq is a full view of the pending work: every chunk that has neither
//! executed nor been halted, annotated with its unmet requisites. Entries
//! with no unmet requisites form the next execution wave. Unmet reasons are
//! typed: a chunk waiting on a pending target may still run later, while a
//! permanent reason (failed target, missing declaration, unknown keyword)
//! never clears. When no entry is ready, the split between the two tells
//! "dependents of a failure, skip and finish" apart from a genuinely stuck
//! run.

pub mod graph;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

use crate::chunk::{Chunk, ChunkTag, Requisite};
use crate::run::RunningMap;

/// One unmet-requisite annotation.
#[derive(Debug, Clone, PartialEq)]
pub enum Unmet {
  /// The target has not executed yet; may clear in a later wave.
  Waiting { target: ChunkTag, reason: String },

  /// Never clears: failed target, missing declaration, unknown keyword.
  Permanent { reason: String },
}

impl Unmet {
  pub fn reason(&self) -> &str {
    match self {
      Unmet::Waiting { reason, .. } | Unmet::Permanent { reason } => reason,
    }
  }
}

impl fmt::Display for Unmet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.reason())
  }
}

/// One pending chunk with its unmet-requisite annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct SeqEntry {
  pub chunk: Chunk,
  pub tag: ChunkTag,
  pub unmet: Vec<Unmet>,
}

impl SeqEntry {
  pub fn ready(&self) -> bool {
    self.unmet.is_empty()
  }

  fn reasons(&self) -> String {
    self.unmet.iter().map(Unmet::reason).collect::<Vec<_>>().join(", ")
  }
}

/// Pending view keyed by position in the low list.
pub type Seq = BTreeMap<usize, SeqEntry>;

#[derive(Debug, Error)]
pub enum SeqError {
  #[error("circular requisites: {}", tags.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> "))]
  Circular { tags: Vec<ChunkTag> },

  #[error("unsatisfiable requisites: {}", tags.join("; "))]
  Malformed { tags: Vec<String> },

  #[error("no progress between waves, synthesized chunks keep re-pending: {}", tags.join("; "))]
  NoProgress { tags: Vec<String> },
}

/// Compute the pending view over the current low list.
///
/// `has_handler` reports whether a requisite keyword has a registered plugin;
/// a keyword without one is permanently unmet rather than silently ignored.
pub fn compute(low: &[Chunk], running: &RunningMap, has_handler: impl Fn(&str) -> bool) -> Seq {
  let mut seq = Seq::new();

  for (index, chunk) in low.iter().enumerate() {
    if chunk.halt_current_execution || running.contains_key(&chunk.tag()) {
      continue;
    }

    let mut unmet = Vec::new();
    for req in &chunk.requisites {
      if !has_handler(&req.keyword) {
        unmet.push(Unmet::Permanent {
          reason: format!("{req}: no handler registered for keyword '{}'", req.keyword),
        });
        continue;
      }
      if req.decl_id.is_none() {
        // Self-directed; enforced at execution time, never blocks readiness.
        continue;
      }
      if let Some(reason) = target_unmet(low, running, req) {
        unmet.push(reason);
      }
    }

    seq.insert(
      index,
      SeqEntry {
        tag: chunk.tag(),
        chunk: chunk.clone(),
        unmet,
      },
    );
  }

  seq
}

/// Why a cross-declaration requisite is unmet, or `None` when satisfied. A
/// failed target never satisfies a requisite, so dependents of a failed chunk
/// stay pending and are reported as skipped.
fn target_unmet(low: &[Chunk], running: &RunningMap, req: &Requisite) -> Option<Unmet> {
  let target_id = req.decl_id.as_deref()?;

  let mut tags = BTreeSet::new();
  for chunk in low {
    if chunk.decl_id == target_id && req.resource.as_ref().is_none_or(|r| r == &chunk.resource) {
      tags.insert(chunk.tag());
    }
  }

  if tags.is_empty() {
    return Some(Unmet::Permanent {
      reason: format!("{req}: no matching declaration"),
    });
  }

  for tag in tags {
    match running.get(&tag) {
      Some(result) if result.result => {}
      Some(_) => {
        return Some(Unmet::Permanent {
          reason: format!("{req}: target failed"),
        });
      }
      None => {
        return Some(Unmet::Waiting {
          target: tag,
          reason: format!("{req}: pending"),
        });
      }
    }
  }
  None
}

/// What a pending view with no ready entries means.
#[derive(Debug)]
pub enum Blocked {
  /// Every entry is (transitively) behind a permanent reason; the run is
  /// done, the entries report as skipped.
  AllDoomed,

  /// Some entries wait only on each other; the run is stuck.
  Stuck(SeqError),
}

/// Classify a pending view in which nothing is ready. Entries with a
/// permanent reason are doomed; waiting on a doomed entry dooms the waiter.
/// Whatever is left waits on live entries that will never run, which is a
/// requisite cycle if the graph has one and malformed targeting otherwise.
pub fn analyze_blocked(seq: &Seq) -> Blocked {
  let mut doomed: BTreeSet<ChunkTag> = seq
    .values()
    .filter(|e| e.unmet.iter().any(|u| matches!(u, Unmet::Permanent { .. })))
    .map(|e| e.tag.clone())
    .collect();

  loop {
    let before = doomed.len();
    for entry in seq.values() {
      if doomed.contains(&entry.tag) {
        continue;
      }
      let blocked_by_doomed = entry
        .unmet
        .iter()
        .any(|u| matches!(u, Unmet::Waiting { target, .. } if doomed.contains(target)));
      if blocked_by_doomed {
        doomed.insert(entry.tag.clone());
      }
    }
    if doomed.len() == before {
      break;
    }
  }

  let stuck: Vec<&SeqEntry> = seq.values().filter(|e| !doomed.contains(&e.tag)).collect();
  if stuck.is_empty() {
    return Blocked::AllDoomed;
  }

  let chunks: Vec<&Chunk> = stuck.iter().map(|e| &e.chunk).collect();
  if let Some(tags) = graph::requisite_cycle(&chunks) {
    return Blocked::Stuck(SeqError::Circular { tags });
  }
  Blocked::Stuck(SeqError::Malformed {
    tags: stuck
      .iter()
      .map(|e| format!("{} (unmet: {})", e.tag, e.reasons()))
      .collect(),
  })
}

/// Detect synthesis churn: the wave in between executed chunks, yet the same
/// tag set is pending again because requisite rules keep synthesizing
/// replacements without converging.
pub fn detect_stall(prev: Option<&Seq>, cur: &Seq) -> Option<SeqError> {
  if cur.is_empty() || !cur.values().any(SeqEntry::ready) {
    return None;
  }
  let prev = prev?;

  let prev_tags: BTreeSet<&ChunkTag> = prev.values().map(|e| &e.tag).collect();
  let cur_tags: BTreeSet<&ChunkTag> = cur.values().map(|e| &e.tag).collect();
  if prev_tags != cur_tags {
    return None;
  }

  Some(SeqError::NoProgress {
    tags: cur_tags.into_iter().map(ToString::to_string).collect(),
  })
}
