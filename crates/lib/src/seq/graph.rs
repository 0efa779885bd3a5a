//! Requisite dependency graph over chunks, used for cycle diagnostics when a
//! run stalls.

use std::collections::HashMap;

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;

use crate::chunk::{Chunk, ChunkTag};

/// Find one requisite cycle among the given chunks, if any. Edges point from
/// a chunk to the chunks its requisites target.
pub fn requisite_cycle(chunks: &[&Chunk]) -> Option<Vec<ChunkTag>> {
  let mut graph = DiGraph::<ChunkTag, ()>::new();
  let mut nodes = HashMap::new();

  for chunk in chunks {
    let tag = chunk.tag();
    nodes.entry(tag.clone()).or_insert_with(|| graph.add_node(tag));
  }

  for chunk in chunks {
    let from = nodes[&chunk.tag()];
    for req in &chunk.requisites {
      let Some(target_id) = &req.decl_id else {
        continue;
      };
      for other in chunks {
        if &other.decl_id == target_id
          && req.resource.as_ref().is_none_or(|r| r == &other.resource)
        {
          graph.add_edge(from, nodes[&other.tag()], ());
        }
      }
    }
  }

  for scc in tarjan_scc(&graph) {
    if scc.len() > 1 {
      return Some(scc.into_iter().map(|ix| graph[ix].clone()).collect());
    }
    if graph.contains_edge(scc[0], scc[0]) {
      return Some(vec![graph[scc[0]].clone()]);
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chunk::Requisite;

  fn chunk_requiring(decl_id: &str, target: &str) -> Chunk {
    let mut chunk = Chunk::new("test", "present", decl_id, "init");
    chunk.requisites.push(Requisite {
      keyword: "require".to_string(),
      resource: None,
      decl_id: Some(target.to_string()),
      args: None,
    });
    chunk
  }

  #[test]
  fn detects_two_node_cycle() {
    let a = chunk_requiring("a", "b");
    let b = chunk_requiring("b", "a");
    let cycle = requisite_cycle(&[&a, &b]).unwrap();
    assert_eq!(cycle.len(), 2);
  }

  #[test]
  fn detects_self_cycle() {
    let a = chunk_requiring("a", "a");
    let cycle = requisite_cycle(&[&a]).unwrap();
    assert_eq!(cycle.len(), 1);
  }

  #[test]
  fn linear_chain_has_no_cycle() {
    let a = chunk_requiring("a", "b");
    let b = chunk_requiring("b", "c");
    let c = Chunk::new("test", "present", "c", "init");
    assert!(requisite_cycle(&[&a, &b, &c]).is_none());
  }
}
