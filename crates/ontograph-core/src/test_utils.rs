//! Test utilities for Ontograph

use std::sync::Arc;

use tempfile::TempDir;

use crate::config::DagConfig;
use crate::dag::{Dag, EdgeFlags};
use crate::model::DagEdge;

/// A store rooted in a fresh temporary directory. Keep the `TempDir` alive
/// for as long as the store is used.
pub fn temp_store() -> (TempDir, DagConfig) {
    let dir = TempDir::new().unwrap();
    let config = DagConfig::with_root(dir.path());
    (dir, config)
}

/// Assert an edge from its text form, creating nodes as needed.
pub fn assert_fact(dag: &Dag, text: &str) -> Arc<DagEdge> {
    dag.find_or_create_edge_text(text, None, EdgeFlags::CREATE)
        .unwrap()
        .into_edge()
        .unwrap_or_else(|| panic!("{text} was not asserted"))
}

/// A small taxonomy with one alias fact and one literal-valued edge.
pub fn populate_taxonomy(dag: &Dag) {
    for fact in [
        "(isa Cow Mammal)",
        "(isa Mammal Animal)",
        "(isa Dog Mammal)",
        "(genls Mammal Vertebrate)",
        r#"(prettyString Cow "dairy cow")"#,
        "(numberOfLegs Cow '4)",
    ] {
        assert_fact(dag, fact);
    }
}
