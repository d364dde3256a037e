//! CLI command implementations

use anyhow::Context;
use ontograph_core::{Constraint, Dag, DagConfig, DagNode, EdgeFlags, NodeFlags};
use std::sync::Arc;

pub fn stats(config: DagConfig) -> anyhow::Result<()> {
    let dag = Dag::open(config)?;
    let details = dag.details();

    println!("nodes:           {}", details.num_nodes);
    println!("edges:           {}", details.num_edges);
    println!("ephemeral edges: {}", dag.ephemeral_edge_count());
    println!("next node id:    {}", details.node_id_count);
    println!("next edge id:    {}", details.edge_id_count);
    println!("modules:         {}", dag.module_names().join(", "));
    Ok(())
}

pub fn assert(config: DagConfig, text: &str, ephemeral: bool) -> anyhow::Result<()> {
    let dag = Dag::open(config)?;
    let flags = EdgeFlags {
        ephemeral,
        ..EdgeFlags::CREATE
    };
    let outcome = dag.find_or_create_edge_text(text, None, flags)?;
    println!("{}", outcome.message());

    save(dag)?;
    if !outcome.is_success() {
        anyhow::bail!("assertion failed with status {}", outcome.status_code());
    }
    Ok(())
}

pub fn query(config: DagConfig, spec: &str, position: Option<i32>) -> anyhow::Result<()> {
    let dag = Dag::open(config)?;
    let node = resolve(&dag, spec)?;
    let related = dag
        .related_edges()
        .context("RelatedEdgeModule is not active for this store")?;

    let mut constraints = vec![Constraint::any(&node)];
    if let Some(position) = position.filter(|p| *p != 0) {
        constraints.push(Constraint {
            arg: (&node).into(),
            position: Some(position),
        });
    }
    for edge in related.execute(&constraints) {
        println!("{}\t{}", edge.id(), edge);
    }
    Ok(())
}

pub fn lookup(config: DagConfig, alias: &str, ignore_case: bool, prefix: bool) -> anyhow::Result<()> {
    let dag = Dag::open(config)?;
    let aliases = dag
        .aliases()
        .context("NodeAliasModule is not active for this store")?;

    for id in aliases.find_nodes(alias, !ignore_case, !prefix) {
        if let Some(node) = dag.node(id) {
            println!("{}\t{}", id, node);
        }
    }
    Ok(())
}

pub fn remove(config: DagConfig, spec: &str) -> anyhow::Result<()> {
    let dag = Dag::open(config)?;
    let node = resolve(&dag, spec)?;
    dag.remove_node(node.id());
    println!("Removed {}", node);
    save(dag)
}

pub fn ground(config: DagConfig) -> anyhow::Result<()> {
    let dag = Dag::open(config)?;
    let grounded = dag.ground_ephemeral();
    println!("Grounded {} edges", grounded);
    save(dag)
}

fn resolve(dag: &Dag, spec: &str) -> anyhow::Result<Arc<DagNode>> {
    let flags = NodeFlags {
        dag_node_only: true,
        ..NodeFlags::FIND
    };
    dag.find_or_create_node(spec, None, flags)
        .and_then(|arg| arg.as_node().cloned())
        .with_context(|| format!("no node matches {spec:?}"))
}

fn save(dag: Dag) -> anyhow::Result<()> {
    if !dag.shutdown() {
        anyhow::bail!("failed to save the store");
    }
    Ok(())
}
