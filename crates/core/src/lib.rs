use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use std::collections::BTreeSet;
use thiserror::Error;
use petgraph::graph::DiGraph;
use petgraph::algo::toposort;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(kind: &str, name: &str) -> Self {
        ResourceId(format!("{kind}.{name}"))
    }
}

/// One node of the compiled plan: a fully resolved resource body plus the
/// ids it must be created after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub id: ResourceId,
    #[serde(default)]
    pub deps: BTreeSet<ResourceId>,
    pub body: serde_json::Value,
}

impl ResourceSpec {
    pub fn new(id: ResourceId, body: serde_json::Value) -> Self {
        Self { id, deps: BTreeSet::new(), body }
    }

    pub fn after(mut self, dep: &ResourceId) -> Self {
        self.deps.insert(dep.clone());
        self
    }
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("dependency cycle detected")]
    Cycle,
    #[error("resource '{0}' depends on undeclared resource '{1}'")]
    UnknownDep(String, String),
}

/// Dependency-order the plan. Every dep must name another spec in the slice;
/// both error arms signal a defect in the code that assembled the specs, not
/// bad user input.
pub fn order(specs: &[ResourceSpec]) -> Result<Vec<ResourceId>, PlanError> {
    use std::collections::HashMap;
    let mut g: DiGraph<ResourceId, ()> = DiGraph::new();
    let mut id_to_ix = HashMap::new();
    for s in specs {
        let ix = g.add_node(s.id.clone());
        id_to_ix.insert(s.id.clone(), ix);
    }
    for s in specs {
        let to_ix = id_to_ix[&s.id];
        for d in &s.deps {
            match id_to_ix.get(d) {
                Some(&from_ix) => { g.add_edge(from_ix, to_ix, ()); }
                None => return Err(PlanError::UnknownDep(s.id.0.clone(), d.0.clone())),
            }
        }
    }
    let ordered_ix = toposort(&g, None).map_err(|_| PlanError::Cycle)?;
    Ok(ordered_ix.into_iter().map(|ix| g[ix].clone()).collect())
}

/// Seam toward the external provisioning engine. batchforge only compiles;
/// whatever applies the plan implements this.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn apply(&self, id: &ResourceId, body: &serde_json::Value) -> anyhow::Result<()>;
}

pub async fn apply_all(p: &dyn Provisioner, specs: &[ResourceSpec]) -> anyhow::Result<()> {
    for id in order(specs)? {
        let s = specs.iter().find(|x| x.id == id).unwrap();
        p.apply(&s.id, &s.body).await?;
    }
    Ok(())
}
