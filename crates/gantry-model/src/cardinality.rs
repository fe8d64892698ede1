use crate::graph::Graph;
use crate::instance::Instance;
use serde::{Deserialize, Serialize};

/// How many exporters a required (non-optional) prefix needs before the
/// requirement counts as satisfied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case", tag = "policy", content = "count")]
pub enum CardinalityPolicy {
    /// Any single exporter satisfies the requirement.
    #[default]
    AnyOne,
    AtLeast(usize),
}

impl CardinalityPolicy {
    pub fn is_met(self, exporters: usize) -> bool {
        match self {
            CardinalityPolicy::AnyOne => exporters >= 1,
            CardinalityPolicy::AtLeast(n) => exporters >= n.max(1),
        }
    }
}

/// Required prefixes of `instance` that do not yet have enough exporters.
pub fn missing_imports(graph: &Graph, instance: &Instance, policy: CardinalityPolicy) -> Vec<String> {
    graph
        .imports_of(&instance.component)
        .iter()
        .filter(|decl| !decl.optional)
        .filter(|decl| !policy.is_met(instance.exporter_count(&decl.prefix)))
        .map(|decl| decl.prefix.clone())
        .collect()
}

pub fn imports_satisfied(graph: &Graph, instance: &Instance, policy: CardinalityPolicy) -> bool {
    missing_imports(graph, instance, policy).is_empty()
}
