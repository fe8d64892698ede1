//! Resolved-import bookkeeping for the instances of one agent.
//!
//! Import messages may arrive duplicated or out of order. Every
//! (prefix, exporter) pair keeps the revision of the last event applied,
//! removals included, and anything not newer is dropped. The result is the
//! state of the chronologically last event, whatever the delivery order.

use gantry_model::{Application, Graph, Import, InstancePath};
use gantry_plugin::ImportChange;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// A change applied to one local instance.
pub type AppliedChange = (InstancePath, ImportChange);

#[derive(Debug, Clone, Default)]
pub struct ImportLedger {
    seen: BTreeMap<(String, InstancePath), u64>,
}

impl ImportLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `revision` for the pair if it is newer than the last one.
    pub fn admit(&mut self, prefix: &str, exporter: &InstancePath, revision: u64) -> bool {
        let key = (prefix.to_owned(), exporter.clone());
        match self.seen.get(&key) {
            Some(&last) if last >= revision => false,
            _ => {
                self.seen.insert(key, revision);
                true
            }
        }
    }

    pub fn last_revision(&self, prefix: &str, exporter: &InstancePath) -> Option<u64> {
        self.seen
            .get(&(prefix.to_owned(), exporter.clone()))
            .copied()
    }

    /// Apply an exporter's announcement. Stale or duplicate announcements,
    /// and announcements nobody here requires, change nothing.
    pub fn apply_added(
        &mut self,
        app: &mut Application,
        prefix: &str,
        import: &Import,
        revision: u64,
    ) -> Vec<AppliedChange> {
        if !self.admit(prefix, &import.exporter_path, revision) {
            trace!("stale import-added {prefix} from {} (r{revision})", import.exporter_path);
            return Vec::new();
        }
        let consumers: Vec<InstancePath> = app
            .instances()
            .filter(|i| i.path != import.exporter_path && requires(&app.graph, &i.component, prefix))
            .map(|i| i.path.clone())
            .collect();

        let mut changes = Vec::new();
        for path in consumers {
            let Some(instance) = app.get_mut(&path) else {
                continue;
            };
            let entries = instance.imports.entry(prefix.to_owned()).or_default();
            let change = match entries.get(&import.exporter_path) {
                Some(existing) if existing == import => continue,
                Some(_) => ImportChange::Updated {
                    prefix: prefix.to_owned(),
                    import: import.clone(),
                },
                None => ImportChange::Added {
                    prefix: prefix.to_owned(),
                    import: import.clone(),
                },
            };
            entries.insert(import.exporter_path.clone(), import.clone());
            debug!("{path}: import {prefix} from {} {}", import.exporter_path, change.kind());
            changes.push((path, change));
        }
        changes
    }

    /// Apply a withdrawal. Withdrawing an exporter nobody holds is a no-op.
    pub fn apply_removed(
        &mut self,
        app: &mut Application,
        prefix: &str,
        exporter: &InstancePath,
        revision: u64,
    ) -> Vec<AppliedChange> {
        if !self.admit(prefix, exporter, revision) {
            trace!("stale import-removed {prefix} from {exporter} (r{revision})");
            return Vec::new();
        }
        remove_exporter(app, prefix, exporter)
    }

    /// Apply a withdrawal that did not come from the exporter, whatever its
    /// revision. The exporter's last revision is kept, so its next
    /// announcement is still accepted and older ones are still dropped.
    pub fn apply_withdrawn(
        &mut self,
        app: &mut Application,
        prefix: &str,
        exporter: &InstancePath,
    ) -> Vec<AppliedChange> {
        trace!(
            "forced import-removed {prefix} from {exporter}, last seen r{:?}",
            self.last_revision(prefix, exporter)
        );
        remove_exporter(app, prefix, exporter)
    }

    /// Drop every import held from an exporter outside `local_root`, as
    /// withdrawals. Used when this agent may have missed announcements.
    pub fn withdraw_remote(&mut self, app: &mut Application, local_root: &str) -> Vec<AppliedChange> {
        let remote: BTreeSet<(String, InstancePath)> = app
            .instances()
            .flat_map(|i| {
                i.imports.iter().flat_map(|(prefix, exporters)| {
                    exporters.keys().map(move |e| (prefix.clone(), e.clone()))
                })
            })
            .filter(|(_, exporter)| exporter.root_name() != local_root)
            .collect();
        remote
            .into_iter()
            .flat_map(|(prefix, exporter)| self.apply_withdrawn(app, &prefix, &exporter))
            .collect()
    }
}

fn remove_exporter(app: &mut Application, prefix: &str, exporter: &InstancePath) -> Vec<AppliedChange> {
    let mut changes = Vec::new();
    for instance in app.instances_mut() {
        let Some(entries) = instance.imports.get_mut(prefix) else {
            continue;
        };
        if entries.remove(exporter).is_none() {
            continue;
        }
        if entries.is_empty() {
            instance.imports.remove(prefix);
        }
        debug!("{}: import {prefix} from {exporter} removed", instance.path);
        changes.push((
            instance.path.clone(),
            ImportChange::Removed {
                prefix: prefix.to_owned(),
                exporter_path: exporter.clone(),
            },
        ));
    }
    changes
}

/// Whether `component` declares an import of `prefix`.
pub fn requires(graph: &Graph, component: &str, prefix: &str) -> bool {
    graph.imports_of(component).iter().any(|d| d.prefix == prefix)
}

/// Every prefix some instance of `app` imports.
pub fn required_prefixes(app: &Application) -> BTreeSet<String> {
    app.instances()
        .flat_map(|i| app.graph.imports_of(&i.component))
        .map(|d| d.prefix.clone())
        .collect()
}

/// Every prefix some non-root instance of `app` can export under.
pub fn exported_prefixes(app: &Application) -> BTreeSet<String> {
    app.instances()
        .filter(|i| !i.is_root())
        .flat_map(|i| app.graph.exported_prefixes(&i.component))
        .collect()
}
