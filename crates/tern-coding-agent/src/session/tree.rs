use std::collections::HashMap;

use crate::session::types::SessionEntry;

/// A node in the navigator view of the session tree.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub entry: SessionEntry,
    pub children: Vec<String>,
    /// Last user-assigned label targeting this entry, if any.
    pub label: Option<String>,
}

/// Read-only tree view over a flat entry list: parent edges, child lists and
/// resolved labels. Built on demand for navigators and branch-summary
/// collection.
#[derive(Debug)]
pub struct SessionTree {
    nodes: HashMap<String, TreeNode>,
    roots: Vec<String>,
}

impl SessionTree {
    pub fn from_entries(entries: &[SessionEntry]) -> Self {
        let mut nodes: HashMap<String, TreeNode> = HashMap::new();
        let mut roots = Vec::new();

        for entry in entries {
            // Label entries annotate their target rather than appearing as
            // nodes; the last label for a target wins.
            if let SessionEntry::Label {
                target_id, label, ..
            } = entry
            {
                if let Some(node) = nodes.get_mut(target_id) {
                    node.label = label.clone();
                }
                continue;
            }

            let id = entry.id().to_string();
            nodes.insert(
                id.clone(),
                TreeNode {
                    entry: entry.clone(),
                    children: Vec::new(),
                    label: None,
                },
            );

            match entry.parent_id() {
                Some(parent_id) => {
                    if let Some(parent) = nodes.get_mut(parent_id) {
                        parent.children.push(id);
                    } else {
                        roots.push(id);
                    }
                }
                None => roots.push(id),
            }
        }

        Self { nodes, roots }
    }

    pub fn get(&self, id: &str) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Root-to-entry path following parent edges.
    pub fn path_to(&self, entry_id: &str) -> Vec<&SessionEntry> {
        let mut path = Vec::new();
        let mut current = entry_id;

        while let Some(node) = self.nodes.get(current) {
            path.push(&node.entry);
            match node.entry.parent_id() {
                Some(parent_id) => current = parent_id,
                None => break,
            }
        }

        path.reverse();
        path
    }

    /// Lowest common ancestor of two entries, if they share one.
    pub fn lowest_common_ancestor(&self, a: &str, b: &str) -> Option<&SessionEntry> {
        let path_a = self.path_to(a);
        let path_b = self.path_to(b);

        let mut lca = None;
        for (ea, eb) in path_a.iter().zip(path_b.iter()) {
            if ea.id() == eb.id() {
                lca = Some(*ea);
            } else {
                break;
            }
        }
        lca
    }

    pub fn leaves(&self) -> Vec<&SessionEntry> {
        self.nodes
            .values()
            .filter(|n| n.children.is_empty())
            .map(|n| &n.entry)
            .collect()
    }

    pub fn has_branches(&self, id: &str) -> bool {
        self.nodes.get(id).is_some_and(|n| n.children.len() > 1)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
