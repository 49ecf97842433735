use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    Machinecode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub display: String,
    /// Slash-prefixed path relative to the G-code root.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub size: u64,
    pub date: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, FileNode>,
}

/// Nested view of the printer's G-code storage, as shown to remote clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileListing {
    #[serde(default)]
    pub local: BTreeMap<String, FileNode>,
}

impl FileListing {
    /// Insert one file by its relative path, creating intermediate folders.
    ///
    /// Folders take the size and date of the most recently inserted file
    /// beneath them.
    pub fn insert(&mut self, path: &str, size: u64, modified: f64) {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let Some((leaf, folders)) = components.split_last() else {
            return;
        };

        let mut level = &mut self.local;
        let mut current = String::new();
        for folder in folders {
            current.push('/');
            current.push_str(folder);
            let node = level
                .entry((*folder).to_owned())
                .or_insert_with(|| FileNode {
                    name: (*folder).to_owned(),
                    display: (*folder).to_owned(),
                    path: current.clone(),
                    kind: NodeKind::Folder,
                    size,
                    date: modified,
                    children: BTreeMap::new(),
                });
            node.kind = NodeKind::Folder;
            node.size = size;
            node.date = modified;
            level = &mut node.children;
        }

        current.push('/');
        current.push_str(leaf);
        level.insert(
            (*leaf).to_owned(),
            FileNode {
                name: (*leaf).to_owned(),
                display: (*leaf).to_owned(),
                path: current,
                kind: NodeKind::Machinecode,
                size,
                date: modified,
                children: BTreeMap::new(),
            },
        );
    }
}
