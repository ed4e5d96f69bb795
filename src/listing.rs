//! Directory-style views over an entry list.
//!
//! Both views are pure functions of an entry snapshot and never mutate it.

use std::collections::HashSet;

use crate::entry::{ArchiveEntry, normalize_path};

/// Immediate children of one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    /// Full paths of child directories, in first-seen order.
    pub directories: Vec<String>,
    pub files: Vec<ArchiveEntry>,
}

/// List the direct children of `prefix`.
///
/// Directories implied only by deeper files are included once.
pub fn list_contents(entries: &[ArchiveEntry], prefix: &str) -> Listing {
    let mut listing = Listing::default();
    let Some(prefix) = normalize_path(prefix) else {
        return listing;
    };
    let mut seen = HashSet::new();

    for entry in entries {
        let rest = if prefix.is_empty() {
            entry.filename.as_str()
        } else {
            match entry
                .filename
                .strip_prefix(prefix.as_str())
                .and_then(|r| r.strip_prefix('/'))
            {
                Some(rest) => rest,
                None => continue,
            }
        };
        if rest.is_empty() {
            continue;
        }

        match rest.split_once('/') {
            Some((child, _)) => {
                let path = join(&prefix, child);
                if seen.insert(path.clone()) {
                    listing.directories.push(path);
                }
            }
            None if entry.directory => {
                if seen.insert(entry.filename.clone()) {
                    listing.directories.push(entry.filename.clone());
                }
            }
            None => listing.files.push(entry.clone()),
        }
    }

    listing
}

fn join(prefix: &str, child: &str) -> String {
    if prefix.is_empty() {
        child.to_string()
    } else {
        format!("{prefix}/{child}")
    }
}

/// Normalise a navigation target.
///
/// Returns `""` for the root or `"a/b/"` for a directory, or `None` when the
/// path climbs above the archive root.
pub fn clamp_prefix(path: &str) -> Option<String> {
    let path = normalize_path(path)?;
    if path.is_empty() {
        Some(path)
    } else {
        Some(format!("{path}/"))
    }
}

/// One node of the full directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTreeNode {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    /// File size, or the total size of all files below a directory.
    pub size: u64,
    pub children: Vec<FileTreeNode>,
}

impl FileTreeNode {
    fn dir(name: &str, path: String) -> Self {
        Self {
            name: name.to_string(),
            path,
            is_dir: true,
            size: 0,
            children: Vec::new(),
        }
    }

    /// Depth-first walk, parents before children.
    pub fn walk(&self) -> Vec<(usize, &FileTreeNode)> {
        let mut out = Vec::new();
        let mut stack = vec![(0, self)];
        while let Some((depth, node)) = stack.pop() {
            out.push((depth, node));
            for child in node.children.iter().rev() {
                stack.push((depth + 1, child));
            }
        }
        out
    }

    fn child_mut(&mut self, name: &str) -> &mut FileTreeNode {
        let idx = match self.children.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None => {
                let path = join(&self.path, name);
                self.children.push(FileTreeNode::dir(name, path));
                self.children.len() - 1
            }
        };
        &mut self.children[idx]
    }

    /// Sort directories first then by name, and roll file sizes up.
    fn finalize(&mut self) -> u64 {
        if !self.is_dir {
            return self.size;
        }
        self.children
            .sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        self.size = self.children.iter_mut().map(FileTreeNode::finalize).sum();
        self.size
    }
}

/// Build the nested tree for every entry. The root has an empty name and path.
pub fn build_file_tree(entries: &[ArchiveEntry]) -> FileTreeNode {
    let mut root = FileTreeNode::dir("", String::new());

    for entry in entries {
        let mut segments: Vec<&str> = entry.filename.split('/').collect();
        let Some(leaf) = segments.pop() else {
            continue;
        };

        let mut node = &mut root;
        for segment in segments {
            node = node.child_mut(segment);
        }

        if entry.directory {
            node.child_mut(leaf);
        } else if !node.children.iter().any(|c| c.name == leaf) {
            node.children.push(FileTreeNode {
                name: leaf.to_string(),
                path: entry.filename.clone(),
                is_dir: false,
                size: entry.uncompressed_size,
                children: Vec::new(),
            });
        }
    }

    root.finalize();
    root
}
