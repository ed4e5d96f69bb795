//! Format-independent entry model and the append-only entry list.

use std::collections::HashSet;

use chrono::NaiveDateTime;

use crate::zip::CompressionMethod;

/// Location data needed to extract an entry later. Never leaves the crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EntryHandle {
    Zip {
        local_header_offset: u64,
        method: CompressionMethod,
        crc32: u32,
        encrypted: bool,
        /// Name + extra length from the central directory, used to size the
        /// speculative local header read.
        header_hint: u64,
    },
    Tar {
        data_offset: u64,
        length: u64,
    },
    /// Directory implied by a deeper path; there is nothing to extract.
    Synthetic,
}

/// One logical member of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Forward-slash path without leading or trailing slash.
    pub filename: String,
    pub directory: bool,
    pub uncompressed_size: u64,
    /// Zero when unknown.
    pub compressed_size: u64,
    pub last_modified: Option<NaiveDateTime>,
    pub(crate) handle: EntryHandle,
}

impl ArchiveEntry {
    pub(crate) fn new(
        raw_name: &str,
        directory: bool,
        uncompressed_size: u64,
        compressed_size: u64,
        last_modified: Option<NaiveDateTime>,
        handle: EntryHandle,
    ) -> Self {
        let directory = directory || raw_name.ends_with('/') || raw_name.ends_with('\\');
        // An empty name is dropped by `EntryList::append`.
        let filename = normalize_path(raw_name).unwrap_or_else(|| {
            tracing::warn!(name = raw_name, "skipping entry outside the archive root");
            String::new()
        });
        Self {
            filename,
            directory,
            uncompressed_size,
            compressed_size,
            last_modified,
            handle,
        }
    }

    fn synthetic_dir(path: &str) -> Self {
        Self {
            filename: path.to_string(),
            directory: true,
            uncompressed_size: 0,
            compressed_size: 0,
            last_modified: None,
            handle: EntryHandle::Synthetic,
        }
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.filename.rsplit('/').next().unwrap_or(&self.filename)
    }

    /// Parent directory path, empty for top-level entries.
    pub fn parent(&self) -> &str {
        self.filename.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
    }

    /// True for directories implied by deeper paths rather than stored.
    pub fn is_synthetic(&self) -> bool {
        self.handle == EntryHandle::Synthetic
    }
}

/// Normalise an archive member path to `a/b/c`, resolving `.` and `..`.
///
/// Returns `None` when the path climbs above the archive root.
pub fn normalize_path(raw: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    Some(parts.join("/"))
}

/// Insertion-ordered, append-only list of discovered entries.
///
/// Filenames are unique, and every entry's ancestor directories are present
/// before it.
#[derive(Debug, Default, Clone)]
pub struct EntryList {
    entries: Vec<ArchiveEntry>,
    names: HashSet<String>,
}

impl EntryList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch and return the entries actually added, including any
    /// synthesised ancestors. Duplicates and empty names are dropped.
    pub fn append(&mut self, batch: Vec<ArchiveEntry>) -> Vec<ArchiveEntry> {
        let start = self.entries.len();

        for entry in batch {
            if entry.filename.is_empty() {
                continue;
            }
            if self.names.contains(&entry.filename) {
                tracing::debug!(name = %entry.filename, "skipping duplicate entry");
                continue;
            }

            let mut ancestor_end = 0;
            while let Some(pos) = entry.filename[ancestor_end..].find('/') {
                ancestor_end += pos;
                let ancestor = &entry.filename[..ancestor_end];
                if !self.names.contains(ancestor) {
                    self.names.insert(ancestor.to_string());
                    self.entries.push(ArchiveEntry::synthetic_dir(ancestor));
                }
                ancestor_end += 1;
            }

            self.names.insert(entry.filename.clone());
            self.entries.push(entry);
        }

        self.entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ArchiveEntry> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Look up an entry by path, normalising the query first.
    pub fn get(&self, path: &str) -> Option<&ArchiveEntry> {
        let path = normalize_path(path)?;
        if !self.names.contains(&path) {
            return None;
        }
        self.entries.iter().find(|e| e.filename == path)
    }
}

impl<'a> IntoIterator for &'a EntryList {
    type Item = &'a ArchiveEntry;
    type IntoIter = std::slice::Iter<'a, ArchiveEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
pub(crate) fn test_entry(name: &str, size: u64) -> ArchiveEntry {
    ArchiveEntry::new(
        name,
        false,
        size,
        size,
        None,
        EntryHandle::Tar {
            data_offset: 0,
            length: size,
        },
    )
}
