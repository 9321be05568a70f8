//! # Record Filesystem
//!
//! The state the chain replicates: a flat namespace of files, each an
//! append-only list of records. There are no directories, no deletes and
//! no overwrites, so a file's content is fully determined by the ordered
//! ops that touched it.
//!
//! Cloning is a deep copy. Staging takes one before applying speculative
//! ops and throws it away on rejection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("file {0:?} already exists")]
    FileExists(String),

    #[error("file {0:?} does not exist")]
    FileNotFound(String),

    #[error("file {filename:?} has no record {index}")]
    RecordNotFound { filename: String, index: u64 },
}

/// One file: its records in append order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    records: Vec<Vec<u8>>,
}

impl File {
    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Vec<u8>] {
        &self.records
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystem {
    files: BTreeMap<String, File>,
}

impl FileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// File names in lexicographic order.
    pub fn list_files(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn add_file(&mut self, name: &str) -> Result<&File, FsError> {
        if self.files.contains_key(name) {
            return Err(FsError::FileExists(name.to_string()));
        }
        Ok(self.files.entry(name.to_string()).or_default())
    }

    /// Append a record and return its zero-based index.
    pub fn append_record(&mut self, name: &str, payload: Vec<u8>) -> Result<u64, FsError> {
        let file = self
            .files
            .get_mut(name)
            .ok_or_else(|| FsError::FileNotFound(name.to_string()))?;
        file.records.push(payload);
        Ok(file.len() - 1)
    }

    pub fn total_records(&self, name: &str) -> Result<u64, FsError> {
        self.files
            .get(name)
            .map(File::len)
            .ok_or_else(|| FsError::FileNotFound(name.to_string()))
    }

    pub fn read_record(&self, name: &str, index: u64) -> Result<&[u8], FsError> {
        let file = self
            .files
            .get(name)
            .ok_or_else(|| FsError::FileNotFound(name.to_string()))?;
        usize::try_from(index)
            .ok()
            .and_then(|i| file.records.get(i))
            .map(Vec::as_slice)
            .ok_or_else(|| FsError::RecordNotFound {
                filename: name.to_string(),
                index,
            })
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_list() {
        let mut fs = FileSystem::new();
        fs.add_file("b.txt").unwrap();
        fs.add_file("a.txt").unwrap();
        assert_eq!(fs.list_files(), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn duplicate_add_fails() {
        let mut fs = FileSystem::new();
        fs.add_file("a.txt").unwrap();
        assert_eq!(fs.add_file("a.txt"), Err(FsError::FileExists("a.txt".into())));
    }

    #[test]
    fn append_returns_sequential_indices() {
        let mut fs = FileSystem::new();
        fs.add_file("log").unwrap();
        assert_eq!(fs.append_record("log", b"one".to_vec()), Ok(0));
        assert_eq!(fs.append_record("log", b"two".to_vec()), Ok(1));
        assert_eq!(fs.total_records("log"), Ok(2));
        assert_eq!(fs.read_record("log", 1), Ok(&b"two"[..]));
    }

    #[test]
    fn missing_file_and_record_errors() {
        let mut fs = FileSystem::new();
        assert_eq!(
            fs.append_record("nope", vec![]),
            Err(FsError::FileNotFound("nope".into()))
        );
        assert!(matches!(fs.total_records("nope"), Err(FsError::FileNotFound(_))));

        fs.add_file("empty").unwrap();
        assert_eq!(
            fs.read_record("empty", 0),
            Err(FsError::RecordNotFound {
                filename: "empty".into(),
                index: 0
            })
        );
    }

    #[test]
    fn clone_is_independent() {
        let mut fs = FileSystem::new();
        fs.add_file("a").unwrap();
        let mut copy = fs.clone();
        copy.append_record("a", b"x".to_vec()).unwrap();
        copy.add_file("b").unwrap();

        assert_eq!(fs.total_records("a"), Ok(0));
        assert!(!fs.contains("b"));
    }
}
