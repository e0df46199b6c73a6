//! Folder/file tree of a container.
//!
//! Every entity carries an `id` and the `pid` of its parent folder.  The root
//! folder is synthetic (id [`ROOT_ID`], pid 0, empty name): it always
//! resolves and is never written to disk.
//!
//! Two flavours share the read API in [`IndexTree`]:
//! * [`PackageIndex`]: decoded from an open container, immutable.
//! * [`StagingIndex`]: built up before a pack, mutable.
//!
//! Entries are kept in insertion order; listing never sorts.

mod codec;
mod staging;

pub use codec::{decode_index, encode_index, V1_FILE_ID_BASE};
pub use staging::{FileSource, IdCounter, StagedFile, StagedFolder, StagingIndex};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Id of the synthetic root folder.
pub const ROOT_ID: u32 = 10000;
/// Parent id stored for the root.
pub const ROOT_PID: u32 = 0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IndexError {
    #[error("Folder {id} not found")]
    FolderNotFound { id: u32 },
    #[error("File {id} not found")]
    FileNotFound { id: u32 },
    #[error("Name '{name}' already used in folder {parent}")]
    DuplicateName { name: String, parent: u32 },
    #[error("Id {id} is used twice")]
    DuplicateId { id: u32 },
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Name must not be empty")]
    EmptyName,
}

/// Common shape of every folder and file.
pub trait PzItem {
    fn name(&self) -> &str;
    fn id(&self) -> u32;
    fn pid(&self) -> u32;
}

macro_rules! impl_item {
    ($($ty:ty),*) => {$(
        impl PzItem for $ty {
            fn name(&self) -> &str { &self.name }
            fn id(&self) -> u32 { self.id }
            fn pid(&self) -> u32 { self.pid }
        }
    )*};
}

impl_item!(PzFolder, PzFile, StagedFolder, StagedFile);

// ── Materialized entities ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PzFolder {
    pub name: String,
    pub id:   u32,
    pub pid:  u32,
}

impl PzFolder {
    pub fn new(name: impl Into<String>, id: u32, pid: u32) -> Self {
        Self { name: name.into(), id, pid }
    }

    pub fn root() -> Self {
        Self::new("", ROOT_ID, ROOT_PID)
    }
}

/// A file as stored in a container.  `size` is the stored (encrypted) length
/// starting at `offset`; `origin_size` the plain length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PzFile {
    pub name:        String,
    pub id:          u32,
    pub pid:         u32,
    pub offset:      u64,
    pub size:        u64,
    pub origin_size: u64,
}

impl PzFile {
    pub fn extension(&self) -> Option<&str> {
        extension_of(&self.name)
    }
}

pub(crate) fn extension_of(name: &str) -> Option<&str> {
    Path::new(name).extension().and_then(|e| e.to_str())
}

// ── EntryTable ──────────────────────────────────────────────────────────────

/// Id-keyed table that remembers insertion order.
#[derive(Debug, Clone)]
pub struct EntryTable<T> {
    entries: Vec<T>,
    by_id:   HashMap<u32, usize>,
}

impl<T> Default for EntryTable<T> {
    fn default() -> Self {
        Self { entries: Vec::new(), by_id: HashMap::new() }
    }
}

impl<T: PzItem> EntryTable<T> {
    pub fn insert(&mut self, item: T) -> Result<(), IndexError> {
        let id = item.id();
        if self.by_id.contains_key(&id) {
            return Err(IndexError::DuplicateId { id });
        }
        self.by_id.insert(id, self.entries.len());
        self.entries.push(item);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.by_id.get(&id).map(|&i| &self.entries[i])
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        match self.by_id.get(&id) {
            Some(&i) => Some(&mut self.entries[i]),
            None     => None,
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Drop every entry whose id is in `ids`.  Returns the removed entries
    /// in table order.
    pub(crate) fn remove_many(&mut self, ids: &HashSet<u32>) -> Vec<T> {
        let (removed, kept): (Vec<T>, Vec<T>) =
            self.entries.drain(..).partition(|e| ids.contains(&e.id()));
        self.entries = kept;
        self.reindex();
        removed
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.by_id.clear();
    }

    fn reindex(&mut self) {
        self.by_id = self.entries.iter().enumerate().map(|(i, e)| (e.id(), i)).collect();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── IndexTree ───────────────────────────────────────────────────────────────

/// A child of a folder, as returned by [`IndexTree::list_items`].
#[derive(Debug, Clone, Copy)]
pub enum ItemRef<'a, D, F> {
    Folder(&'a D),
    File(&'a F),
}

/// Read-only queries over either index flavour.
pub trait IndexTree {
    type Folder: PzItem;
    type File:   PzItem;

    fn root(&self) -> &Self::Folder;
    fn folder_table(&self) -> &EntryTable<Self::Folder>;
    fn file_table(&self) -> &EntryTable<Self::File>;

    fn get_folder(&self, id: u32) -> Result<&Self::Folder, IndexError> {
        if id == ROOT_ID {
            return Ok(self.root());
        }
        self.folder_table().get(id).ok_or(IndexError::FolderNotFound { id })
    }

    fn get_file(&self, id: u32) -> Result<&Self::File, IndexError> {
        self.file_table().get(id).ok_or(IndexError::FileNotFound { id })
    }

    /// Child folders of `folder`; with `recursive`, every descendant folder
    /// (children first, then grandchildren, and so on).
    fn list_folders(&self, folder: u32, recursive: bool) -> Result<Vec<&Self::Folder>, IndexError> {
        self.get_folder(folder)?;
        let children = |pid: u32| self.folder_table().iter().filter(move |f| f.pid() == pid);

        let mut result: Vec<&Self::Folder> = children(folder).collect();
        if recursive {
            let mut seen: HashSet<u32> = result.iter().map(|f| f.id()).collect();
            seen.insert(folder);
            let mut i = 0;
            while i < result.len() {
                let id = result[i].id();
                for child in children(id) {
                    if seen.insert(child.id()) {
                        result.push(child);
                    }
                }
                i += 1;
            }
        }
        Ok(result)
    }

    /// Files directly inside `folder`; with `recursive`, also those of every
    /// descendant folder.
    fn list_files(&self, folder: u32, recursive: bool) -> Result<Vec<&Self::File>, IndexError> {
        self.get_folder(folder)?;
        let mut result: Vec<&Self::File> =
            self.file_table().iter().filter(|f| f.pid() == folder).collect();
        if recursive {
            for sub in self.list_folders(folder, true)? {
                let id = sub.id();
                result.extend(self.file_table().iter().filter(|f| f.pid() == id));
            }
        }
        Ok(result)
    }

    fn list_items(
        &self,
        folder: u32,
        recursive: bool,
    ) -> Result<Vec<ItemRef<'_, Self::Folder, Self::File>>, IndexError> {
        let mut items: Vec<_> = self
            .list_folders(folder, recursive)?
            .into_iter()
            .map(ItemRef::Folder)
            .collect();
        items.extend(self.list_files(folder, recursive)?.into_iter().map(ItemRef::File));
        Ok(items)
    }

    fn all_files(&self) -> &[Self::File] {
        self.file_table().as_slice()
    }

    fn all_folders(&self) -> &[Self::Folder] {
        self.folder_table().as_slice()
    }

    fn files_count(&self) -> usize {
        self.file_table().len()
    }

    /// Folders from `folder` up to `stop_at` (inclusive) or the root
    /// (exclusive), nearest first.
    fn resolve_path_stack(&self, folder: u32, stop_at: u32) -> Result<Vec<&Self::Folder>, IndexError> {
        let mut stack = Vec::new();
        let mut current = self.get_folder(folder)?;
        while current.id() != ROOT_ID {
            if stack.len() > self.folder_table().len() {
                return Err(IndexError::InvalidOperation(format!(
                    "folder {folder} has a cyclic parent chain"
                )));
            }
            stack.push(current);
            if current.id() == stop_at {
                break;
            }
            current = self.get_folder(current.pid())?;
        }
        Ok(stack)
    }

    /// Relative path of `item` as seen from the parent of `stop_at`.
    fn resolve_path<I: PzItem + ?Sized>(&self, item: &I, stop_at: u32) -> Result<PathBuf, IndexError> {
        if item.id() == ROOT_ID {
            return Ok(PathBuf::new());
        }
        let mut path = PathBuf::new();
        if item.id() != stop_at {
            for folder in self.resolve_path_stack(item.pid(), stop_at)?.iter().rev() {
                path.push(folder.name());
            }
        }
        path.push(item.name());
        Ok(path)
    }

    fn full_path<I: PzItem + ?Sized>(&self, item: &I) -> Result<PathBuf, IndexError> {
        self.resolve_path(item, ROOT_ID)
    }
}

// ── PackageIndex ────────────────────────────────────────────────────────────

/// Index of an opened container.
#[derive(Debug, Clone)]
pub struct PackageIndex {
    root:    PzFolder,
    folders: EntryTable<PzFolder>,
    files:   EntryTable<PzFile>,
}

impl PackageIndex {
    pub fn new(folders: Vec<PzFolder>, files: Vec<PzFile>) -> Result<Self, IndexError> {
        let mut index = Self {
            root:    PzFolder::root(),
            folders: EntryTable::default(),
            files:   EntryTable::default(),
        };
        for folder in folders {
            if folder.id == ROOT_ID {
                return Err(IndexError::DuplicateId { id: ROOT_ID });
            }
            index.folders.insert(folder)?;
        }
        for file in files {
            if index.folders.contains(file.id) || file.id == ROOT_ID {
                return Err(IndexError::DuplicateId { id: file.id });
            }
            index.files.insert(file)?;
        }
        Ok(index)
    }
}

impl IndexTree for PackageIndex {
    type Folder = PzFolder;
    type File   = PzFile;

    fn root(&self) -> &PzFolder {
        &self.root
    }

    fn folder_table(&self) -> &EntryTable<PzFolder> {
        &self.folders
    }

    fn file_table(&self) -> &EntryTable<PzFile> {
        &self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, id: u32, pid: u32) -> PzFile {
        PzFile { name: name.into(), id, pid, offset: 0, size: 32, origin_size: 10 }
    }

    // root ─ a ─ b ─ c
    //      └ d
    fn sample() -> PackageIndex {
        PackageIndex::new(
            vec![
                PzFolder::new("a", 1, ROOT_ID),
                PzFolder::new("b", 2, 1),
                PzFolder::new("d", 4, ROOT_ID),
                PzFolder::new("c", 3, 2),
            ],
            vec![
                file("top.txt", 10, ROOT_ID),
                file("in_c.bin", 11, 3),
                file("in_a.png", 12, 1),
                file("in_b.txt", 13, 2),
            ],
        )
        .unwrap()
    }

    #[test]
    fn root_always_resolves() {
        let index = PackageIndex::new(vec![], vec![]).unwrap();
        assert_eq!(index.get_folder(ROOT_ID).unwrap().name, "");
        assert_eq!(index.get_folder(7), Err(IndexError::FolderNotFound { id: 7 }));
        assert_eq!(index.get_file(7), Err(IndexError::FileNotFound { id: 7 }));
    }

    #[test]
    fn listing_keeps_insertion_order() {
        let index = sample();
        let names: Vec<_> = index.list_folders(ROOT_ID, false).unwrap().iter().map(|f| f.name.clone()).collect();
        assert_eq!(names, ["a", "d"]);

        let all: Vec<_> = index.list_folders(ROOT_ID, true).unwrap().iter().map(|f| f.id).collect();
        assert_eq!(all, [1, 4, 2, 3]);

        let files: Vec<_> = index.list_files(1, true).unwrap().iter().map(|f| f.id).collect();
        assert_eq!(files, [12, 13, 11]);
        assert_eq!(index.list_files(1, false).unwrap().len(), 1);
        assert_eq!(index.list_items(1, false).unwrap().len(), 2);
        assert_eq!(index.files_count(), 4);
    }

    #[test]
    fn path_stack_stops_at_requested_folder() {
        let index = sample();
        let stack: Vec<_> = index.resolve_path_stack(3, ROOT_ID).unwrap().iter().map(|f| f.id).collect();
        assert_eq!(stack, [3, 2, 1]);
        let stack: Vec<_> = index.resolve_path_stack(3, 2).unwrap().iter().map(|f| f.id).collect();
        assert_eq!(stack, [3, 2]);
        assert!(index.resolve_path_stack(ROOT_ID, ROOT_ID).unwrap().is_empty());
    }

    #[test]
    fn paths_join_names() {
        let index = sample();
        let deep = index.get_file(11).unwrap();
        assert_eq!(index.full_path(deep).unwrap(), PathBuf::from("a/b/c/in_c.bin"));
        assert_eq!(index.resolve_path(deep, 2).unwrap(), PathBuf::from("b/c/in_c.bin"));
        let b = index.get_folder(2).unwrap();
        assert_eq!(index.resolve_path(b, 2).unwrap(), PathBuf::from("b"));
        assert_eq!(index.full_path(b).unwrap(), PathBuf::from("a/b"));
        assert_eq!(deep.extension(), Some("bin"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = PackageIndex::new(vec![PzFolder::new("a", 1, ROOT_ID)], vec![file("x", 1, ROOT_ID)]);
        assert_eq!(err.unwrap_err(), IndexError::DuplicateId { id: 1 });
    }

    #[test]
    fn cyclic_parents_do_not_hang() {
        let index = PackageIndex::new(
            vec![PzFolder::new("x", 1, 2), PzFolder::new("y", 2, 1)],
            vec![],
        )
        .unwrap();
        assert!(matches!(
            index.resolve_path_stack(1, ROOT_ID),
            Err(IndexError::InvalidOperation(_))
        ));
        assert!(index.list_folders(ROOT_ID, true).unwrap().is_empty());
    }
}
