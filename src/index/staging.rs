//! Mutable index assembled before a pack.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use super::{EntryTable, IndexError, IndexTree, ROOT_ID, ROOT_PID};
use crate::error::{Error, Result};

/// Sequential id source.  `next()` returns `start + 1`, `start + 2`, ...
#[derive(Debug, Clone)]
pub struct IdCounter {
    start: u32,
    count: u32,
}

impl IdCounter {
    pub fn new(start: u32) -> Self {
        Self { start, count: 0 }
    }

    pub fn next(&mut self) -> u32 {
        self.count += 1;
        self.start + self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// Where a staged file's bytes come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Arc<[u8]>),
}

impl FileSource {
    pub fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(match self {
            FileSource::Path(path)  => Box::new(File::open(path)?),
            FileSource::Memory(buf) => Box::new(Cursor::new(&buf[..])),
        })
    }

    fn size(&self) -> Result<u64> {
        match self {
            FileSource::Path(path) => match path.metadata() {
                Ok(meta) if meta.is_file() => Ok(meta.len()),
                _ => Err(Error::SourceNotFound { path: path.clone() }),
            },
            FileSource::Memory(buf) => Ok(buf.len() as u64),
        }
    }
}

impl From<Vec<u8>> for FileSource {
    fn from(bytes: Vec<u8>) -> Self {
        FileSource::Memory(bytes.into())
    }
}

impl From<&Path> for FileSource {
    fn from(path: &Path) -> Self {
        FileSource::Path(path.to_path_buf())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFolder {
    pub name: String,
    pub id:   u32,
    pub pid:  u32,
}

#[derive(Debug, Clone)]
pub struct StagedFile {
    pub name:   String,
    pub id:     u32,
    pub pid:    u32,
    pub source: FileSource,
    /// Source length when it was staged.
    pub size:   u64,
}

// ── StagingIndex ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StagingIndex {
    root:    StagedFolder,
    folders: EntryTable<StagedFolder>,
    files:   EntryTable<StagedFile>,
    ids:     IdCounter,
}

impl Default for StagingIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexTree for StagingIndex {
    type Folder = StagedFolder;
    type File   = StagedFile;

    fn root(&self) -> &StagedFolder {
        &self.root
    }

    fn folder_table(&self) -> &EntryTable<StagedFolder> {
        &self.folders
    }

    fn file_table(&self) -> &EntryTable<StagedFile> {
        &self.files
    }
}

impl StagingIndex {
    pub fn new() -> Self {
        Self {
            root:    StagedFolder { name: String::new(), id: ROOT_ID, pid: ROOT_PID },
            folders: EntryTable::default(),
            files:   EntryTable::default(),
            ids:     IdCounter::new(ROOT_ID + 1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn sum_files_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    fn check_file_name(&self, name: &str, parent: u32) -> std::result::Result<(), IndexError> {
        if name.trim().is_empty() {
            return Err(IndexError::EmptyName);
        }
        if self.files.iter().any(|f| f.pid == parent && f.name == name) {
            return Err(IndexError::DuplicateName { name: name.to_owned(), parent });
        }
        Ok(())
    }

    fn check_folder_name(&self, name: &str, parent: u32) -> std::result::Result<(), IndexError> {
        if name.trim().is_empty() {
            return Err(IndexError::EmptyName);
        }
        if self.folders.iter().any(|f| f.pid == parent && f.name == name) {
            return Err(IndexError::DuplicateName { name: name.to_owned(), parent });
        }
        Ok(())
    }

    fn reject_root(id: u32, action: &str) -> std::result::Result<(), IndexError> {
        if id == ROOT_ID {
            return Err(IndexError::InvalidOperation(format!("cannot {action} the root folder")));
        }
        Ok(())
    }

    // ── Files ───────────────────────────────────────────────────────────────

    /// Stage `source` as `name` inside `parent`.  Returns the new file id.
    pub fn add_file(&mut self, source: FileSource, name: &str, parent: u32) -> Result<u32> {
        let size = source.size()?;
        self.get_folder(parent)?;
        self.check_file_name(name, parent)?;

        let id = self.ids.next();
        self.files.insert(StagedFile { name: name.to_owned(), id, pid: parent, source, size })?;
        Ok(id)
    }

    pub fn rename_file(&mut self, id: u32, new_name: &str) -> Result<()> {
        let file = self.get_file(id)?;
        if file.name == new_name {
            return Ok(());
        }
        let parent = file.pid;
        self.check_file_name(new_name, parent)?;
        if let Some(file) = self.files.get_mut(id) {
            file.name = new_name.to_owned();
        }
        Ok(())
    }

    pub fn move_file(&mut self, id: u32, to_folder: u32) -> Result<()> {
        let file = self.get_file(id)?;
        if file.pid == to_folder {
            return Ok(());
        }
        let name = file.name.clone();
        self.get_folder(to_folder)?;
        self.check_file_name(&name, to_folder)?;
        if let Some(file) = self.files.get_mut(id) {
            file.pid = to_folder;
        }
        Ok(())
    }

    pub fn remove_file(&mut self, id: u32) -> Result<StagedFile> {
        self.get_file(id)?;
        let removed = self.files.remove_many(&HashSet::from([id]));
        removed.into_iter().next().ok_or_else(|| IndexError::FileNotFound { id }.into())
    }

    // ── Folders ─────────────────────────────────────────────────────────────

    pub fn add_folder(&mut self, name: &str, parent: u32) -> Result<u32> {
        self.get_folder(parent)?;
        self.check_folder_name(name, parent)?;

        let id = self.ids.next();
        self.folders.insert(StagedFolder { name: name.to_owned(), id, pid: parent })?;
        Ok(id)
    }

    pub fn rename_folder(&mut self, id: u32, new_name: &str) -> Result<()> {
        Self::reject_root(id, "rename")?;
        let folder = self.get_folder(id)?;
        if folder.name == new_name {
            return Ok(());
        }
        let parent = folder.pid;
        self.check_folder_name(new_name, parent)?;
        if let Some(folder) = self.folders.get_mut(id) {
            folder.name = new_name.to_owned();
        }
        Ok(())
    }

    /// Re-parent `id` under `to_folder`.  Moving a folder into itself or one
    /// of its descendants is refused.
    pub fn move_folder(&mut self, id: u32, to_folder: u32) -> Result<()> {
        Self::reject_root(id, "move")?;
        let folder = self.get_folder(id)?;
        if folder.pid == to_folder {
            return Ok(());
        }
        let name = folder.name.clone();
        if self.resolve_path_stack(to_folder, ROOT_ID)?.iter().any(|f| f.id == id) {
            return Err(IndexError::InvalidOperation(format!(
                "cannot move folder {id} into its own subtree"
            )).into());
        }
        self.check_folder_name(&name, to_folder)?;
        if let Some(folder) = self.folders.get_mut(id) {
            folder.pid = to_folder;
        }
        Ok(())
    }

    /// Remove `id` with every descendant folder and file.
    pub fn remove_folder(&mut self, id: u32) -> Result<()> {
        Self::reject_root(id, "remove")?;
        self.get_folder(id)?;

        let file_ids: HashSet<u32> = self.list_files(id, true)?.iter().map(|f| f.id).collect();
        let mut folder_ids: HashSet<u32> = self.list_folders(id, true)?.iter().map(|f| f.id).collect();
        folder_ids.insert(id);

        self.files.remove_many(&file_ids);
        self.folders.remove_many(&folder_ids);
        Ok(())
    }

    // ── Directories ─────────────────────────────────────────────────────────

    /// Stage directory `path` as a new folder under `parent`, with its whole
    /// subtree.  Entries are added in file-name order.  Returns the folder id.
    pub fn add_directory(&mut self, path: &Path, parent: u32) -> Result<u32> {
        if !path.is_dir() {
            return Err(Error::SourceNotFound { path: path.to_path_buf() });
        }
        let name = dir_name(path);
        let folder = self.add_folder(&name, parent)?;
        self.add_directory_contents(path, folder)?;
        Ok(folder)
    }

    /// Stage everything inside `path` directly under `parent`.
    pub fn add_directory_contents(&mut self, path: &Path, parent: u32) -> Result<()> {
        if !path.is_dir() {
            return Err(Error::SourceNotFound { path: path.to_path_buf() });
        }
        self.get_folder(parent)?;

        let mut folder_ids: HashMap<PathBuf, u32> = HashMap::from([(path.to_path_buf(), parent)]);
        for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let pid = entry
                .path()
                .parent()
                .and_then(|p| folder_ids.get(p).copied())
                .ok_or_else(|| Error::SourceNotFound { path: entry.path().to_path_buf() })?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if entry.file_type().is_dir() {
                let id = self.add_folder(&name, pid)?;
                folder_ids.insert(entry.path().to_path_buf(), id);
            } else if entry.file_type().is_file() {
                self.add_file(FileSource::Path(entry.path().to_path_buf()), &name, pid)?;
            }
        }
        log::debug!("staged {} files from {}", self.files.len(), path.display());
        Ok(())
    }

    /// Drop all entries; ids keep counting.
    pub fn clear(&mut self) {
        self.folders.clear();
        self.files.clear();
    }

    /// Drop all entries and restart ids.
    pub fn reset(&mut self) {
        self.clear();
        self.ids.reset();
    }
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mem(bytes: &[u8]) -> FileSource {
        FileSource::from(bytes.to_vec())
    }

    #[test]
    fn ids_start_above_root() {
        let mut index = StagingIndex::new();
        let a = index.add_folder("a", ROOT_ID).unwrap();
        let f = index.add_file(mem(b"x"), "f", a).unwrap();
        assert_eq!(a, ROOT_ID + 2);
        assert_eq!(f, ROOT_ID + 3);
        index.reset();
        assert_eq!(index.add_folder("a", ROOT_ID).unwrap(), ROOT_ID + 2);
    }

    #[test]
    fn sibling_names_must_be_unique_per_kind() {
        let mut index = StagingIndex::new();
        index.add_file(mem(b"1"), "same", ROOT_ID).unwrap();
        // A folder may share a file's name.
        index.add_folder("same", ROOT_ID).unwrap();

        let err = index.add_file(mem(b"2"), "same", ROOT_ID).unwrap_err();
        assert!(matches!(err, Error::Index(IndexError::DuplicateName { ref name, parent }) if name == "same" && parent == ROOT_ID));
        assert!(matches!(
            index.add_folder("same", ROOT_ID),
            Err(Error::Index(IndexError::DuplicateName { .. }))
        ));
        assert!(matches!(index.add_folder("  ", ROOT_ID), Err(Error::Index(IndexError::EmptyName))));
    }

    #[test]
    fn root_cannot_be_mutated() {
        let mut index = StagingIndex::new();
        let a = index.add_folder("a", ROOT_ID).unwrap();
        for result in [
            index.rename_folder(ROOT_ID, "x"),
            index.move_folder(ROOT_ID, a),
            index.remove_folder(ROOT_ID),
        ] {
            assert!(matches!(result, Err(Error::Index(IndexError::InvalidOperation(_)))));
        }
    }

    #[test]
    fn remove_folder_is_recursive() {
        let mut index = StagingIndex::new();
        let a = index.add_folder("a", ROOT_ID).unwrap();
        let b = index.add_folder("b", a).unwrap();
        index.add_file(mem(b"1"), "one", a).unwrap();
        index.add_file(mem(b"2"), "two", b).unwrap();
        let keep = index.add_file(mem(b"3"), "three", ROOT_ID).unwrap();

        index.remove_folder(a).unwrap();
        assert_eq!(index.all_folders().len(), 0);
        assert_eq!(index.all_files().len(), 1);
        assert_eq!(index.all_files()[0].id, keep);
        assert!(index.get_folder(b).is_err());
    }

    #[test]
    fn move_and_rename() {
        let mut index = StagingIndex::new();
        let a = index.add_folder("a", ROOT_ID).unwrap();
        let b = index.add_folder("b", a).unwrap();
        let f = index.add_file(mem(b"1"), "f", ROOT_ID).unwrap();

        index.move_file(f, b).unwrap();
        assert_eq!(index.full_path(index.get_file(f).unwrap()).unwrap(), PathBuf::from("a/b/f"));

        index.rename_folder(a, "z").unwrap();
        assert_eq!(index.full_path(index.get_file(f).unwrap()).unwrap(), PathBuf::from("z/b/f"));

        assert!(matches!(
            index.move_folder(a, b),
            Err(Error::Index(IndexError::InvalidOperation(_)))
        ));
        index.move_folder(b, ROOT_ID).unwrap();
        assert_eq!(index.get_folder(b).unwrap().pid, ROOT_ID);

        index.add_file(mem(b"2"), "g", b).unwrap();
        assert!(matches!(index.rename_file(f, "g"), Err(Error::Index(IndexError::DuplicateName { .. }))));
        index.rename_file(f, "h").unwrap();
        assert_eq!(index.remove_file(f).unwrap().name, "h");
    }

    #[test]
    fn missing_source_is_reported() {
        let mut index = StagingIndex::new();
        let path = PathBuf::from("/definitely/not/here.bin");
        assert!(matches!(
            index.add_file(FileSource::Path(path), "x", ROOT_ID),
            Err(Error::SourceNotFound { .. })
        ));
    }

    #[test]
    fn directory_is_staged_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bbb").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("sub").join("c.txt"), b"cc").unwrap();

        let mut index = StagingIndex::new();
        let top = index.add_directory(dir.path(), ROOT_ID).unwrap();
        let names: Vec<_> = index.list_files(top, false).unwrap().iter().map(|f| f.name.clone()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
        assert_eq!(index.list_files(top, true).unwrap().len(), 3);
        assert_eq!(index.sum_files_size(), 6);
        let sub = index.list_folders(top, false).unwrap()[0].id;
        assert_eq!(index.resolve_path(index.list_files(sub, false).unwrap()[0], top).unwrap(),
                   PathBuf::from(dir_name(dir.path())).join("sub").join("c.txt"));
    }

    proptest! {
        #[test]
        fn random_mutations_keep_tree_invariants(ops in proptest::collection::vec((0u8..5, 0usize..8, 0u8..4), 1..60)) {
            let mut index = StagingIndex::new();
            for (op, pick, name) in ops {
                let folders: Vec<u32> = std::iter::once(ROOT_ID)
                    .chain(index.all_folders().iter().map(|f| f.id))
                    .collect();
                let target = folders[pick % folders.len()];
                let name = format!("n{name}");
                let _ = match op {
                    0 => index.add_folder(&name, target).map(|_| ()),
                    1 => index.add_file(mem(b"x"), &name, target).map(|_| ()),
                    2 => index.remove_folder(target),
                    3 => {
                        let other = folders[(pick + 1) % folders.len()];
                        index.move_folder(target, other)
                    }
                    _ => index.rename_folder(target, &name),
                };

                // Every parent exists, the chain reaches the root, siblings are unique.
                let mut seen = HashSet::new();
                for f in index.all_folders() {
                    prop_assert!(index.resolve_path_stack(f.id, ROOT_ID).is_ok());
                    prop_assert!(seen.insert((f.pid, f.name.clone())));
                }
                let mut seen = HashSet::new();
                for f in index.all_files() {
                    prop_assert!(index.get_folder(f.pid).is_ok());
                    prop_assert!(seen.insert((f.pid, f.name.clone())));
                }
            }
        }
    }
}
