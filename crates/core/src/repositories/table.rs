//! Sharded YAML tables.
//!
//! Every entity lives in its own directory, sharded on the first four hex characters of its id:
//!
//! ```text
//! <table>/
//!   <s1>/
//!     <s2>/
//!       <id>/
//!         <file>.yaml
//! ```
//!
//! Creating the id directory is the uniqueness check: `insert_new` fails with a conflict when the
//! directory already exists. File writes go through a temporary file and a rename so readers
//! never see a half-written entity.

use crate::{CoreError, CoreResult};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use vault_uuid::ShardableUuid;

#[derive(Debug)]
pub struct Table<T> {
    root: PathBuf,
    file_name: &'static str,
    entity: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Table<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(root: PathBuf, file_name: &'static str, entity: &'static str) -> Self {
        Self {
            root,
            file_name,
            entity,
            _marker: PhantomData,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    fn entity_file(&self, id: &ShardableUuid) -> PathBuf {
        id.sharded_dir(&self.root).join(self.file_name)
    }

    /// Write a new entity. Fails with [`CoreError::Conflict`] if the id is already taken.
    ///
    /// If the write fails after the id directory was created, the directory is removed again. If
    /// that cleanup also fails a [`CoreError::CleanupAfterFailure`] carries both errors.
    pub fn insert_new(&self, id: &ShardableUuid, value: &T) -> CoreResult<()> {
        let dir = id.sharded_dir(&self.root);
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent).map_err(CoreError::StorageDirCreation)?;
        }
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(CoreError::Conflict(format!(
                    "{} {} already exists",
                    self.entity, id
                )));
            }
            Err(e) => return Err(CoreError::StorageDirCreation(e)),
        }

        let result = render(value).and_then(|yaml| write_atomic(&dir.join(self.file_name), &yaml));
        if let Err(error) = result {
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                return Err(CoreError::CleanupAfterFailure {
                    path: dir.display().to_string(),
                    error: Box::new(error),
                    cleanup_error: Box::new(CoreError::FileRemove(cleanup)),
                });
            }
            return Err(error);
        }
        Ok(())
    }

    /// Overwrite an existing entity.
    pub fn replace(&self, id: &ShardableUuid, value: &T) -> CoreResult<()> {
        let path = self.entity_file(id);
        if !path.is_file() {
            return Err(CoreError::not_found(self.entity, id));
        }
        write_atomic(&path, &render(value)?)
    }

    pub fn get(&self, id: &ShardableUuid) -> CoreResult<Option<T>> {
        let path = self.entity_file(id);
        match fs::read_to_string(&path) {
            Ok(contents) => serde_yaml::from_str(&contents)
                .map(Some)
                .map_err(CoreError::YamlDeserialization),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::FileRead(e)),
        }
    }

    /// Like [`get`](Self::get) but a missing entity is [`CoreError::NotFound`].
    pub fn fetch(&self, id: &ShardableUuid) -> CoreResult<T> {
        self.get(id)?
            .ok_or_else(|| CoreError::not_found(self.entity, id))
    }

    pub fn exists(&self, id: &ShardableUuid) -> bool {
        self.entity_file(id).is_file()
    }

    /// Every entity in the table. Files that cannot be read or parsed are logged and skipped.
    pub fn list(&self) -> CoreResult<Vec<T>> {
        let mut out = Vec::new();
        for dir in sharded_entity_dirs(&self.root)? {
            let path = dir.join(self.file_name);
            if !path.is_file() {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(CoreError::FileRead)
                .and_then(|contents| {
                    serde_yaml::from_str::<T>(&contents).map_err(CoreError::YamlDeserialization)
                });
            match parsed {
                Ok(value) => out.push(value),
                Err(e) => {
                    tracing::warn!("skipping unreadable {}: {} - {}", self.entity, path.display(), e);
                }
            }
        }
        Ok(out)
    }

    pub fn count(&self) -> CoreResult<usize> {
        Ok(sharded_entity_dirs(&self.root)?
            .into_iter()
            .filter(|dir| dir.join(self.file_name).is_file())
            .count())
    }

    /// Remove an entity and prune the shard directories it leaves empty.
    ///
    /// Returns `false` when there was nothing to remove.
    pub fn remove(&self, id: &ShardableUuid) -> CoreResult<bool> {
        let dir = id.sharded_dir(&self.root);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CoreError::FileRemove(e)),
        }
        // s2 then s1; remove_dir only succeeds on empty directories
        let mut parent = dir.parent();
        for _ in 0..2 {
            match parent {
                Some(p) if p != self.root && fs::remove_dir(p).is_ok() => parent = p.parent(),
                _ => break,
            }
        }
        Ok(true)
    }
}

fn render<T: Serialize>(value: &T) -> CoreResult<String> {
    serde_yaml::to_string(value).map_err(CoreError::YamlSerialization)
}

/// Write `contents` to a sibling temp file and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> CoreResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp, contents).map_err(CoreError::FileWrite)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(CoreError::FileWrite(e));
    }
    Ok(())
}

/// `<root>/<s1>/<s2>/<id>` directories. A missing root is an empty table.
fn sharded_entity_dirs(root: &Path) -> CoreResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for s1 in sorted_subdirs(root)? {
        for s2 in sorted_subdirs(&s1)? {
            dirs.extend(sorted_subdirs(&s2)?);
        }
    }
    Ok(dirs)
}

fn sorted_subdirs(dir: &Path) -> CoreResult<Vec<PathBuf>> {
    let iter = match fs::read_dir(dir) {
        Ok(it) => it,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CoreError::FileRead(e)),
    };
    let mut out: Vec<PathBuf> = iter
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| p.is_dir())
        .collect();
    out.sort();
    Ok(out)
}
