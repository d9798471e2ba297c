//! Directory-backed metadata store: one JSON document per key.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::debug;

use super::{MetadataError, MetadataStore, Visitor, validate_key};

const DOCUMENT_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

/// Stores documents as `<key>.json` files inside a single directory.
#[derive(Debug)]
pub struct FileStore {
    root: Utf8PathBuf,
    dir: Dir,
}

impl FileStore {
    /// Opens (creating if needed) the store directory.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Io`] when the directory cannot be created or
    /// opened.
    pub fn open(root: impl AsRef<Utf8Path>) -> Result<Self, MetadataError> {
        let path = root.as_ref();
        Dir::create_ambient_dir_all(path, ambient_authority())
            .map_err(|err| io_error(path.as_str(), &err))?;
        let dir = Dir::open_ambient_dir(path, ambient_authority())
            .map_err(|err| io_error(path.as_str(), &err))?;
        Ok(Self {
            root: path.to_path_buf(),
            dir,
        })
    }

    /// Directory holding the documents.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

fn io_error(key: &str, err: &io::Error) -> MetadataError {
    MetadataError::Io {
        key: key.to_owned(),
        message: err.to_string(),
    }
}

fn file_name(key: &str) -> String {
    format!("{key}{DOCUMENT_SUFFIX}")
}

impl MetadataStore for FileStore {
    fn create(&self, key: &str, value: &[u8]) -> Result<(), MetadataError> {
        validate_key(key)?;
        let temp = format!("{key}{TEMP_SUFFIX}");
        self.dir
            .write(&temp, value)
            .map_err(|err| io_error(key, &err))?;
        self.dir
            .rename(&temp, &self.dir, file_name(key))
            .map_err(|err| io_error(key, &err))?;
        debug!(key, root = %self.root, "metadata document written");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, MetadataError> {
        validate_key(key)?;
        match self.dir.read(file_name(key)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(MetadataError::NotFound {
                key: key.to_owned(),
            }),
            Err(err) => Err(io_error(key, &err)),
        }
    }

    fn delete(&self, key: &str) -> Result<(), MetadataError> {
        validate_key(key)?;
        match self.dir.remove_file(file_name(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(key, &err)),
        }
    }

    fn for_all(&self, prefix: &str, visit: &mut Visitor<'_>) -> Result<(), MetadataError> {
        let entries = self.dir.entries().map_err(|err| io_error(prefix, &err))?;
        let mut keys = Vec::new();
        for item in entries {
            let entry = item.map_err(|err| io_error(prefix, &err))?;
            let name = entry.file_name().map_err(|err| io_error(prefix, &err))?;
            if let Some(key) = name.strip_suffix(DOCUMENT_SUFFIX)
                && key.starts_with(prefix)
            {
                keys.push(key.to_owned());
            }
        }
        keys.sort();

        for key in keys {
            let value = match self.get(&key) {
                Ok(value) => value,
                Err(MetadataError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            };
            visit(&key, &value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> FileStore {
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("metadata"))
            .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()));
        FileStore::open(root).unwrap_or_else(|err| panic!("open store: {err}"))
    }

    #[test]
    fn create_get_delete_round_trip() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store(&tmp);

        store.create("snapshot-a", b"{\"id\":\"a\"}").expect("create");
        assert_eq!(store.get("snapshot-a").expect("get"), b"{\"id\":\"a\"}");

        store.delete("snapshot-a").expect("delete");
        assert_eq!(
            store.get("snapshot-a"),
            Err(MetadataError::NotFound {
                key: String::from("snapshot-a")
            })
        );
        store.delete("snapshot-a").expect("deleting twice is fine");
    }

    #[test]
    fn for_all_filters_by_prefix_and_ignores_temp_files() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store(&tmp);
        store.create("snapshot-b", b"2").expect("create b");
        store.create("snapshot-a", b"1").expect("create a");
        store.create("volume-x", b"3").expect("create x");
        std::fs::write(store.root().join("snapshot-c.tmp"), b"partial").expect("temp file");

        let mut seen = Vec::new();
        store
            .for_all("snapshot-", &mut |key, value| {
                seen.push((key.to_owned(), value.to_vec()));
                Ok(())
            })
            .expect("for_all");

        assert_eq!(
            seen,
            vec![
                (String::from("snapshot-a"), b"1".to_vec()),
                (String::from("snapshot-b"), b"2".to_vec()),
            ]
        );
    }

    #[test]
    fn reopening_sees_previous_documents() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        store(&tmp).create("snapshot-a", b"1").expect("create");

        assert_eq!(store(&tmp).get("snapshot-a").expect("get"), b"1");
    }
}
