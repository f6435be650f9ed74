use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use super::{Marker, Persistence};
use crate::collection::{Collection, CollectionName};
use crate::error::{Result, StoreError};

/// The primary [`Persistence`] implementation.
///
/// Every collection lives in its own pretty-printed JSON file inside the "data dir", which is
/// given as a parameter when first opening the store. Writes go to a temporary file in the
/// same directory which is then renamed over the real file, so a crash mid-write never leaves
/// a truncated document visible under the real name.
#[derive(Debug, Clone)]
pub struct FileStore {
    // path to the directory containing the collection files
    dir: PathBuf,
}

impl FileStore {
    /// creates a [`FileStore`] using the given `dir` as the directory where collections will
    /// be kept. If the `dir` does not exist it will be created.
    #[instrument(skip(dir))]
    pub fn open(dir: impl Into<PathBuf>) -> Result<FileStore> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("opened collection store at {:?}", &dir);
        Ok(FileStore { dir })
    }

    /// the directory holding the collection files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// builds the path of the file holding collection `name`
    fn path(&self, name: CollectionName) -> PathBuf {
        self.dir.join(name.file_name())
    }

    /// saves `collection`, calling `before_commit` with the temp file path after the new
    /// content is fully written but before it is renamed into place
    pub(crate) fn save_with<F>(
        &self,
        name: CollectionName,
        collection: &Collection,
        before_commit: F,
    ) -> Result<()>
    where
        F: FnOnce(&Path) -> io::Result<()>,
    {
        let bytes = serde_json::to_vec_pretty(collection)?;
        write_atomic_with(&self.path(name), &bytes, before_commit)?;
        debug!("saved {} ({} bytes)", name, bytes.len());
        Ok(())
    }
}

impl Persistence for FileStore {
    fn load(&self, name: CollectionName) -> Result<Collection> {
        let path = self.path(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{:?} doesn't exist, starting empty", &path);
                return Ok(Collection::new());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice::<Collection>(&bytes).map_err(|source| StoreError::MalformedContent {
            name: path.display().to_string(),
            source,
        })
    }

    fn save(&self, name: CollectionName, collection: &Collection) -> Result<()> {
        self.save_with(name, collection, |_| Ok(()))
    }

    fn marker(&self, name: CollectionName) -> Marker {
        fs::metadata(self.path(name))
            .and_then(|meta| meta.modified())
            .ok()
    }
}

/// Atomically replaces the file at `path` with `bytes`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    write_atomic_with(path, bytes, |_| Ok(()))
}

/// Writes `bytes` into a temp file next to `path`, syncs it, runs `before_commit` and finally
/// renames the temp file over `path`.
///
/// The temp file is removed if any step fails, the previous content of `path` is untouched.
fn write_atomic_with<F>(path: &Path, bytes: &[u8], before_commit: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    // dropping the NamedTempFile on any early return deletes it
    let mut tmp = tempfile::Builder::new()
        .prefix(".predstore")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    before_commit(tmp.path())?;

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
