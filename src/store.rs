use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;
use log::{debug, info};
use serde::Serialize;

/// Name of the single array node under the dataset root.
pub const ARRAY_NODE: &str = "0";
/// File name of zarr node metadata documents.
pub const METADATA_KEY: &str = "zarr.json";
/// File name of the caller-supplied metadata document at the root.
pub const EXTERNAL_METADATA_KEY: &str = "acquire.json";

/// Directory layout of one streamed dataset.
///
/// ```text
/// <root>/zarr.json          group metadata
/// <root>/acquire.json       external metadata, verbatim
/// <root>/0/zarr.json        array metadata
/// <root>/0/c/...            shard files, per the chunk key encoding
/// ```
pub struct ArrayStore {
    root: PathBuf,
}

impl ArrayStore {
    /// Creates the dataset root and array directory.
    ///
    /// An existing root is removed first when `overwrite` is set and is an
    /// error otherwise.
    pub fn create(root: PathBuf, overwrite: bool) -> io::Result<Self> {
        if root.exists() {
            let meta = fs::metadata(&root)?;
            if meta.is_file() {
                return Err(io::Error::new(
                    ErrorKind::Other,
                    "Path exists, but it is a file",
                ));
            }
            if !overwrite {
                return Err(io::Error::new(ErrorKind::AlreadyExists, "Already exists"));
            }
            info!("Replacing existing dataset at {:?}", root);
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(root.join(ARRAY_NODE))?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn array_path(&self) -> PathBuf {
        self.root.join(ARRAY_NODE)
    }

    /// Absolute path of a shard file from its chunk key components.
    pub fn shard_path(&self, components: &[String]) -> PathBuf {
        let mut p = self.array_path();
        for c in components.iter() {
            p.push(c);
        }
        p
    }

    /// Opens a fresh shard file, creating parent directories and taking an
    /// exclusive lock. Each shard is created exactly once per session.
    pub fn create_shard_file(&self, components: &[String]) -> io::Result<File> {
        let path = self.shard_path(components);
        let parent = path.parent().expect("Shard path has no parent");
        fs::create_dir_all(parent)?;

        let f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        f.lock_exclusive()?;
        debug!("Created shard file {:?}", path);
        Ok(f)
    }

    /// Writes a JSON document under the root, pretty-printed.
    pub fn write_json<T: Serialize + ?Sized>(
        &self,
        relpath: &[&str],
        doc: &T,
    ) -> io::Result<()> {
        let mut path = self.root.clone();
        for c in relpath.iter() {
            path.push(c);
        }
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(true)
            .create(true)
            .open(&path)?;
        f.lock_exclusive()?;
        let mut w = BufWriter::new(f);
        serde_json::to_writer_pretty(&mut w, doc)?;
        w.flush()?;
        debug!("Wrote {:?}", path);
        Ok(())
    }
}
