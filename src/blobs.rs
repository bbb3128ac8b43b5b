use futures_util::{Stream, StreamExt as _};
use std::fmt::Display;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("upload exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("blob not found")]
    NotFound,
    #[error("upload stream failed: {0}")]
    Stream(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A blob opened for reading.
#[derive(Debug)]
pub struct OpenBlob {
    pub file: std::fs::File,
    pub path: PathBuf,
}

/// File bodies on local disk, one file per id directly under `root`.
///
/// Only ids reach the filesystem. Uploads land in `<id>.part` and are
/// renamed into place once the whole body has been accepted.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    max_size: u64,
}

impl BlobStore {
    pub async fn new<P: AsRef<Path>>(root: P, max_size: u64) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root, max_size })
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn partial_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.part"))
    }

    /// Streams `body` to disk under `id` and returns the number of bytes stored.
    ///
    /// On any failure the partial file is removed and nothing is left under `id`.
    pub async fn write<S, B, E>(&self, id: &str, mut body: S) -> Result<u64, BlobError>
    where
        S: Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: Display,
    {
        let partial = self.partial_path(id);
        let result = match fs::File::create(&partial).await {
            Ok(file) => self.copy_into(file, &mut body).await,
            Err(e) => return Err(e.into()),
        };
        let result = match result {
            Ok(written) => fs::rename(&partial, self.blob_path(id))
                .await
                .map(|_| written)
                .map_err(BlobError::from),
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(e) = remove_if_present(&partial).await {
                log::warn!("could not remove partial upload {}: {e}", partial.display());
            }
        }
        result
    }

    async fn copy_into<S, B, E>(&self, file: fs::File, body: &mut S) -> Result<u64, BlobError>
    where
        S: Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: Display,
    {
        let mut out = BufWriter::new(file);
        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| BlobError::Stream(e.to_string()))?;
            let chunk = chunk.as_ref();
            written += chunk.len() as u64;
            if written > self.max_size {
                return Err(BlobError::TooLarge { limit: self.max_size });
            }
            out.write_all(chunk).await?;
        }
        out.flush().await?;
        out.get_ref().sync_all().await?;
        Ok(written)
    }

    pub async fn open(&self, id: &str) -> Result<OpenBlob, BlobError> {
        let path = self.blob_path(id);
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(BlobError::NotFound),
            Err(e) => return Err(e.into()),
        };
        Ok(OpenBlob {
            file: file.into_std().await,
            path,
        })
    }

    /// Returns whether a file was removed. A missing blob is not an error.
    pub async fn delete(&self, id: &str) -> Result<bool, BlobError> {
        Ok(remove_if_present(&self.blob_path(id)).await?)
    }

    /// Removes `*.part` files left by writes that never finished.
    /// Only safe while no upload is running.
    pub async fn remove_partials(&self) -> Result<usize, BlobError> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "part") && entry.file_type().await?.is_file() {
                if remove_if_present(&path).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Ids of every completed blob on disk.
    pub async fn ids(&self) -> Result<Vec<String>, BlobError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if crate::ids::is_well_formed(name) {
                    ids.push(name.to_string());
                }
            }
        }
        Ok(ids)
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
