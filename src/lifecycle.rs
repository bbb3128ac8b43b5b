use crate::blobs::{BlobError, BlobStore, OpenBlob};
use crate::clock::Clock;
use crate::db::{Db, DbError};
use crate::errors::ApiError;
use crate::ids::{self, IdGenerator};
use crate::models::file::FileEntry;
use crate::sniff;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use futures_util::{stream, Stream, StreamExt as _};
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Candidates tried before allocation is reported as an internal failure.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 8;

#[derive(Error, Debug)]
pub enum DeleteError {
    #[error("removing blob: {0}")]
    Blob(#[from] BlobError),
    #[error("removing metadata: {0}")]
    Meta(#[from] DbError),
}

#[derive(Debug, Clone)]
pub struct Uploaded {
    pub id: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Recovered {
    pub partials: usize,
    pub orphans: usize,
}

#[derive(Debug)]
pub struct Download {
    pub entry: FileEntry,
    pub blob: OpenBlob,
    pub inline: bool,
    checked_at: DateTime<Utc>,
}

impl Download {
    pub fn mime_type(&self) -> &str {
        self.entry.mime_type.as_deref().unwrap_or(sniff::FALLBACK_MIME)
    }

    /// Seconds the response may be cached without outliving the file.
    pub fn max_age_secs(&self) -> i64 {
        (self.entry.expires_at - self.checked_at).num_seconds().max(0)
    }
}

/// Keeps the blob directory and the metadata table in step.
///
/// Writes go blob first, then row; deletes go blob first, then row. A crash
/// mid-delete leaves a row without bytes, which reads treat as absent and
/// the reclaimer removes once it expires. A crash mid-upload leaves a blob
/// without a row, which [`Lifecycle::recover`] removes on the next start.
pub struct Lifecycle {
    db: Db,
    blobs: BlobStore,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    public_url: String,
    in_flight: Mutex<HashSet<String>>,
}

/// Claim on an id for the duration of one upload.
struct Reservation<'a> {
    id: String,
    in_flight: &'a Mutex<HashSet<String>>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.id);
        }
    }
}

// The sniffed prefix is handed back to the blob store ahead of the rest of the body.
enum Piece<B> {
    Head(Vec<u8>),
    Rest(B),
}

impl<B: AsRef<[u8]>> AsRef<[u8]> for Piece<B> {
    fn as_ref(&self) -> &[u8] {
        match self {
            Piece::Head(v) => v,
            Piece::Rest(b) => b.as_ref(),
        }
    }
}

impl Lifecycle {
    pub fn new(
        db: Db,
        blobs: BlobStore,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        retention: Duration,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            blobs,
            ids,
            clock,
            retention,
            public_url: public_url.into().trim_end_matches('/').to_string(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn url_for(&self, id: &str) -> String {
        format!("{}/f/{}", self.public_url, id)
    }

    fn reserve(&self, id: &str) -> Option<Reservation<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(Reservation {
            id: id.to_string(),
            in_flight: &self.in_flight,
        })
    }

    async fn allocate(&self) -> Result<Reservation<'_>, ApiError> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let candidate = self.ids.generate().map_err(|e| {
                log::error!("entropy source failed: {e}");
                ApiError::Internal
            })?;
            let Some(reservation) = self.reserve(&candidate) else {
                log::debug!("id {candidate} is already being uploaded, retrying");
                continue;
            };
            if self.db.exists(&candidate).await? {
                log::debug!("id {candidate} is taken, retrying");
                continue;
            }
            return Ok(reservation);
        }
        log::error!("no free id after {MAX_ALLOCATION_ATTEMPTS} attempts");
        Err(ApiError::Internal)
    }

    /// Stores one upload. Either both the blob and its row exist afterwards,
    /// or neither does.
    pub async fn upload<S, B, E>(&self, filename: &str, body: S) -> Result<Uploaded, ApiError>
    where
        S: Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: Display,
    {
        let reservation = self.allocate().await?;
        let id = reservation.id.as_str();

        // multipart fields panic when polled again after their last chunk
        let mut body = body.fuse();

        let mut prefix = Vec::with_capacity(sniff::SNIFF_LEN);
        while prefix.len() < sniff::SNIFF_LEN {
            match body.next().await {
                Some(Ok(chunk)) => prefix.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => return Err(BlobError::Stream(e.to_string()).into()),
                None => break,
            }
        }
        let window = prefix.len().min(sniff::SNIFF_LEN);
        let mime = sniff::detect(&prefix[..window], filename);

        let head = stream::once(futures_util::future::ready(Ok::<_, E>(Piece::Head(prefix))));
        let rest = body.map(|chunk| chunk.map(Piece::Rest));
        let size = self.blobs.write(id, head.chain(rest)).await?;

        let now = self.clock.now().trunc_subsecs(3);
        let entry = FileEntry {
            id: id.to_string(),
            filename: filename.to_string(),
            size: size as i64,
            mime_type: Some(mime),
            created_at: now,
            expires_at: now + self.retention,
        };
        if let Err(e) = self.db.insert(&entry).await {
            if let Err(undo) = self.blobs.delete(id).await {
                log::error!("could not remove blob {id} after failed insert: {undo}");
            }
            return Err(e.into());
        }

        log::info!(
            "stored {} ({} bytes, {})",
            id,
            size,
            entry.mime_type.as_deref().unwrap_or(sniff::FALLBACK_MIME)
        );
        Ok(Uploaded {
            url: self.url_for(id),
            id: entry.id,
            expires_at: entry.expires_at,
        })
    }

    /// Resolves a live file. Unknown, expired and half-deleted ids are all `NotFound`.
    pub async fn download(&self, id: &str) -> Result<Download, ApiError> {
        if !ids::is_well_formed(id) {
            return Err(ApiError::NotFound);
        }
        let entry = self.db.get(id).await?.ok_or(ApiError::NotFound)?;

        let now = self.clock.now();
        if entry.is_expired_at(now) {
            log::info!("{id} expired at {}, removing on read", entry.expires_at);
            if let Err(e) = self.delete(id).await {
                log::warn!("lazy removal of {id} failed: {e}");
            }
            return Err(ApiError::NotFound);
        }

        let blob = match self.blobs.open(id).await {
            Ok(blob) => blob,
            Err(BlobError::NotFound) => {
                log::warn!("{id} has metadata but no blob");
                return Err(ApiError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };

        let inline = entry
            .mime_type
            .as_deref()
            .is_some_and(sniff::is_previewable);
        Ok(Download {
            entry,
            blob,
            inline,
            checked_at: now,
        })
    }

    /// Startup repair for what a crash can leave behind: unfinished `.part`
    /// files and blobs whose row was never inserted. Must run before the
    /// server accepts uploads, since an in-progress upload looks the same.
    pub async fn recover(&self) -> Result<Recovered, DeleteError> {
        let partials = self.blobs.remove_partials().await?;
        let mut orphans = 0;
        for id in self.blobs.ids().await? {
            if !self.db.exists(&id).await? && self.blobs.delete(&id).await? {
                orphans += 1;
            }
        }
        Ok(Recovered { partials, orphans })
    }

    /// Removes the blob, then the row. Either side already being gone is fine.
    /// The row is kept if the blob cannot be removed so a later sweep can retry.
    pub async fn delete(&self, id: &str) -> Result<(), DeleteError> {
        self.blobs.delete(id).await?;
        self.db.delete(id).await?;
        Ok(())
    }
}
