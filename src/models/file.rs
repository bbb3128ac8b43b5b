use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored upload. `filename` is the client's name, kept for display only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: String,
    pub filename: String,
    pub size: i64,
    pub mime_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
