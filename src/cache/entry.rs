//! Cache Entry Types

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cached artifact: opaque bytes plus an optional format tag (e.g. "webp")
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    data: Bytes,
    format: Option<String>,
}

impl CacheEntry {
    /// Create an entry without a format tag
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            format: None,
        }
    }

    /// Create an entry tagged with a format
    pub fn with_format(data: impl Into<Bytes>, format: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            format: Some(format.into()),
        }
    }

    /// Entry payload
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Format tag, if any
    #[inline]
    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    /// Payload size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Consume the entry, returning its payload
    pub fn into_data(self) -> Bytes {
        self.data
    }
}

/// Sidecar record stored next to every filesystem tier data file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Full cache key
    pub key: String,
    /// Name of the data file within the tier root
    pub data_file: String,
    /// Format tag of the entry
    pub format: Option<String>,
    /// Payload size in bytes
    pub size: u64,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// When the entry stops being served (None = never)
    pub expires_at: Option<DateTime<Utc>>,
}

impl EntryMetadata {
    /// Build the sidecar for a freshly written entry
    pub fn new(key: &str, data_file: &str, entry: &CacheEntry, ttl: Option<Duration>) -> Self {
        let created_at = Utc::now();
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| created_at + ttl);

        Self {
            key: key.to_string(),
            data_file: data_file.to_string(),
            format: entry.format().map(str::to_string),
            size: entry.size(),
            created_at,
            expires_at,
        }
    }

    /// Check whether the entry has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Check whether the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}
