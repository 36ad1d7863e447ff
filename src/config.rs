use std::fmt;
use regex::Regex;

use crate::conflict::ConflictPolicy;
use crate::retry::RetryPolicy;

/// Matches the temporary files downloads are written to before being renamed into place.
pub const PARTIAL_DOWNLOAD_PATTERN: &str = r"(^|/)\.s3ftp-[^/]*\.part$";

/// The configuration for the sync business.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub ignore: Ignore,
    /// Stream both copies and compare bytes when sizes match but the baseline can't settle it.
    /// When off, equal sizes count as a match only for entries with no baseline; a
    /// file edited on both sides since the last pass is always a conflict.
    pub compare_file_contents: bool,
    pub conflict_policy: ConflictPolicy,
    /// Upper bound on concurrent copies and comparisons.
    pub parallelism: usize,
    /// Once more operations than this have failed, no new ones are started.
    pub max_failures: usize,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            ignore: Ignore::default(),
            compare_file_contents: true,
            conflict_policy: ConflictPolicy::default(),
            parallelism: 4,
            max_failures: 16,
            retry: RetryPolicy::default(),
        }
    }
}

/// Determines which files should be ignored when detecting updates.
#[derive(Debug, Clone)]
pub struct Ignore {
    pub regexes: Vec<Regex>,
    /// Key prefixes, matched on whole path components.
    pub paths: Vec<String>,
}

impl Ignore {
    /// An `Ignore` struct that ignores nothing
    pub fn nothing() -> Self {
        Ignore {
            regexes: Vec::new(),
            paths: Vec::new(),
        }
    }

    /// checks if the key is on the ignore list
    pub fn is_ignored(&self, key: &str) -> bool {
        for path in &self.paths {
            let path = path.trim_matches('/');
            if key == path || (key.starts_with(path) && key[path.len()..].starts_with('/')) {
                return true;
            }
        }
        self.regexes.iter().any(|regex| regex.is_match(key))
    }
}

impl Default for Ignore {
    /// Ignores this crate's own partial downloads.
    fn default() -> Self {
        let mut ignore = Ignore::nothing();
        if let Ok(regex) = Regex::new(PARTIAL_DOWNLOAD_PATTERN) {
            ignore.regexes.push(regex);
        }
        ignore
    }
}

/// Where the bucket lives and how to authenticate against it.
#[derive(Clone, Default)]
pub struct RemoteConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Only keys beneath this prefix are synchronized.
    pub prefix: Option<String>,
    pub allow_http: bool,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("prefix", &self.prefix)
            .field("allow_http", &self.allow_http)
            .finish()
    }
}
