pub mod resolve;

use std::fmt;
use std::str::FromStr;
use serde::Serialize;

use crate::archive::BaselineEntry;
use crate::state::EntryState;

/// How conflicting edits are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Keep both versions; the local one moves aside under a conflict name.
    #[default]
    PreserveBoth,
    /// The side modified most recently wins. Ties keep both.
    NewestWins,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ConflictPolicy::PreserveBoth => "preserve-both",
            ConflictPolicy::NewestWins => "newest-wins",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "preserve-both" | "preserve_both" => Ok(ConflictPolicy::PreserveBoth),
            "newest-wins" | "newest_wins" => Ok(ConflictPolicy::NewestWins),
            _ => Err(format!("invalid conflict policy: {} (expected preserve-both or newest-wins)", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// The local entry was renamed and both versions propagated.
    KeepBoth { renamed_to: String },
    UseLocal,
    UseRemote,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Resolution::KeepBoth { ref renamed_to } => write!(f, "kept both (local copy at {})", renamed_to),
            Resolution::UseLocal => f.write_str("local version kept"),
            Resolution::UseRemote => f.write_str("remote version kept"),
        }
    }
}

/// A path that changed on both sides since the last pass, and what was done about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub path: String,
    pub baseline: Option<BaselineEntry>,
    pub local: Option<EntryState>,
    pub remote: Option<EntryState>,
    pub resolution: Resolution,
}

/// `docs/report.txt` becomes `docs/report.conflict-<tag>.txt`.
pub fn conflict_path(path: &str, tag: &str) -> String {
    let (parent, name) = match path.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, path),
    };
    let renamed = match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}.conflict-{}{}", &name[..dot], tag, &name[dot..]),
        _ => format!("{}.conflict-{}", name, tag),
    };
    match parent {
        Some(parent) => format!("{}/{}", parent, renamed),
        None => renamed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_names_keep_the_extension() {
        assert_eq!(conflict_path("report.txt", "20240101T000000Z"), "report.conflict-20240101T000000Z.txt");
        assert_eq!(conflict_path("a/b/archive.tar.gz", "T"), "a/b/archive.tar.conflict-T.gz");
        assert_eq!(conflict_path("Makefile", "T"), "Makefile.conflict-T");
        assert_eq!(conflict_path("dir/.profile", "T"), "dir/.profile.conflict-T");
    }

    #[test]
    fn policies_parse() {
        assert_eq!("newest-wins".parse::<ConflictPolicy>(), Ok(ConflictPolicy::NewestWins));
        assert_eq!("Preserve-Both".parse::<ConflictPolicy>(), Ok(ConflictPolicy::PreserveBoth));
        assert!("remote-wins".parse::<ConflictPolicy>().is_err());
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::PreserveBoth);
    }
}
