use std::fmt;
use std::str::FromStr;

use semver::Version;
use thiserror::Error;

/// Protocol version of the database host this engine serves.
///
/// The wire format changed several times over the host's history; the engine
/// keys every behavioral branch off this value. Missing components parse as
/// zero, so `--couchdb-version=0.11` means `0.11.0`. When no version is given
/// the engine assumes the newest dialect.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion(Version);

impl ProtocolVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        ProtocolVersion(Version::new(major, minor, patch))
    }

    /// Newest dialect; used when the host does not announce a version.
    pub fn latest() -> Self {
        ProtocolVersion::new(999, 999, 999)
    }

    pub fn at_least(&self, major: u64, minor: u64, patch: u64) -> bool {
        self.0 >= Version::new(major, minor, patch)
    }

    /// 0.11.0 switched error and log envelopes from objects to arrays.
    pub fn array_envelopes(&self) -> bool {
        self.at_least(0, 11, 0)
    }

    /// 0.10.0 introduced streaming `show`/`list`/`update` and dropped the
    /// `show_doc`/`list_begin`/`list_row`/`list_tail` command set.
    pub fn streaming_render(&self) -> bool {
        self.at_least(0, 10, 0)
    }

    /// 0.11.0 moved the render and validation commands under `ddoc`.
    pub fn ddoc_commands(&self) -> bool {
        self.at_least(0, 11, 0)
    }

    /// 0.11.1 stopped passing `userctx` to filter functions.
    pub fn trims_filter_userctx(&self) -> bool {
        self.at_least(0, 11, 1)
    }

    /// 0.11.1 started passing `secobj` to validate functions.
    pub fn passes_secobj(&self) -> bool {
        self.at_least(0, 11, 1)
    }

    /// 1.1.0 added `add_lib` and `require` support inside map functions.
    pub fn view_libs(&self) -> bool {
        self.at_least(1, 1, 0)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::latest()
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid protocol version `{0}`")]
pub struct InvalidVersion(String);

impl FromStr for ProtocolVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u64; 3];
        let mut count = 0;
        for piece in s.split('.') {
            if count == 3 {
                return Err(InvalidVersion(s.to_string()));
            }
            parts[count] = piece
                .trim()
                .parse()
                .map_err(|_| InvalidVersion(s.to_string()))?;
            count += 1;
        }
        Ok(ProtocolVersion::new(parts[0], parts[1], parts[2]))
    }
}
