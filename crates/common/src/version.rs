//! Build metadata stamped in by `build.rs`.

use std::fmt;

/// Version and provenance of the running binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: String,
    pub git_commit: String,
    pub build_time: String,
    pub build_host: String,
    pub build_features: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildInfo {
    /// Build info for this crate. Prefer the [`build_info!`](crate::build_info)
    /// macro, which reports the calling crate's version.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_commit: env!("BUILD_GIT_COMMIT").to_string(),
            build_time: env!("BUILD_TIMESTAMP").to_string(),
            build_host: env!("BUILD_HOST").to_string(),
            build_features: option_env!("BUILD_FEATURES").unwrap_or("none").to_string(),
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (commit: {}, built: {}, host: {}, features: {})",
            self.version, self.git_commit, self.build_time, self.build_host, self.build_features
        )
    }
}

/// Build info carrying the version of the crate that invokes the macro.
#[macro_export]
macro_rules! build_info {
    () => {
        $crate::version::BuildInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..$crate::version::BuildInfo::new()
        }
    };
}
