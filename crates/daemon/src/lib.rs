pub mod cli;
pub mod fuse;
pub mod identity;
pub mod logging;
pub mod process;

/// Daemon-specific build info that uses the daemon's BUILD_FEATURES.
///
/// `common::version::BuildInfo::new()` reads BUILD_FEATURES from common's
/// compile environment, not this crate's.
pub fn build_info() -> common::version::BuildInfo {
    let mut info = common::build_info!();
    info.build_features = option_env!("BUILD_FEATURES").unwrap_or("none").to_string();
    info
}
