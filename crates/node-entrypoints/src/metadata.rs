use shadow_rs::shadow;
use std::fmt;

shadow!(build);

/// Provenance of the running node binary, captured at compile time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub package: &'static str,
    pub version: &'static str,
    pub branch: &'static str,
    /// Short commit hash, `unknown` when built outside a git checkout
    pub commit: &'static str,
    pub dirty: bool,
    pub built_at: &'static str,
    pub rust_channel: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            package: build::PROJECT_NAME,
            version: build::PKG_VERSION,
            branch: build::BRANCH,
            commit: if build::SHORT_COMMIT.is_empty() {
                "unknown"
            } else {
                build::SHORT_COMMIT
            },
            dirty: !build::GIT_CLEAN,
            built_at: build::BUILD_TIME_2822,
            rust_channel: build::BUILD_RUST_CHANNEL,
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}@{}{})",
            self.package,
            self.version,
            self.branch,
            self.commit,
            if self.dirty { "+dirty" } else { "" }
        )
    }
}

/// Log which build of which node is starting
pub fn log_version_info(app_name: &str) {
    let info = BuildInfo::current();
    tracing::info!("Starting {} - {}", app_name, info);
    tracing::info!("Built {} ({})", info.built_at, info.rust_channel);
}

/// One-line build description, e.g. `fleet-node 0.1.0 (main@1a2b3c4)`
pub fn short_version_info() -> String {
    BuildInfo::current().to_string()
}
