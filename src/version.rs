//! Version and build information embedded by `build.rs`

use std::fmt;

/// Build information embedded at compile time
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: &'static str,
    pub name: &'static str,
    /// Short git commit hash
    pub git_hash: &'static str,
    pub git_branch: &'static str,
    /// "true", "false" or "unknown"
    git_dirty: &'static str,
    pub build_timestamp: &'static str,
    /// Target triple
    pub target: &'static str,
    /// debug / release
    pub profile: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            name: env!("CARGO_PKG_NAME"),
            git_hash: env!("COLLAB_GIT_HASH"),
            git_branch: env!("COLLAB_GIT_BRANCH"),
            git_dirty: env!("COLLAB_GIT_DIRTY"),
            build_timestamp: env!("COLLAB_BUILD_TIMESTAMP"),
            target: env!("COLLAB_TARGET"),
            profile: env!("COLLAB_PROFILE"),
            rustc_version: env!("COLLAB_RUSTC_VERSION"),
        }
    }

    pub fn git_dirty(&self) -> bool {
        self.git_dirty == "true"
    }

    /// Version plus git hash, e.g. "0.1.0-abc12345"
    pub fn full_version(&self) -> String {
        let dirty = if self.git_dirty() { "-dirty" } else { "" };
        format!("{}-{}{}", self.version, self.git_hash, dirty)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "  Version:    {}", self.version)?;
        writeln!(f, "  Git Hash:   {}", self.git_hash)?;
        writeln!(f, "  Git Branch: {}", self.git_branch)?;
        writeln!(f, "  Built:      {}", self.build_timestamp)?;
        writeln!(f, "  Profile:    {}", self.profile)?;
        writeln!(f, "  Target:     {}", self.target)?;
        writeln!(f, "  Compiler:   {}", self.rustc_version)
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

/// Print version information to stdout
pub fn print_version() {
    print!("{}", build_info());
}
