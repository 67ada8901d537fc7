use anyhow::{Context, Result};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::unistd::geteuid;
use preupgrade_config::ResourceLimits;
use preupgrade_domain::CommandError;

pub const ROOT_REQUIRED_MESSAGE: &str = "This command has to be run under the root user.";

/// Host primitives the run depends on.
pub trait HostGuard {
    #[allow(clippy::missing_errors_doc)]
    fn require_full_privilege(&self) -> Result<(), CommandError>;

    #[allow(clippy::missing_errors_doc)]
    fn apply_resource_limits(&self, limits: &ResourceLimits) -> Result<()>;
}

/// [`HostGuard`] backed by the running process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessHostGuard;

impl HostGuard for ProcessHostGuard {
    fn require_full_privilege(&self) -> Result<(), CommandError> {
        if geteuid().is_root() {
            Ok(())
        } else {
            Err(CommandError::Privilege(ROOT_REQUIRED_MESSAGE.to_string()))
        }
    }

    fn apply_resource_limits(&self, limits: &ResourceLimits) -> Result<()> {
        let (_, hard) = getrlimit(Resource::RLIMIT_NOFILE).context("failed to read RLIMIT_NOFILE")?;
        let open_files = limits.max_open_files;
        setrlimit(Resource::RLIMIT_NOFILE, open_files, hard.max(open_files))
            .with_context(|| format!("failed to raise RLIMIT_NOFILE to {open_files}"))?;

        let file_size = limits.max_file_size.unwrap_or(nix::libc::RLIM_INFINITY);
        setrlimit(Resource::RLIMIT_FSIZE, file_size, file_size)
            .with_context(|| format!("failed to set RLIMIT_FSIZE to {file_size}"))?;
        tracing::debug!(open_files, file_size, "resource limits applied");
        Ok(())
    }
}
