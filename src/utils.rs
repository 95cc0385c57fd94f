//! State-directory helpers.
//!
//! The daemon keeps its audit log under a state directory: `/var/lib/pvefw`
//! when running as root, the XDG state directory otherwise (development and
//! test runs). Directories are created with owner-only permissions.

use std::path::PathBuf;

use directories::ProjectDirs;

/// Returns the state directory.
///
/// # Test Override
///
/// Set `PVEFW_TEST_STATE_DIR` to redirect state into a scratch directory.
pub fn get_state_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("PVEFW_TEST_STATE_DIR") {
        return Some(PathBuf::from(dir));
    }
    if nix::unistd::geteuid().is_root() {
        return Some(PathBuf::from("/var/lib/pvefw"));
    }
    ProjectDirs::from("com", "pvefw", "pvefw")
        .and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

/// Creates the state directory with restrictive permissions.
pub fn ensure_dirs() -> std::io::Result<()> {
    let Some(dir) = get_state_dir() else {
        return Ok(());
    };

    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700);
        builder.recursive(true);
        builder.create(dir)?;
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)?;
    }

    Ok(())
}
