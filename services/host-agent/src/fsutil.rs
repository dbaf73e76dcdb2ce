//! Small filesystem helpers shared by the agent.

use std::io::{self, Write};
use std::path::Path;

/// Create or truncate `path` with permission bits `mode` and write `body`.
///
/// `mode` only applies when the file is created, and only on Unix.
pub fn write_file_mode(path: &Path, body: &[u8], mode: u32) -> io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = options.open(path)?;
    file.write_all(body)?;
    file.sync_all()
}

/// `create_dir_all` that treats an existing directory as success.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    match std::fs::create_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        other => other,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_write_file_mode() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("secret");
        write_file_mode(&path, b"hunter22", 0o600).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(std::fs::read(&path).unwrap(), b"hunter22");
    }
}
