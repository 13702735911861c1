//! Filesystem helpers shared by the on-disk backends

use std::fs;
use std::io::Write;
use std::path::Path;

use rand::Rng;

/// Create the parent directory of `path` if it does not exist, applying
/// `dir_permissions` (octal mode) to newly created directories.
pub(crate) fn ensure_directory(path: &Path, dir_permissions: Option<u32>) -> std::io::Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    if dir.exists() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    if let Some(mode) = dir_permissions {
        std::os::unix::fs::DirBuilderExt::mode(&mut builder, mode);
    }
    match builder.create(dir) {
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

/// Write `data` to a random temp name next to `path` and rename it into
/// place. Rename is atomic on POSIX; readers never observe partial files.
pub(crate) fn write_atomic(
    path: &Path,
    data: &[u8],
    file_permissions: Option<u32>,
) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        "{file_name}.tmp-{:08}",
        rand::thread_rng().gen_range(0..100_000_000u32)
    ));
    let result = (|| {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        apply_permissions(&tmp, file_permissions)?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Apply an octal file mode (Unix only)
pub(crate) fn apply_permissions(path: &Path, mode: Option<u32>) -> std::io::Result<()> {
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// Parse an octal permission string like `"755"`
pub(crate) fn parse_permissions(s: &str) -> Option<u32> {
    u32::from_str_radix(s, 8).ok()
}

/// Append a suffix to a path (`R0000C0000` -> `R0000C0000.bundle`)
pub(crate) fn path_with_suffix(base: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    std::path::PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        write_atomic(&path, b"hello", None).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        // no temp files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_ensure_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/c/file.png");
        ensure_directory(&path, None).unwrap();
        assert!(path.parent().unwrap().is_dir());
        // repeated calls are no-ops
        ensure_directory(&path, None).unwrap();
    }

    #[test]
    fn test_parse_permissions() {
        assert_eq!(parse_permissions("755"), Some(0o755));
        assert_eq!(parse_permissions("nope"), None);
    }
}
