//! Small shared helpers.

use std::io::Write;
use std::path::Path;

use crate::error::AgentResult;

/// Write a file atomically: temp file in the same directory, fsync, rename.
///
/// Readers never observe a partially written file, and a crash mid-write
/// leaves the previous version intact.
pub fn atomic_write(path: &Path, data: &[u8]) -> AgentResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        // No temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }
}
