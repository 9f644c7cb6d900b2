//! `metricfs stats`: file and byte totals for a mounted tree.

use std::fs;
use std::io;
use std::path::Path;

use anyhow::Context;

use crate::exit_codes::CliFailure;

/// Walks the mounted tree and prints `files=N bytes=M`.
pub fn run(mount: &Path) -> Result<(), CliFailure> {
    let mut files = 0_u64;
    let mut bytes = 0_u64;
    walk(mount, &mut files, &mut bytes)
        .with_context(|| format!("failed to walk {}", mount.display()))
        .map_err(CliFailure::config)?;
    println!("files={files} bytes={bytes}");
    Ok(())
}

fn walk(dir: &Path, files: &mut u64, bytes: &mut u64) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            walk(&entry.path(), files, bytes)?;
        } else {
            *files += 1;
            *bytes += entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_counts_files_and_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a"), "12345").expect("a");
        fs::create_dir(dir.path().join("nested")).expect("nested");
        fs::write(dir.path().join("nested/b"), "123").expect("b");

        let mut files = 0;
        let mut bytes = 0;
        walk(dir.path(), &mut files, &mut bytes).expect("walk");
        assert_eq!(files, 2);
        assert_eq!(bytes, 8);
    }
}
