//! `metricfs warm-index`: pre-build the index cache for the source tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use anyhow::Context;
use metricfs_core::index::{self, IndexError};
use tracing::debug;

use crate::exit_codes::CliFailure;
use crate::flags::{self, CommonArgs};

/// Builds or refreshes the cached index of every record file under the
/// source directory, dispatching across `--index-workers` threads.
pub fn run(common: &CommonArgs) -> Result<(), CliFailure> {
    flags::validate(common, false).map_err(CliFailure::config)?;
    let source_dir = common.source_dir().map_err(CliFailure::config)?;
    let options = common.index_options().map_err(CliFailure::config)?;

    let mut files = Vec::new();
    collect_record_files(source_dir, &mut files)
        .context("failed to walk source directory")
        .map_err(CliFailure::config)?;
    files.sort();

    let queue = Mutex::new(files.into_iter());
    let warmed = AtomicUsize::new(0);
    let first_error: Mutex<Option<IndexError>> = Mutex::new(None);

    let workers = common.index_workers.max(1);
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let next = {
                    let Ok(mut queue) = queue.lock() else {
                        break;
                    };
                    queue.next()
                };
                let Some(path) = next else {
                    break;
                };
                if first_error.lock().map_or(true, |error| error.is_some()) {
                    break;
                }
                match index::build_or_load(&path, &options) {
                    Ok(_) => {
                        debug!(file = %path.display(), "index warmed");
                        warmed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        if let Ok(mut slot) = first_error.lock() {
                            slot.get_or_insert(err);
                        }
                        break;
                    }
                }
            });
        }
    });

    if let Ok(mut slot) = first_error.lock() {
        if let Some(err) = slot.take() {
            return Err(CliFailure::config(err));
        }
    }
    println!("warmed {} jsonl files", warmed.load(Ordering::Relaxed));
    Ok(())
}

/// Collects every `.jsonl` file under `dir`, recursively.
fn collect_record_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_record_files(&path, out)?;
        } else if path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().ends_with(".jsonl"))
        {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_only_record_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.jsonl"), "").expect("a");
        fs::create_dir(dir.path().join("nested")).expect("nested");
        fs::write(dir.path().join("nested/b.jsonl"), "").expect("b");
        fs::write(dir.path().join("nested/c.txt"), "").expect("c");
        fs::write(dir.path().join("d.jsonl.gz"), "").expect("d");

        let mut files = Vec::new();
        collect_record_files(dir.path(), &mut files).expect("walk");
        files.sort();
        assert_eq!(
            files,
            vec![dir.path().join("a.jsonl"), dir.path().join("nested/b.jsonl")]
        );
    }
}
