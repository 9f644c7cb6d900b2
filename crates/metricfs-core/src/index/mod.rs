//! Per-file line index: memoized mapping results and visibility filtering.
//!
//! A [`FileIndex`] records, for every physical line of a plain record
//! file, its byte range, the effective decision mode, and the candidate
//! keys derived from the record. Indexes are persisted to a
//! content-addressed cache keyed by
//! `format_version|path|size|mtime_nanos|rule_hash`, so any change to the
//! source bytes or the effective rule set supersedes the cached index.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::authz::{Authorizer, CandidateKey};
use crate::mapper::{
    self, Decision, MapperConfig, MapperError, MissingKeyMode, MissingMapperMode, SelectedRule,
};

/// Reader buffer size; records up to 1 MiB stream without reallocation.
pub(crate) const LINE_BUFFER_SIZE: usize = 1 << 20;

/// Rule-hash stand-in for files served without any rule.
const PASSTHROUGH_HASH: &str = "passthrough";

/// Errors produced while building or applying a file index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Reading or statting the source file failed.
    #[error("failed to read source {path}: {source}")]
    Io {
        /// The source file.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Rule resolution failed.
    #[error(transparent)]
    Mapper(#[from] MapperError),
}

/// Options controlling rule resolution and index caching.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Root of the source tree.
    pub source_dir: PathBuf,
    /// Mapping filename looked up in each ancestor directory.
    pub mapper_file_name: String,
    /// Whether mapping files follow their `extends` chains.
    pub inherit_parent: bool,
    /// Behavior when no rule applies to a file.
    pub missing_mapper: MissingMapperMode,
    /// Default `missing_resource_key` for rules that leave it unset.
    pub missing_resource_key: MissingKeyMode,
    /// Cache directory for persisted indexes; `None` disables caching.
    pub index_dir: Option<PathBuf>,
    /// Cache format version; part of the cache key.
    pub format_version: u32,
}

impl IndexOptions {
    /// Builds options with the standard defaults and caching disabled.
    #[must_use]
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            mapper_file_name: mapper::DEFAULT_MAPPER_FILE_NAME.to_string(),
            inherit_parent: true,
            missing_mapper: MissingMapperMode::Deny,
            missing_resource_key: MissingKeyMode::Deny,
            index_dir: None,
            format_version: 1,
        }
    }

    /// The mapper configuration these options imply.
    #[must_use]
    pub fn mapper_config(&self) -> MapperConfig {
        MapperConfig {
            source_dir: self.source_dir.clone(),
            mapper_file_name: self.mapper_file_name.clone(),
            inherit_parent: self.inherit_parent,
            missing_mapper: self.missing_mapper,
            default_missing_key: self.missing_resource_key,
        }
    }
}

/// One physical line: the half-open byte range `[start, end)` including
/// the trailing terminator, plus the mapping results for the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineIndex {
    /// First byte of the line.
    pub start: u64,
    /// One past the last byte of the line (terminator included).
    pub end: u64,
    /// Decision mode of the rule that produced the candidates.
    pub decision: Decision,
    /// Candidates derived from the record; empty means never visible.
    pub candidates: Vec<CandidateKey>,
}

/// Memoized mapping results for one source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileIndex {
    /// Absolute path of the indexed source file.
    pub source_path: PathBuf,
    /// Source size in bytes at build time.
    pub size: u64,
    /// Source modification time in nanoseconds since the epoch.
    pub mtime_nanos: i64,
    /// Hash of the effective rule set, or `passthrough`.
    pub rule_hash: String,
    /// True when no rule applied and the whole file is visible.
    pub passthrough: bool,
    /// When the index was built.
    pub built_at: DateTime<Utc>,
    /// Per-line ranges and candidates; empty for passthrough.
    pub lines: Vec<LineIndex>,
}

/// Builds the index for a source file, or loads it from the cache when a
/// valid entry exists.
///
/// A cached index is used only when the cache key — format version,
/// source path, size, mtime, and rule hash — matches the current request
/// exactly. Cache persistence is best-effort: failures are logged and
/// swallowed.
///
/// # Errors
///
/// Returns [`IndexError::Mapper`] when rule resolution fails and
/// [`IndexError::Io`] when the source cannot be statted or read.
pub fn build_or_load(source_path: &Path, options: &IndexOptions) -> Result<FileIndex, IndexError> {
    let rule = mapper::resolve_rule_for_file(source_path, &options.mapper_config())?;

    let meta = fs::metadata(source_path).map_err(|source| IndexError::Io {
        path: source_path.to_path_buf(),
        source,
    })?;
    let size = meta.len();
    let mtime = mtime_nanos(&meta);

    let cache_path = options.index_dir.as_deref().map(|dir| {
        let rule_hash = rule
            .as_ref()
            .map_or(PASSTHROUGH_HASH, |rule| rule.rule_hash.as_str());
        cache_file_path(
            dir,
            source_path,
            size,
            mtime,
            rule_hash,
            options.format_version.max(1),
        )
    });
    if let Some(path) = &cache_path {
        if let Some(index) = load(path) {
            debug!(source = %source_path.display(), cache = %path.display(), "index cache hit");
            return Ok(index);
        }
    }

    let index = match &rule {
        None => FileIndex {
            source_path: source_path.to_path_buf(),
            size,
            mtime_nanos: mtime,
            rule_hash: PASSTHROUGH_HASH.to_string(),
            passthrough: true,
            built_at: Utc::now(),
            lines: Vec::new(),
        },
        Some(rule) => build(source_path, size, mtime, rule)?,
    };

    if let Some(path) = &cache_path {
        persist(path, &index);
    }
    Ok(index)
}

/// Streams the source once, splitting on `\n`. The stored range of each
/// line includes its terminator; evaluation sees the record with `\r?\n`
/// trimmed.
fn build(
    source_path: &Path,
    size: u64,
    mtime: i64,
    rule: &SelectedRule,
) -> Result<FileIndex, IndexError> {
    let io_err = |source| IndexError::Io {
        path: source_path.to_path_buf(),
        source,
    };
    let file = File::open(source_path).map_err(io_err)?;
    let mut reader = BufReader::with_capacity(LINE_BUFFER_SIZE, file);

    let mut lines = Vec::new();
    let mut offset = 0_u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).map_err(io_err)?;
        if read == 0 {
            break;
        }
        let start = offset;
        let end = offset + buf.len() as u64;
        let record = trim_line_ending(&buf);
        // Rule-level evaluation errors hide the line rather than failing
        // the build; parse failures already yield an empty list.
        let candidates = mapper::evaluate_line(rule, record).unwrap_or_default();
        lines.push(LineIndex {
            start,
            end,
            decision: rule.decision,
            candidates,
        });
        offset = end;
    }

    Ok(FileIndex {
        source_path: source_path.to_path_buf(),
        size,
        mtime_nanos: mtime,
        rule_hash: rule.rule_hash.clone(),
        passthrough: false,
        built_at: Utc::now(),
        lines,
    })
}

/// Strips one trailing `\r?\n` for evaluation purposes.
pub(crate) fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Whether a decision over the candidate list passes the authorizer.
/// An empty candidate list never passes.
#[must_use]
pub fn decision_allows(
    decision: Decision,
    candidates: &[CandidateKey],
    authorizer: &dyn Authorizer,
) -> bool {
    if candidates.is_empty() {
        return false;
    }
    match decision {
        Decision::Any => candidates
            .iter()
            .any(|candidate| authorizer.is_allowed(candidate)),
        Decision::All => candidates
            .iter()
            .all(|candidate| authorizer.is_allowed(candidate)),
    }
}

/// Whether a single indexed line is visible to the authorizer.
#[must_use]
pub fn is_visible(line: &LineIndex, authorizer: &dyn Authorizer) -> bool {
    decision_allows(line.decision, &line.candidates, authorizer)
}

/// Coalesces the visible lines into maximal contiguous byte segments.
/// Filtering through the segments emits exactly the same bytes as
/// filtering line by line.
#[must_use]
pub fn visible_segments(index: &FileIndex, authorizer: &dyn Authorizer) -> Vec<(u64, u64)> {
    if index.passthrough {
        return vec![(0, index.size)];
    }
    let mut segments: Vec<(u64, u64)> = Vec::new();
    for line in &index.lines {
        if !is_visible(line, authorizer) {
            continue;
        }
        match segments.last_mut() {
            Some(last) if last.1 == line.start => last.1 = line.end,
            _ => segments.push((line.start, line.end)),
        }
    }
    segments
}

/// Copies every visible line range of the source to the writer, in file
/// order, byte for byte. Passthrough indexes copy the whole file.
///
/// # Errors
///
/// Returns [`IndexError::Io`] when the source cannot be opened or read or
/// the writer fails.
pub fn filter_to_writer<W: Write>(
    index: &FileIndex,
    authorizer: &dyn Authorizer,
    writer: &mut W,
) -> Result<(), IndexError> {
    let io_err = |source| IndexError::Io {
        path: index.source_path.clone(),
        source,
    };
    let mut file = File::open(&index.source_path).map_err(io_err)?;

    if index.passthrough {
        io::copy(&mut file, writer).map_err(io_err)?;
        return Ok(());
    }

    let mut buf = Vec::new();
    for line in &index.lines {
        if !is_visible(line, authorizer) {
            continue;
        }
        let len = usize::try_from(line.end - line.start).unwrap_or(usize::MAX);
        if len == 0 {
            continue;
        }
        buf.resize(len, 0);
        file.read_exact_at(&mut buf, line.start).map_err(io_err)?;
        writer.write_all(&buf).map_err(io_err)?;
    }
    Ok(())
}

/// Nanoseconds since the epoch, saturating on either side.
fn mtime_nanos(meta: &fs::Metadata) -> i64 {
    let Ok(modified) = meta.modified() else {
        return 0;
    };
    match modified.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos())
            .map(|nanos| -nanos)
            .unwrap_or(i64::MIN),
    }
}

/// Cache file path for a request: the hex SHA-256 of
/// `format_version|path|size|mtime_nanos|rule_hash`, with a `.json`
/// extension, under the cache directory.
fn cache_file_path(
    index_dir: &Path,
    source_path: &Path,
    size: u64,
    mtime: i64,
    rule_hash: &str,
    format_version: u32,
) -> PathBuf {
    let key = format!(
        "{format_version}|{}|{size}|{mtime}|{rule_hash}",
        source_path.display()
    );
    index_dir.join(format!("{}.json", hex::encode(Sha256::digest(key))))
}

/// Best-effort atomic persist: temp file in the cache directory, then
/// rename. Failures are logged and swallowed.
fn persist(path: &Path, index: &FileIndex) {
    let Some(dir) = path.parent() else {
        return;
    };
    let result = (|| -> io::Result<()> {
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let bytes = serde_json::to_vec(index).map_err(io::Error::other)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| err.error)?;
        Ok(())
    })();
    if let Err(err) = result {
        warn!(cache = %path.display(), error = %err, "failed to persist index");
    }
}

/// Loads a cached index; any read or parse failure is a cache miss.
fn load(path: &Path) -> Option<FileIndex> {
    let mut bytes = Vec::new();
    File::open(path).ok()?.read_to_end(&mut bytes).ok()?;
    serde_json::from_slice(&bytes).ok()
}
