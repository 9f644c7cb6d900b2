//! Streaming projection of record files, including compressed variants.
//!
//! The projector serves the virtual-name contract of the filesystem
//! surface: `X.jsonl.gz` and `X.jsonl.tar.gz` both present as `X.jsonl`.
//! Plain files go through the indexer; compressed variants stream their
//! decoded record sequence through the mapper and authorizer without
//! materializing an index. Rule resolution always uses the virtual path so
//! globs match the name the reader sees.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use thiserror::Error;

use crate::authz::Authorizer;
use crate::index::{self, IndexError, IndexOptions, LINE_BUFFER_SIZE};
use crate::mapper::{self, MapperError, SelectedRule};

/// Errors produced while rendering a filtered projection.
#[derive(Debug, Error)]
pub enum ProjectError {
    /// Reading the source, decoding, or writing to the sink failed.
    #[error("failed to project {path}: {source}")]
    Io {
        /// The source file being projected.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Index build or filtering failed.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Rule resolution failed.
    #[error(transparent)]
    Mapper(#[from] MapperError),

    /// The file is neither a record file nor a supported compressed
    /// variant.
    #[error("unsupported file type for filtering: {path}")]
    Unsupported {
        /// The offending file.
        path: PathBuf,
    },
}

/// Maps a physical basename to its virtual presentation. Returns the
/// virtual name and whether the physical file is a compressed variant
/// that projects through a decoder.
#[must_use]
pub fn virtual_jsonl_name(name: &str) -> (String, bool) {
    let lower = name.to_lowercase();
    if lower.ends_with(".jsonl.tar.gz") {
        (name[..name.len() - ".tar.gz".len()].to_string(), true)
    } else if lower.ends_with(".jsonl.gz") {
        (name[..name.len() - ".gz".len()].to_string(), true)
    } else {
        (name.to_string(), false)
    }
}

/// Whether a basename is a record file or one of its compressed variants.
#[must_use]
pub fn is_record_file(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".jsonl") || lower.ends_with(".jsonl.gz") || lower.ends_with(".jsonl.tar.gz")
}

/// Renders the filtered projection of a source file to the writer.
///
/// Plain `.jsonl` files filter through a (possibly cached) [`FileIndex`];
/// `.jsonl.gz` and `.jsonl.tar.gz` stream through the decoder chain.
///
/// # Errors
///
/// Returns [`ProjectError::Unsupported`] for non-record files and I/O,
/// index, or mapper errors from the underlying pipeline.
///
/// [`FileIndex`]: crate::index::FileIndex
pub fn render_filtered<W: Write>(
    source_path: &Path,
    options: &IndexOptions,
    authorizer: &dyn Authorizer,
    writer: &mut W,
) -> Result<(), ProjectError> {
    let lower = source_path.to_string_lossy().to_lowercase();
    if lower.ends_with(".jsonl") {
        let index = index::build_or_load(source_path, options)?;
        index::filter_to_writer(&index, authorizer, writer)?;
        return Ok(());
    }

    // Resolve against the virtual path so `*.jsonl` globs apply to the
    // name the reader sees.
    let virtual_path = virtual_path_for_rule(source_path);
    let rule = mapper::resolve_rule_for_file(&virtual_path, &options.mapper_config())?;

    let io_err = |source| ProjectError::Io {
        path: source_path.to_path_buf(),
        source,
    };
    if lower.ends_with(".jsonl.tar.gz") {
        let file = File::open(source_path).map_err(io_err)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        for entry in archive.entries().map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let is_jsonl = entry.path().is_ok_and(|path| {
                path.to_string_lossy().to_lowercase().ends_with(".jsonl")
            });
            if !is_jsonl {
                continue;
            }
            stream_lines(entry, rule.as_ref(), authorizer, writer).map_err(io_err)?;
        }
        Ok(())
    } else if lower.ends_with(".jsonl.gz") {
        let file = File::open(source_path).map_err(io_err)?;
        stream_lines(GzDecoder::new(file), rule.as_ref(), authorizer, writer).map_err(io_err)
    } else {
        Err(ProjectError::Unsupported {
            path: source_path.to_path_buf(),
        })
    }
}

fn virtual_path_for_rule(source_path: &Path) -> PathBuf {
    let Some(name) = source_path.file_name().map(|name| name.to_string_lossy()) else {
        return source_path.to_path_buf();
    };
    let (virtual_name, _) = virtual_jsonl_name(&name);
    source_path.with_file_name(virtual_name)
}

/// Streams a decoded record sequence, emitting each visible line with its
/// original terminator.
fn stream_lines<R: Read, W: Write>(
    reader: R,
    rule: Option<&SelectedRule>,
    authorizer: &dyn Authorizer,
    writer: &mut W,
) -> std::io::Result<()> {
    let mut reader = BufReader::with_capacity(LINE_BUFFER_SIZE, reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        if line_visible(rule, index::trim_line_ending(&buf), authorizer) {
            writer.write_all(&buf)?;
        }
    }
}

/// Visibility of one streamed record. Without a rule the file is
/// passthrough and every line is visible; with a rule, evaluation errors
/// and empty candidate lists hide the line.
fn line_visible(rule: Option<&SelectedRule>, record: &[u8], authorizer: &dyn Authorizer) -> bool {
    let Some(rule) = rule else {
        return true;
    };
    let candidates = mapper::evaluate_line(rule, record).unwrap_or_default();
    index::decision_allows(rule.decision, &candidates, authorizer)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write as _;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;
    use crate::authz::{CandidateKey, SetAuthorizer};
    use crate::mapper::MissingMapperMode;

    const ORDERS_MAPPING: &str = r#"version: 1
rules:
  - match:
      glob: "*.jsonl"
    object_type: "metric_row"
    permission: "read"
    mapper:
      kind: "json_pointer"
      pointer: "/metric_row_id"
      canonical_template: "metric_row:{value}"
    missing_resource_key: "deny"
"#;

    const ORDERS_CONTENT: &str = concat!(
        "{\"metric_row_id\":\"orders_1\",\"value\":10}\n",
        "{\"metric_row_id\":\"orders_2\",\"value\":20}\n",
        "{\"metric_row_id\":\"orders_3\",\"value\":30}\n",
    );

    fn orders_authorizer() -> SetAuthorizer {
        SetAuthorizer::new(vec![
            CandidateKey::new("metric_row", "orders_1", "read"),
            CandidateKey::new("metric_row", "orders_3", "read"),
        ])
    }

    fn expected_filtered() -> String {
        ORDERS_CONTENT
            .lines()
            .filter(|line| !line.contains("orders_2"))
            .map(|line| format!("{line}\n"))
            .collect()
    }

    fn write_gzip(path: &Path, data: &[u8]) {
        let file = File::create(path).expect("create gz");
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(data).expect("compress");
        encoder.finish().expect("finish gz");
    }

    fn write_tar_gzip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).expect("create tar.gz");
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).expect("append");
        }
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gz");
    }

    #[test]
    fn virtual_names_strip_compression_suffixes() {
        let cases = [
            ("a.jsonl", "a.jsonl", false),
            ("a.jsonl.gz", "a.jsonl", true),
            ("a.jsonl.tar.gz", "a.jsonl", true),
            ("a.parquet", "a.parquet", false),
            ("notes.txt", "notes.txt", false),
        ];
        for (input, want, projected) in cases {
            assert_eq!(
                virtual_jsonl_name(input),
                (want.to_string(), projected),
                "virtual_jsonl_name({input:?})"
            );
        }
    }

    #[test]
    fn plain_jsonl_renders_through_the_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(".metricfs-map.yaml"), ORDERS_MAPPING).expect("mapping");
        let source = dir.path().join("orders.jsonl");
        fs::write(&source, ORDERS_CONTENT).expect("source");

        let mut out = Vec::new();
        render_filtered(
            &source,
            &IndexOptions::new(dir.path()),
            &orders_authorizer(),
            &mut out,
        )
        .expect("render");
        assert_eq!(String::from_utf8(out).expect("utf8"), expected_filtered());
    }

    #[test]
    fn gzip_variant_matches_plain_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(".metricfs-map.yaml"), ORDERS_MAPPING).expect("mapping");
        let source = dir.path().join("orders.jsonl.gz");
        write_gzip(&source, ORDERS_CONTENT.as_bytes());

        let mut out = Vec::new();
        render_filtered(
            &source,
            &IndexOptions::new(dir.path()),
            &orders_authorizer(),
            &mut out,
        )
        .expect("render");
        assert_eq!(String::from_utf8(out).expect("utf8"), expected_filtered());
    }

    #[test]
    fn tar_gzip_filters_jsonl_entries_in_archive_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(".metricfs-map.yaml"), ORDERS_MAPPING).expect("mapping");
        let source = dir.path().join("orders.jsonl.tar.gz");
        let inner = "{\"metric_row_id\":\"orders_1\",\"value\":10}\n\
                     {\"metric_row_id\":\"orders_2\",\"value\":20}\n";
        write_tar_gzip(
            &source,
            &[
                ("inner/orders.jsonl", inner.as_bytes()),
                ("inner/readme.txt", b"not records\n"),
            ],
        );

        let authorizer =
            SetAuthorizer::new(vec![CandidateKey::new("metric_row", "orders_1", "read")]);
        let mut out = Vec::new();
        render_filtered(
            &source,
            &IndexOptions::new(dir.path()),
            &authorizer,
            &mut out,
        )
        .expect("render");
        assert_eq!(out, b"{\"metric_row_id\":\"orders_1\",\"value\":10}\n");
    }

    #[test]
    fn compressed_variant_without_rule_passes_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("orders.jsonl.gz");
        write_gzip(&source, ORDERS_CONTENT.as_bytes());

        let mut options = IndexOptions::new(dir.path());
        options.missing_mapper = MissingMapperMode::Passthrough;
        let mut out = Vec::new();
        render_filtered(&source, &options, &orders_authorizer(), &mut out).expect("render");
        // Passthrough of a compressed variant emits the decoded records.
        assert_eq!(out, ORDERS_CONTENT.as_bytes());
    }

    #[test]
    fn non_record_files_are_unsupported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("notes.txt");
        fs::write(&source, "hello").expect("source");

        let mut options = IndexOptions::new(dir.path());
        options.missing_mapper = MissingMapperMode::Passthrough;
        let err = render_filtered(&source, &options, &orders_authorizer(), &mut Vec::new())
            .expect_err("unsupported");
        assert!(matches!(err, ProjectError::Unsupported { .. }));
    }
}
