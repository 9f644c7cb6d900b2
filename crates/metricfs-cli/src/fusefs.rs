//! FUSE adapter: presents the filtered view as a read-only mount.
//!
//! Directory listings coalesce compressed variants under their virtual
//! basename. Opening a virtual record file materializes the filtered
//! bytes for that open and serves them as a memory-resident regular
//! file; every other file is served unchanged. Rule failures surface as
//! EIO to the reader.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry,
    ReplyOpen, Request,
};
use metricfs_core::authz::Authorizer;
use metricfs_core::index::IndexOptions;
use metricfs_core::project;
use tracing::{debug, warn};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Mount configuration.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Source tree presented through the mount.
    pub source_dir: PathBuf,
    /// Mountpoint.
    pub mount_dir: PathBuf,
    /// Whether other users may access the mount.
    pub allow_other: bool,
    /// Rule resolution and index cache options used per read.
    pub render: IndexOptions,
}

/// Mounts the filesystem and serves until it is unmounted.
pub fn mount_and_serve(config: MountConfig, authorizer: Arc<dyn Authorizer>) -> io::Result<()> {
    let mut options = vec![
        MountOption::RO,
        MountOption::FSName("metricfs".to_string()),
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    let mount_dir = config.mount_dir.clone();
    let filesystem = MetricFs::new(config, authorizer);
    fuser::mount2(filesystem, mount_dir, &options)
}

/// One name in a virtual directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntry {
    /// Virtual basename presented to readers.
    pub name: String,
    /// Physical file backing the entry.
    pub source: PathBuf,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Whether the physical file is a compressed variant.
    pub projected: bool,
}

/// Lists a source directory with compressed variants coalesced under
/// their virtual basename. The non-compressed physical variant wins on
/// collision.
pub fn resolve_entries(dir: &Path) -> io::Result<BTreeMap<String, ResolvedEntry>> {
    let mut out: BTreeMap<String, ResolvedEntry> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let source = entry.path();
        if entry.file_type()?.is_dir() {
            out.insert(
                name.clone(),
                ResolvedEntry {
                    name,
                    source,
                    is_dir: true,
                    projected: false,
                },
            );
            continue;
        }
        let (virtual_name, projected) = project::virtual_jsonl_name(&name);
        if let Some(existing) = out.get(&virtual_name) {
            if !existing.projected {
                continue;
            }
        }
        out.insert(
            virtual_name.clone(),
            ResolvedEntry {
                name: virtual_name,
                source,
                is_dir: false,
                projected,
            },
        );
    }
    Ok(out)
}

/// Materializes the bytes served for one entry: record files render
/// through the filtering pipeline, everything else is read unchanged.
pub fn entry_data(
    entry: &ResolvedEntry,
    options: &IndexOptions,
    authorizer: &dyn Authorizer,
) -> io::Result<Vec<u8>> {
    let basename = entry
        .source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !entry.projected && !project::is_record_file(&basename) {
        return fs::read(&entry.source);
    }
    let mut data = Vec::new();
    project::render_filtered(&entry.source, options, authorizer, &mut data)
        .map_err(io::Error::other)?;
    Ok(data)
}

enum NodeKind {
    Dir,
    File {
        projected: bool,
        data: Option<Vec<u8>>,
    },
}

struct Node {
    parent: u64,
    source: PathBuf,
    kind: NodeKind,
}

struct MetricFs {
    config: MountConfig,
    authorizer: Arc<dyn Authorizer>,
    nodes: HashMap<u64, Node>,
    children: HashMap<(u64, String), u64>,
    next_ino: u64,
}

impl MetricFs {
    fn new(config: MountConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INO,
            Node {
                parent: ROOT_INO,
                source: config.source_dir.clone(),
                kind: NodeKind::Dir,
            },
        );
        Self {
            config,
            authorizer,
            nodes,
            children: HashMap::new(),
            next_ino: ROOT_INO + 1,
        }
    }

    /// Returns the inode for a directory entry, allocating one on first
    /// sight and refreshing the backing source on every call.
    fn intern(&mut self, parent: u64, entry: &ResolvedEntry) -> u64 {
        let key = (parent, entry.name.clone());
        if let Some(&ino) = self.children.get(&key) {
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.source.clone_from(&entry.source);
            }
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(
            ino,
            Node {
                parent,
                source: entry.source.clone(),
                kind: if entry.is_dir {
                    NodeKind::Dir
                } else {
                    NodeKind::File {
                        projected: entry.projected,
                        data: None,
                    }
                },
            },
        );
        self.children.insert(key, ino);
        ino
    }

    /// Materializes the filtered bytes for a file node and returns the
    /// resulting length.
    fn materialize(&mut self, ino: u64) -> io::Result<usize> {
        let Some(node) = self.nodes.get(&ino) else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        let NodeKind::File { projected, .. } = node.kind else {
            return Err(io::Error::from_raw_os_error(libc::EISDIR));
        };
        let entry = ResolvedEntry {
            name: node
                .source
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            source: node.source.clone(),
            is_dir: false,
            projected,
        };
        let bytes = entry_data(&entry, &self.config.render, self.authorizer.as_ref())?;
        let len = bytes.len();
        if let Some(node) = self.nodes.get_mut(&ino) {
            if let NodeKind::File { data, .. } = &mut node.kind {
                *data = Some(bytes);
            }
        }
        Ok(len)
    }

    fn attr_for(&self, ino: u64, node: &Node, size: u64) -> io::Result<FileAttr> {
        let meta = fs::metadata(&node.source)?;
        let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
        let (kind, perm, nlink, size) = match node.kind {
            NodeKind::Dir => (FileType::Directory, 0o555, 2, 0),
            NodeKind::File { .. } => (FileType::RegularFile, 0o444, 1, size),
        };
        Ok(FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        })
    }
}

impl Filesystem for MetricFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_node) = self.nodes.get(&parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let parent_source = parent_node.source.clone();
        let entries = match resolve_entries(&parent_source) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %parent_source.display(), error = %err, "listing failed");
                reply.error(libc::EIO);
                return;
            }
        };
        let Some(entry) = entries.get(&name.to_string_lossy().into_owned()) else {
            reply.error(libc::ENOENT);
            return;
        };
        let ino = self.intern(parent, entry);

        let size = if entry.is_dir {
            0
        } else {
            match self.materialize(ino) {
                Ok(len) => len as u64,
                Err(err) => {
                    debug!(file = %entry.source.display(), error = %err, "materialize failed");
                    reply.error(libc::EIO);
                    return;
                }
            }
        };
        let Some(node) = self.nodes.get(&ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_for(ino, node, size) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(_) => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let cached_len = match self.nodes.get(&ino) {
            None => {
                reply.error(libc::ENOENT);
                return;
            }
            Some(node) => match &node.kind {
                NodeKind::Dir => Some(0),
                NodeKind::File {
                    data: Some(data), ..
                } => Some(data.len()),
                NodeKind::File { data: None, .. } => None,
            },
        };
        let size = match cached_len {
            Some(len) => len as u64,
            None => match self.materialize(ino) {
                Ok(len) => len as u64,
                Err(_) => {
                    reply.error(libc::EIO);
                    return;
                }
            },
        };
        let Some(node) = self.nodes.get(&ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_for(ino, node, size) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(_) => reply.error(libc::ENOENT),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        // Re-materialize per open so a fresh authorization view applies.
        match self.materialize(ino) {
            Ok(_) => reply.opened(0, 0),
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(node) = self.nodes.get(&ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let NodeKind::File {
            data: Some(data), ..
        } = &node.kind
        else {
            reply.error(libc::EIO);
            return;
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(size as usize).min(data.len());
        reply.data(&data[start..end]);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(node) = self.nodes.get(&ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !matches!(node.kind, NodeKind::Dir) {
            reply.error(libc::ENOTDIR);
            return;
        }
        let parent = node.parent;
        let source = node.source.clone();
        let entries = match resolve_entries(&source) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %source.display(), error = %err, "listing failed");
                reply.error(libc::EIO);
                return;
            }
        };

        let mut listing: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent, FileType::Directory, "..".to_string()),
        ];
        for entry in entries.values() {
            let child = self.intern(ino, entry);
            let kind = if entry.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            listing.push((child, kind, entry.name.clone()));
        }

        for (index, (ino, kind, name)) in listing
            .into_iter()
            .enumerate()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
        {
            if reply.add(ino, (index + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use metricfs_core::authz::{CandidateKey, SetAuthorizer};
    use metricfs_core::mapper::MissingMapperMode;

    use super::*;

    fn write_gzip(path: &Path, data: &[u8]) {
        let file = fs::File::create(path).expect("create gz");
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(data).expect("compress");
        encoder.finish().expect("finish");
    }

    #[test]
    fn listings_coalesce_compressed_variants() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.jsonl"), "{}\n").expect("plain");
        write_gzip(&dir.path().join("a.jsonl.gz"), b"{}\n");
        write_gzip(&dir.path().join("b.jsonl.gz"), b"{}\n");
        fs::write(dir.path().join("notes.txt"), "hello").expect("notes");
        fs::create_dir(dir.path().join("nested")).expect("nested");

        let entries = resolve_entries(dir.path()).expect("resolve");
        let names: Vec<&str> = entries.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["a.jsonl", "b.jsonl", "nested", "notes.txt"]);

        // Non-compressed variant wins the a.jsonl collision.
        let a = &entries["a.jsonl"];
        assert!(!a.projected);
        assert_eq!(a.source, dir.path().join("a.jsonl"));

        let b = &entries["b.jsonl"];
        assert!(b.projected);
        assert_eq!(b.source, dir.path().join("b.jsonl.gz"));

        assert!(entries["nested"].is_dir);
    }

    #[test]
    fn entry_data_filters_records_and_passes_other_files_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(".metricfs-map.yaml"),
            r#"version: 1
rules:
  - match:
      glob: "*.jsonl"
    object_type: "metric_row"
    mapper:
      kind: "json_pointer"
      pointer: "/metric_row_id"
      canonical_template: "metric_row:{value}"
"#,
        )
        .expect("mapping");
        let records = "{\"metric_row_id\":\"orders_1\"}\n{\"metric_row_id\":\"orders_2\"}\n";
        fs::write(dir.path().join("orders.jsonl"), records).expect("records");
        fs::write(dir.path().join("notes.txt"), "hello").expect("notes");

        let options = IndexOptions::new(dir.path());
        let authorizer =
            SetAuthorizer::new(vec![CandidateKey::new("metric_row", "orders_1", "read")]);
        let entries = resolve_entries(dir.path()).expect("resolve");

        let filtered =
            entry_data(&entries["orders.jsonl"], &options, &authorizer).expect("filtered");
        assert_eq!(filtered, b"{\"metric_row_id\":\"orders_1\"}\n");

        // Non-record files are served verbatim even under missing-mapper
        // deny: the rule system only governs record projection.
        let notes = entry_data(&entries["notes.txt"], &options, &authorizer).expect("notes");
        assert_eq!(notes, b"hello");
    }

    #[test]
    fn entry_data_surfaces_rule_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("orders.jsonl"), "{}\n").expect("records");
        let options = IndexOptions::new(dir.path());
        let authorizer = SetAuthorizer::new(Vec::new());
        let entries = resolve_entries(dir.path()).expect("resolve");
        // missing-mapper deny and no mapping file: the read fails.
        assert!(entry_data(&entries["orders.jsonl"], &options, &authorizer).is_err());

        let mut passthrough = IndexOptions::new(dir.path());
        passthrough.missing_mapper = MissingMapperMode::Passthrough;
        let data = entry_data(&entries["orders.jsonl"], &passthrough, &authorizer)
            .expect("passthrough data");
        assert_eq!(data, b"{}\n");
    }
}
