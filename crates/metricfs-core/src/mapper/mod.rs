//! Mapping rules: how records become authorization subjects.
//!
//! A mapping file is a per-directory YAML document declaring an ordered
//! rule list. Rules are discovered by walking from a source file's
//! directory toward the source root; the nearest ancestor wins. The
//! selected rule carries a stable hash over the canonicalized effective
//! rule set, which keys the on-disk index cache.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

mod eval;

pub use eval::evaluate_line;

/// Default mapping filename looked up in each ancestor directory.
pub const DEFAULT_MAPPER_FILE_NAME: &str = ".metricfs-map.yaml";

/// The only supported mapping file format version.
const SUPPORTED_VERSION: u32 = 1;

/// Errors produced while resolving, parsing, or evaluating mapping rules.
#[derive(Debug, Error)]
pub enum MapperError {
    /// No mapping file exists between the source file and the source root.
    #[error("no mapping file found for {path}")]
    RuleNotFound {
        /// The source file that has no applicable mapping file.
        path: PathBuf,
    },

    /// A mapping file exists but none of its rules match the source file.
    #[error("no matching mapping rule for {path}")]
    NoMatchingRule {
        /// The source file no rule matched.
        path: PathBuf,
    },

    /// The mapping file declares an unsupported format version.
    #[error("unsupported mapping version {version} in {path}")]
    UnsupportedVersion {
        /// The mapping file.
        path: PathBuf,
        /// The declared version.
        version: u32,
    },

    /// An `extends` chain loops back on itself.
    #[error("extends cycle detected at {path}")]
    ExtendsCycle {
        /// The mapping file seen twice.
        path: PathBuf,
    },

    /// A rule's `decision` is neither `any` nor `all`.
    #[error("invalid decision: {value}")]
    InvalidDecision {
        /// The rejected value.
        value: String,
    },

    /// A rule's `missing_resource_key` is neither `deny` nor `ignore`.
    #[error("invalid missing_resource_key: {value}")]
    InvalidMissingResourceKey {
        /// The rejected value.
        value: String,
    },

    /// A root pointer does not start with `/`.
    #[error("pointer must start with '/': {pointer}")]
    RootPointerSyntax {
        /// The rejected pointer.
        pointer: String,
    },

    /// A `from_array` item pointer does not start with `./`.
    #[error("from_array field pointer must start with './': {pointer}")]
    ItemPointerSyntax {
        /// The rejected pointer.
        pointer: String,
    },

    /// The rule names a mapper kind this engine does not implement.
    #[error("unsupported mapper kind: {kind}")]
    UnsupportedMapperKind {
        /// The rejected kind.
        kind: String,
    },

    /// A mapping file could not be read.
    #[error("failed to read mapping file {path}: {source}")]
    Io {
        /// The mapping file.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A mapping file is not valid YAML for the expected schema.
    #[error("failed to parse mapping file {path}: {source}")]
    Parse {
        /// The mapping file.
        path: PathBuf,
        /// The underlying YAML error.
        source: serde_yaml::Error,
    },
}

/// How multiple candidates per record combine into a visibility decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Visible when at least one candidate is allowed.
    Any,
    /// Visible only when every candidate is allowed.
    All,
}

/// Behavior when the canonical template still has unresolved placeholders
/// after fallback. Both modes drop the candidate; `deny` marks the drop as
/// intentional denial, `ignore` as a non-event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingKeyMode {
    /// Drop the candidate; the record stays hidden.
    Deny,
    /// Drop the candidate without treating it as an error.
    Ignore,
}

/// Behavior when no mapping file or no matching rule applies to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingMapperMode {
    /// The file cannot be served.
    Deny,
    /// The file is emitted unfiltered.
    Passthrough,
}

/// Rule-resolution configuration.
#[derive(Debug, Clone)]
pub struct MapperConfig {
    /// Root of the source tree; the upward walk stops here.
    pub source_dir: PathBuf,
    /// Mapping filename looked up in each directory.
    pub mapper_file_name: String,
    /// Whether `extends` chains are followed.
    pub inherit_parent: bool,
    /// Behavior when no rule applies.
    pub missing_mapper: MissingMapperMode,
    /// Default `missing_resource_key` for rules that leave it unset.
    pub default_missing_key: MissingKeyMode,
}

impl MapperConfig {
    /// Builds a configuration with the standard defaults: the default
    /// mapping filename, inheritance enabled, and deny modes.
    #[must_use]
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            mapper_file_name: DEFAULT_MAPPER_FILE_NAME.to_string(),
            inherit_parent: true,
            missing_mapper: MissingMapperMode::Deny,
            default_missing_key: MissingKeyMode::Deny,
        }
    }
}

/// Parsed mapping file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingFile {
    /// Format version; must equal 1.
    #[serde(default)]
    pub version: u32,
    /// Relative path of a parent mapping file whose rules append after the
    /// local rules.
    #[serde(default)]
    pub extends: String,
    /// Ordered rule list; first glob match wins.
    #[serde(default)]
    pub rules: Vec<MappingRule>,
}

/// One mapping rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingRule {
    /// File matcher.
    #[serde(rename = "match", default)]
    pub matcher: RuleMatch,
    /// `any` (default) or `all`.
    #[serde(default)]
    pub decision: String,
    /// Default object type for emitted candidates.
    #[serde(default)]
    pub object_type: String,
    /// Default permission for emitted candidates.
    #[serde(default)]
    pub permission: String,
    /// `deny` (default from config) or `ignore`.
    #[serde(default)]
    pub missing_resource_key: String,
    /// How records map to candidates.
    #[serde(default)]
    pub mapper: MapperSpec,
}

/// File matcher for a rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Glob matched against the basename and the path relative to the
    /// mapping file's directory; either match selects the rule.
    #[serde(default)]
    pub glob: String,
}

/// Mapper specification: either a single `json_pointer` extraction or a
/// `multi_extract` over several emit entries.
///
/// Map-valued fields use ordered maps so the canonical serialization used
/// for rule hashing is key-order independent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapperSpec {
    /// `json_pointer` or `multi_extract`.
    #[serde(default)]
    pub kind: String,
    /// Root pointer for `json_pointer`.
    #[serde(default)]
    pub pointer: String,
    /// Template rendered into the candidate id; `{value}` for
    /// `json_pointer`, named placeholders for `multi_extract`.
    #[serde(default)]
    pub canonical_template: String,
    /// Named root pointers (unused by the two built-in kinds at the top
    /// level, kept for hash compatibility with emit-level fields).
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Array iteration source.
    #[serde(default)]
    pub from_array: Option<FromArraySpec>,
    /// Emit entries for `multi_extract`.
    #[serde(default)]
    pub emit: Vec<EmitSpec>,
    /// Post-render transforms.
    #[serde(default)]
    pub normalize: NormalizeSpec,
    /// Placeholder name to ordered root-pointer list, tried when the
    /// primary resolution leaves that placeholder unfilled.
    #[serde(default)]
    pub fallback_paths: BTreeMap<String, Vec<String>>,
}

/// Post-render id transforms.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NormalizeSpec {
    /// Lowercase the rendered id.
    #[serde(default)]
    pub lowercase: bool,
    /// Trim leading and trailing `/` from the rendered id.
    #[serde(default)]
    pub trim_slash: bool,
}

/// Array iteration: resolve `pointer` to an array and apply item-relative
/// `./…` pointers to each element.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FromArraySpec {
    /// Root pointer yielding an array.
    #[serde(default)]
    pub pointer: String,
    /// Placeholder name to item-relative pointer.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Template rendered per array element.
    #[serde(default)]
    pub canonical_template: String,
}

/// One emit entry of a `multi_extract` mapper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmitSpec {
    /// Object type for candidates from this entry.
    #[serde(default)]
    pub object_type: String,
    /// Permission for candidates from this entry.
    #[serde(default)]
    pub permission: String,
    /// Placeholder name to root pointer.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Array iteration alternative to `fields`.
    #[serde(default)]
    pub from_array: Option<FromArraySpec>,
    /// Template rendered into the candidate id.
    #[serde(default)]
    pub canonical_template: String,
}

/// The rule selected for a source file, with effective modes and the
/// stable hash of the contributing rule set.
#[derive(Debug, Clone)]
pub struct SelectedRule {
    /// Effective decision mode.
    pub decision: Decision,
    /// Effective missing-resource-key mode.
    pub missing_resource_key: MissingKeyMode,
    /// The matched rule.
    pub rule: MappingRule,
    /// Hex digest over the canonicalized rule set, including inherited
    /// rules. Depends only on rule content and order, never on file bytes.
    pub rule_hash: String,
}

/// Resolves the applicable mapping rule for a source file.
///
/// Walks from the file's directory toward the source root looking for the
/// configured mapping filename; the nearest ancestor wins. Returns
/// `Ok(None)` when no rule applies and the configuration permits
/// passthrough.
///
/// # Errors
///
/// Returns [`MapperError::RuleNotFound`] or [`MapperError::NoMatchingRule`]
/// under `missing_mapper = Deny`, and configuration or I/O errors from
/// loading the mapping file chain.
pub fn resolve_rule_for_file(
    file_path: &Path,
    config: &MapperConfig,
) -> Result<Option<SelectedRule>, MapperError> {
    let abs_file = absolute_path(file_path);
    let abs_source = absolute_path(&config.source_dir);

    let mut dir = abs_file
        .parent()
        .map_or_else(|| PathBuf::from("/"), Path::to_path_buf);
    let mut mapper_path = None;
    loop {
        let candidate = dir.join(&config.mapper_file_name);
        if fs::metadata(&candidate).is_ok() {
            mapper_path = Some(candidate);
            break;
        }
        if dir == abs_source {
            break;
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }

    let Some(mapper_path) = mapper_path else {
        return match config.missing_mapper {
            MissingMapperMode::Deny => Err(MapperError::RuleNotFound {
                path: file_path.to_path_buf(),
            }),
            MissingMapperMode::Passthrough => {
                debug!(file = %file_path.display(), "no mapping file, passthrough");
                Ok(None)
            }
        };
    };

    let (rules, rule_hash) = load_rules(&mapper_path, config.inherit_parent, &mut HashSet::new())?;
    let mapper_dir = mapper_path
        .parent()
        .map_or_else(|| PathBuf::from("/"), Path::to_path_buf);
    let basename = abs_file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let rel_to_mapper = abs_file.strip_prefix(&mapper_dir).map_or_else(
        |_| basename.clone(),
        |rel| rel.to_string_lossy().into_owned(),
    );

    for rule in &rules {
        let glob = rule.matcher.glob.trim();
        if glob.is_empty() {
            continue;
        }
        if !glob_matches(glob, &rel_to_mapper) && !glob_matches(glob, &basename) {
            continue;
        }
        let decision = parse_decision(&rule.decision)?;
        let missing = if rule.missing_resource_key.is_empty() {
            config.default_missing_key
        } else {
            parse_missing_key(&rule.missing_resource_key)?
        };
        return Ok(Some(SelectedRule {
            decision,
            missing_resource_key: missing,
            rule: rule.clone(),
            rule_hash,
        }));
    }

    match config.missing_mapper {
        MissingMapperMode::Deny => Err(MapperError::NoMatchingRule {
            path: file_path.to_path_buf(),
        }),
        MissingMapperMode::Passthrough => Ok(None),
    }
}

/// Loads a mapping file and, when inheritance is enabled, its `extends`
/// chain. Parent rules append after local rules so local rules take
/// precedence. Returns the combined rules and their canonical hash.
fn load_rules(
    path: &Path,
    inherit: bool,
    seen: &mut HashSet<PathBuf>,
) -> Result<(Vec<MappingRule>, String), MapperError> {
    let abs = normalize_path(&absolute_path(path));
    if !seen.insert(abs.clone()) {
        return Err(MapperError::ExtendsCycle { path: abs });
    }

    let text = fs::read_to_string(&abs).map_err(|source| MapperError::Io {
        path: abs.clone(),
        source,
    })?;
    let file: MappingFile = serde_yaml::from_str(&text).map_err(|source| MapperError::Parse {
        path: abs.clone(),
        source,
    })?;
    if file.version != SUPPORTED_VERSION {
        return Err(MapperError::UnsupportedVersion {
            path: abs,
            version: file.version,
        });
    }

    let mut rules = file.rules;
    if inherit && !file.extends.trim().is_empty() {
        let parent_dir = abs
            .parent()
            .map_or_else(|| PathBuf::from("/"), Path::to_path_buf);
        let parent = normalize_path(&parent_dir.join(file.extends.trim()));
        let (parent_rules, _) = load_rules(&parent, inherit, seen)?;
        rules.extend(parent_rules);
    }

    let hash = rule_hash(&rules);
    Ok((rules, hash))
}

/// Computes the stable digest of a rule set.
///
/// Canonicalization: rules keep their order; every string-keyed map inside
/// the mapper and fallback tables is ordered (`BTreeMap`), so serializing
/// the rules as JSON yields a key-order-independent byte sequence. The
/// digest is the lowercase hex SHA-256 of that sequence. This is a cache
/// key, not a security boundary, but the serialization is a frozen
/// contract.
#[must_use]
pub fn rule_hash(rules: &[MappingRule]) -> String {
    let canonical = serde_json::to_vec(rules).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

fn parse_decision(raw: &str) -> Result<Decision, MapperError> {
    match raw {
        "" | "any" => Ok(Decision::Any),
        "all" => Ok(Decision::All),
        other => Err(MapperError::InvalidDecision {
            value: other.to_string(),
        }),
    }
}

fn parse_missing_key(raw: &str) -> Result<MissingKeyMode, MapperError> {
    match raw {
        "deny" => Ok(MissingKeyMode::Deny),
        "ignore" => Ok(MissingKeyMode::Ignore),
        other => Err(MapperError::InvalidMissingResourceKey {
            value: other.to_string(),
        }),
    }
}

fn glob_matches(pattern: &str, name: &str) -> bool {
    // `*` must not cross path separators; `**` does. An unparseable
    // pattern simply never matches.
    let options = glob::MatchOptions {
        require_literal_separator: true,
        ..glob::MatchOptions::new()
    };
    glob::Pattern::new(pattern)
        .map(|pattern| pattern.matches_with(name, options))
        .unwrap_or(false)
}

/// Prepends the current directory to relative paths without touching the
/// filesystem.
fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Lexically normalizes a path: collapses `.` and resolves `..` against
/// preceding components. Used to key the `extends` cycle set and to join
/// relative `extends` targets.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}
