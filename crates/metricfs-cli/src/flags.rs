//! Flags shared by every subcommand, their validation, and the builders
//! that turn them into core configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::ArgAction;
use metricfs_core::authz::{
    Authorizer, DenyAllAuthorizer, SetAuthorizer, SpiceDbAuthorizer, SpiceDbConfig,
};
use metricfs_core::index::IndexOptions;
use metricfs_core::mapper::{MissingKeyMode, MissingMapperMode, DEFAULT_MAPPER_FILE_NAME};

/// Flags accepted by every subcommand that touches the source tree.
#[derive(Debug, Clone, clap::Args)]
pub struct CommonArgs {
    /// Source directory to filter
    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    /// Mount directory
    #[arg(long)]
    pub mount_dir: Option<PathBuf>,

    /// Authorization backend (file, spicedb)
    #[arg(long, default_value = "file")]
    pub auth_backend: String,

    /// Subject performing reads, e.g. user:alice
    #[arg(long)]
    pub subject: Option<String>,

    /// Serve the mount read-only; writable mode is unsupported
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub read_only: bool,

    /// Allow other users to access the mount
    #[arg(long)]
    pub allow_other: bool,

    /// SpiceDB endpoint
    #[arg(long)]
    pub spicedb_endpoint: Option<String>,

    /// SpiceDB bearer token
    #[arg(long)]
    pub spicedb_token: Option<String>,

    /// Environment variable consulted when no token flag is given
    #[arg(long, default_value = "SPICEDB_TOKEN")]
    pub spicedb_token_env: String,

    /// SpiceDB consistency mode (minimize_latency, fully_consistent)
    #[arg(long, default_value = "minimize_latency")]
    pub spicedb_consistency: String,

    /// Index cache directory
    #[arg(long, default_value_os_t = default_index_dir())]
    pub index_dir: PathBuf,

    /// Index cache format version
    #[arg(long, default_value_t = 1)]
    pub index_format_version: u32,

    /// Worker threads for warm-index
    #[arg(long, default_value_t = default_index_workers())]
    pub index_workers: usize,

    /// Mapping filename looked up in each directory
    #[arg(long, default_value = DEFAULT_MAPPER_FILE_NAME)]
    pub mapper_file_name: String,

    /// Mapping file resolution strategy; nearest_ancestor only
    #[arg(long, default_value = "nearest_ancestor")]
    pub mapper_resolution: String,

    /// Follow extends chains in mapping files
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub mapper_inherit_parent: bool,

    /// Behavior for files without a mapping rule (deny, passthrough)
    #[arg(long, default_value = "deny")]
    pub missing_mapper: String,

    /// Default behavior for unresolved resource keys (deny, ignore)
    #[arg(long, default_value = "deny")]
    pub missing_resource_key: String,

    /// Static permissions file for the file backend
    #[arg(long)]
    pub permissions_file: Option<PathBuf>,

    /// Permit startup without an authorization source; denies all rows
    #[arg(long)]
    pub allow_no_authz: bool,
}

/// Default cache directory: `$XDG_CACHE_HOME/metricfs`, else
/// `~/.cache/metricfs`, else `.metricfs-cache` in the working directory.
pub fn default_index_dir() -> PathBuf {
    if let Some(cache) = std::env::var_os("XDG_CACHE_HOME") {
        if !cache.is_empty() {
            return PathBuf::from(cache).join("metricfs");
        }
    }
    if let Some(home) = std::env::var_os("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".cache").join("metricfs");
        }
    }
    PathBuf::from(".metricfs-cache")
}

fn default_index_workers() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

impl CommonArgs {
    /// The validated source directory.
    pub fn source_dir(&self) -> Result<&Path> {
        self.source_dir
            .as_deref()
            .context("--source-dir is required")
    }

    /// The validated mount directory.
    pub fn mount_dir(&self) -> Result<&Path> {
        self.mount_dir.as_deref().context("--mount-dir is required")
    }

    /// Parses the missing-mapper flag.
    pub fn missing_mapper_mode(&self) -> Result<MissingMapperMode> {
        match self.missing_mapper.as_str() {
            "deny" => Ok(MissingMapperMode::Deny),
            "passthrough" => Ok(MissingMapperMode::Passthrough),
            _ => bail!("--missing-mapper must be deny|passthrough"),
        }
    }

    /// Parses the missing-resource-key flag.
    pub fn missing_resource_key_mode(&self) -> Result<MissingKeyMode> {
        match self.missing_resource_key.as_str() {
            "deny" => Ok(MissingKeyMode::Deny),
            "ignore" => Ok(MissingKeyMode::Ignore),
            _ => bail!("--missing-resource-key must be deny|ignore"),
        }
    }

    /// Builds the index/render options these flags imply.
    pub fn index_options(&self) -> Result<IndexOptions> {
        let mut options = IndexOptions::new(self.source_dir()?);
        options.mapper_file_name = self.mapper_file_name.clone();
        options.inherit_parent = self.mapper_inherit_parent;
        options.missing_mapper = self.missing_mapper_mode()?;
        options.missing_resource_key = self.missing_resource_key_mode()?;
        options.index_dir = Some(self.index_dir.clone());
        options.format_version = self.index_format_version;
        Ok(options)
    }

    /// Builds the configured authorizer.
    pub fn build_authorizer(&self) -> Result<Arc<dyn Authorizer>> {
        match self.auth_backend.as_str() {
            "file" => match &self.permissions_file {
                Some(path) => {
                    let authorizer = SetAuthorizer::from_permissions_file(path)?;
                    Ok(Arc::new(authorizer))
                }
                None => Ok(Arc::new(DenyAllAuthorizer)),
            },
            "spicedb" => {
                let mut token = self
                    .spicedb_token
                    .as_deref()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                if token.is_empty() && !self.spicedb_token_env.is_empty() {
                    token = std::env::var(&self.spicedb_token_env)
                        .unwrap_or_default()
                        .trim()
                        .to_string();
                }
                if token.is_empty() {
                    bail!(
                        "spicedb auth backend requires --spicedb-token or the {} env var",
                        self.spicedb_token_env
                    );
                }
                let authorizer = SpiceDbAuthorizer::new(SpiceDbConfig {
                    endpoint: self.spicedb_endpoint.clone().unwrap_or_default(),
                    token,
                    subject: self.subject.clone().unwrap_or_default(),
                    consistency: self.spicedb_consistency.clone(),
                })?;
                Ok(Arc::new(authorizer))
            }
            other => bail!("unsupported --auth-backend: {other}"),
        }
    }
}

/// Validates the flag set for a subcommand.
///
/// `need_mount` is true for subcommands that operate on a mount
/// directory.
pub fn validate(common: &CommonArgs, need_mount: bool) -> Result<()> {
    let source_dir = common.source_dir()?;
    if need_mount {
        common.mount_dir()?;
    }
    if common.mapper_resolution != "nearest_ancestor" {
        bail!("--mapper-resolution supports nearest_ancestor only");
    }
    common.missing_mapper_mode()?;
    common.missing_resource_key_mode()?;
    if !common.read_only {
        bail!("writable mode is not supported");
    }
    if !source_dir.is_dir() {
        bail!("source dir invalid: {}", source_dir.display());
    }
    if need_mount {
        let mount_dir = common.mount_dir()?;
        if !mount_dir.is_dir() {
            bail!("mount dir invalid: {}", mount_dir.display());
        }
    }
    match common.auth_backend.as_str() {
        "file" => {
            if common.permissions_file.is_none() && !common.allow_no_authz {
                bail!("file auth backend requires --permissions-file or --allow-no-authz");
            }
        }
        "spicedb" => {
            if common.spicedb_endpoint.as_deref().unwrap_or("").is_empty() {
                bail!("spicedb auth backend requires --spicedb-endpoint");
            }
            if common.subject.as_deref().unwrap_or("").is_empty() {
                bail!("spicedb auth backend requires --subject");
            }
        }
        other => bail!("--auth-backend must be file|spicedb, got {other}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_args(source_dir: &Path) -> CommonArgs {
        CommonArgs {
            source_dir: Some(source_dir.to_path_buf()),
            mount_dir: None,
            auth_backend: "file".to_string(),
            subject: None,
            read_only: true,
            allow_other: false,
            spicedb_endpoint: None,
            spicedb_token: None,
            spicedb_token_env: "SPICEDB_TOKEN".to_string(),
            spicedb_consistency: "minimize_latency".to_string(),
            index_dir: source_dir.join("cache"),
            index_format_version: 1,
            index_workers: 2,
            mapper_file_name: DEFAULT_MAPPER_FILE_NAME.to_string(),
            mapper_resolution: "nearest_ancestor".to_string(),
            mapper_inherit_parent: true,
            missing_mapper: "deny".to_string(),
            missing_resource_key: "deny".to_string(),
            permissions_file: None,
            allow_no_authz: true,
        }
    }

    #[test]
    fn validate_requires_source_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut args = test_args(dir.path());
        args.source_dir = None;
        assert!(validate(&args, false).is_err());
    }

    #[test]
    fn validate_requires_existing_mount_dir_when_mounting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut args = test_args(dir.path());
        assert!(validate(&args, true).is_err(), "missing mount dir");
        args.mount_dir = Some(dir.path().join("absent"));
        assert!(validate(&args, true).is_err(), "mount dir must exist");
        let mount = dir.path().join("mnt");
        std::fs::create_dir(&mount).expect("mkdir");
        args.mount_dir = Some(mount);
        assert!(validate(&args, true).is_ok());
    }

    #[test]
    fn validate_rejects_bad_enum_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut args = test_args(dir.path());
        args.missing_mapper = "maybe".to_string();
        assert!(validate(&args, false).is_err());

        let mut args = test_args(dir.path());
        args.missing_resource_key = "skip".to_string();
        assert!(validate(&args, false).is_err());

        let mut args = test_args(dir.path());
        args.mapper_resolution = "farthest_ancestor".to_string();
        assert!(validate(&args, false).is_err());

        let mut args = test_args(dir.path());
        args.auth_backend = "ldap".to_string();
        assert!(validate(&args, false).is_err());
    }

    #[test]
    fn validate_rejects_writable_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut args = test_args(dir.path());
        args.read_only = false;
        assert!(validate(&args, false).is_err());
    }

    #[test]
    fn file_backend_needs_permissions_or_explicit_no_authz() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut args = test_args(dir.path());
        args.allow_no_authz = false;
        assert!(validate(&args, false).is_err());
        args.permissions_file = Some(dir.path().join("permissions.json"));
        assert!(validate(&args, false).is_ok());
    }

    #[test]
    fn spicedb_backend_needs_endpoint_and_subject() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut args = test_args(dir.path());
        args.auth_backend = "spicedb".to_string();
        assert!(validate(&args, false).is_err(), "missing endpoint");
        args.spicedb_endpoint = Some("localhost:50051".to_string());
        assert!(validate(&args, false).is_err(), "missing subject");
        args.subject = Some("user:alice".to_string());
        assert!(validate(&args, false).is_ok());
    }

    #[test]
    fn index_options_carry_modes_and_cache_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut args = test_args(dir.path());
        args.missing_mapper = "passthrough".to_string();
        args.missing_resource_key = "ignore".to_string();
        let options = args.index_options().expect("options");
        assert_eq!(options.missing_mapper, MissingMapperMode::Passthrough);
        assert_eq!(options.missing_resource_key, MissingKeyMode::Ignore);
        assert_eq!(options.index_dir.as_deref(), Some(dir.path().join("cache").as_path()));
    }

    #[test]
    fn file_backend_without_permissions_denies_all() {
        let dir = tempfile::tempdir().expect("tempdir");
        let args = test_args(dir.path());
        let authorizer = args.build_authorizer().expect("authorizer");
        assert!(!authorizer.is_allowed(&metricfs_core::CandidateKey::new(
            "metric_row",
            "orders_1",
            "read"
        )));
    }
}
