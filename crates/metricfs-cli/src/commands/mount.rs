//! `metricfs mount`: serve the filtered view through FUSE.

use crate::exit_codes::CliFailure;
use crate::flags::{self, CommonArgs};
use crate::fusefs::{self, MountConfig};

/// Validates flags, builds the authorizer, and serves the mount until it
/// is unmounted. Configuration problems exit 2; mount failures exit 3.
pub fn run(common: &CommonArgs) -> Result<(), CliFailure> {
    flags::validate(common, true).map_err(CliFailure::config)?;
    let authorizer = common.build_authorizer().map_err(CliFailure::config)?;
    let render = common.index_options().map_err(CliFailure::config)?;
    let source_dir = common
        .source_dir()
        .map_err(CliFailure::config)?
        .to_path_buf();
    let mount_dir = common
        .mount_dir()
        .map_err(CliFailure::config)?
        .to_path_buf();

    println!("mounted metricfs at {}", mount_dir.display());
    fusefs::mount_and_serve(
        MountConfig {
            source_dir,
            mount_dir,
            allow_other: common.allow_other,
            render,
        },
        authorizer,
    )
    .map_err(CliFailure::mount)
}
