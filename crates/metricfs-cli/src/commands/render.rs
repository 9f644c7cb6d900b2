//! `metricfs render`: stream one file's filtered projection to stdout.

use std::io::Write;
use std::path::Path;

use metricfs_core::project;

use crate::exit_codes::CliFailure;
use crate::flags::{self, CommonArgs};

/// Renders the filtered projection of `file` to stdout. The source
/// directory defaults to the file's parent when not given.
pub fn run(common: &CommonArgs, file: &Path) -> Result<(), CliFailure> {
    let mut common = common.clone();
    if common.source_dir.is_none() {
        common.source_dir = file.parent().map(Path::to_path_buf);
    }
    flags::validate(&common, false).map_err(CliFailure::config)?;
    let authorizer = common.build_authorizer().map_err(CliFailure::config)?;
    let options = common.index_options().map_err(CliFailure::config)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    project::render_filtered(file, &options, authorizer.as_ref(), &mut out)
        .map_err(CliFailure::config)?;
    out.flush().map_err(CliFailure::config)?;
    Ok(())
}
