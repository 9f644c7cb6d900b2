//! `metricfs validate-flags`: parse and validate without side effects.

use crate::exit_codes::CliFailure;
use crate::flags::{self, CommonArgs};

/// Validates the full flag set, including mount fields.
pub fn run(common: &CommonArgs) -> Result<(), CliFailure> {
    flags::validate(common, true).map_err(CliFailure::config)
}
