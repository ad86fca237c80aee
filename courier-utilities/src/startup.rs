use log::info;

use crate::logger::{self, LogSettings};
use courier_models::errors::SendableError;

/// Install logging and the panic hook for a courier binary.
pub fn startup(name: &str, settings: &LogSettings) -> Result<(), SendableError> {
    logger::setup_logger(settings)?;
    log_panics::init();

    info!("--- {} ---", name);
    Ok(())
}
