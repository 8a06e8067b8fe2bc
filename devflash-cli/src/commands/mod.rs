//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod list;
pub(crate) mod update;
pub(crate) mod version;

use anyhow::Result;
use devflash::DetectedDevice;
use devflash::device::select_device;
use log::debug;

use crate::config::Config;
use crate::{Cli, CliError, was_interrupted};

pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Pick the device named by `--device`, the config file, or the first supported one.
pub(crate) fn select_target(cli: &Cli, config: &Config) -> Result<DetectedDevice> {
    let id = cli
        .device
        .as_deref()
        .or(config
            .device
            .id
            .as_deref())
        .map(devflash::parse_device_id)
        .transpose()?;

    let devices = devflash::detect_devices();
    debug!("{} USB devices attached", devices.len());
    Ok(select_device(&devices, id)?)
}
