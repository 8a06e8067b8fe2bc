//! Version command implementation.

use anyhow::Result;
use console::style;
use devflash::DeviceOptions;
use devflash::device::open_device;
use log::warn;

use super::{ensure_not_interrupted, select_target};
use crate::Cli;
use crate::config::Config;

/// Read the running firmware version of the selected device.
pub(crate) fn cmd_version(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let target = select_target(cli, config)?;
    ensure_not_interrupted()?;

    let mut device = open_device(&target, &DeviceOptions::default())?;
    device.probe()?;
    device.open()?;
    let version = device.setup();
    if let Err(e) = device.close() {
        warn!("Failed to close {}: {e}", target.label());
    }
    let version = version?;

    if json {
        let family = target
            .family
            .map(|f| f.name());
        let value = serde_json::json!({
            "device": target.descriptor.id_string(),
            "product": target.descriptor.product,
            "family": family,
            "version": version,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_default()
        );
        return Ok(());
    }

    match version {
        Some(version) => println!("{version}"),
        None => eprintln!(
            "{} {} does not report its firmware version",
            style("ℹ").blue(),
            target.label()
        ),
    }
    Ok(())
}
