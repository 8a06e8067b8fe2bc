//! Update command implementation.

use anyhow::{Context, Result};
use console::style;
use devflash::device::open_device;
use devflash::{
    DetectedDevice, DeviceFamily, DeviceOptions, FirmwareDevice, FirmwareImage, GnpConfig,
    GnpWriteOptions,
};
use dialoguer::{Confirm, Error as DialoguerError, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use std::io::IsTerminal;
use std::path::Path;

use super::{ensure_not_interrupted, select_target};
use crate::config::Config;
use crate::{Cli, CliError, parse_fw_version, use_fancy_output};

/// Arguments of `devflash update`.
pub(crate) struct UpdateArgs<'a> {
    pub(crate) firmware: &'a Path,
    pub(crate) partitions: &'a [u8],
    pub(crate) fw_version: Option<[u8; 3]>,
    pub(crate) preload: Option<u16>,
    pub(crate) yes: bool,
}

/// Update command implementation.
pub(crate) fn cmd_update(cli: &Cli, config: &Config, args: &UpdateArgs<'_>) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            args.firmware
                .display()
        );
    }

    let image = FirmwareImage::from_file(args.firmware)
        .with_context(|| format!("failed to load firmware {}", args.firmware.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} {} bytes, CRC32 0x{:08X}",
            style("ℹ").blue(),
            image.len(),
            image.crc32()
        );
    }

    let options = device_options(config, args)?;
    let target = select_target(cli, config)?;
    let family = target
        .family
        .ok_or_else(|| CliError::Usage(format!("{} is not supported", target.label())))?;
    if family == DeviceFamily::Gnp
        && options
            .gnp_write
            .version
            .is_none()
    {
        return Err(CliError::Usage("dock updates need --fw-version A.B.C".to_string()).into());
    }

    if !cli.quiet {
        eprintln!(
            "{} Using {} ({family})",
            style("🔌").cyan(),
            target.label()
        );
    }

    confirm_update(cli, args.yes, &target)?;
    ensure_not_interrupted()?;

    let mut device = open_device(&target, &options)?;
    device.probe()?;
    device.open()?;

    let result = write_image(cli, &mut *device, &image);
    if let Err(e) = device.close() {
        warn!("Failed to close {}: {e}", target.label());
    }
    result?;

    if !cli.quiet {
        eprintln!("\n{} Update completed", style("🎉").green().bold());
    }

    Ok(())
}

/// Merge command-line arguments over the config file.
fn device_options(config: &Config, args: &UpdateArgs<'_>) -> Result<DeviceOptions> {
    let partitions = if !args
        .partitions
        .is_empty()
    {
        args.partitions
            .to_vec()
    } else if !config
        .update
        .partitions
        .is_empty()
    {
        config
            .update
            .partitions
            .clone()
    } else {
        GnpWriteOptions::default().partitions
    };

    let version = match (
        args.fw_version,
        config
            .update
            .fw_version
            .as_deref(),
    ) {
        (Some(version), _) => Some(version),
        (None, Some(text)) => Some(
            parse_fw_version(text)
                .map_err(|e| CliError::Usage(format!("invalid fw_version in config: {e}")))?,
        ),
        (None, None) => None,
    };

    let mut gnp = GnpConfig::default();
    if let Some(preload) = args
        .preload
        .or(config.update.preload)
    {
        gnp = gnp.with_preload_count(preload);
    }

    Ok(DeviceOptions {
        gnp,
        gnp_write: GnpWriteOptions {
            partitions,
            version,
        },
        ..DeviceOptions::default()
    })
}

fn confirm_update(cli: &Cli, yes: bool, target: &DetectedDevice) -> Result<()> {
    if yes || cli.non_interactive {
        return Ok(());
    }
    if !(std::io::stdin().is_terminal() && std::io::stderr().is_terminal()) {
        return Err(CliError::Usage(
            "confirmation needs a terminal, pass --yes to skip it".to_string(),
        )
        .into());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Write firmware to {}?", target.label()))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(())
    } else {
        Err(CliError::Cancelled("update cancelled".to_string()).into())
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("update cancelled".to_string()).into()
            } else {
                CliError::Usage(format!("prompt failed: {io_err}")).into()
            }
        },
    }
}

fn write_image(cli: &Cli, device: &mut dyn FirmwareDevice, image: &FirmwareImage) -> Result<()> {
    if let Some(version) = device.setup()? {
        if !cli.quiet {
            eprintln!("{} Running firmware {version}", style("ℹ").blue());
        }
    }

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let mut current_step = String::new();
    let result = device.write_firmware(image, &mut |step: &str, current: usize, total: usize| {
        if step != current_step {
            current_step = step.to_string();
            pb.set_message(step_label(step));
        }
        if total > 0 {
            pb.set_position((current * 100 / total) as u64);
        }
    });

    match result {
        Ok(()) => {
            pb.finish_with_message("Complete");
            Ok(())
        },
        Err(e) => {
            pb.abandon();
            Err(e).context("firmware update failed")
        },
    }
}

/// Human-readable name of a progress step.
fn step_label(step: &str) -> String {
    match step {
        "erase" => "Erasing".to_string(),
        "write" | "device-write-blocks" => "Writing".to_string(),
        "verify" => "Verifying".to_string(),
        "init" => "Starting transfer".to_string(),
        "end-transfer" => "Finishing transfer".to_string(),
        "uninit" => "Closing transfer".to_string(),
        other => other.to_string(),
    }
}
