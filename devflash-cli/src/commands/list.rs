//! Device listing.

use console::style;
use devflash::DetectedDevice;

/// List attached devices, supported ones only unless `all` is set.
pub(crate) fn cmd_list(json: bool, all: bool) {
    let detected: Vec<DetectedDevice> = devflash::detect_devices()
        .into_iter()
        .filter(|d| all || d.is_supported())
        .collect();

    if json {
        let devices: Vec<serde_json::Value> = detected
            .iter()
            .map(device_json)
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&devices).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("USB devices").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No supported devices found").dim());
        return;
    }

    for device in &detected {
        let family = match device.family {
            Some(family) => format!(" [{}]", style(family).yellow()),
            None => String::new(),
        };
        let product = device
            .descriptor
            .product
            .as_deref()
            .unwrap_or("");

        eprintln!(
            "  {} {}{}{}",
            style("•").green(),
            style(device.descriptor.id_string()).cyan(),
            family,
            if !product.is_empty() {
                format!(" - {}", style(product).dim())
            } else {
                String::new()
            }
        );
    }
}

fn device_json(device: &DetectedDevice) -> serde_json::Value {
    let descriptor = &device.descriptor;
    serde_json::json!({
        "vid": descriptor.vendor_id,
        "pid": descriptor.product_id,
        "bus": descriptor.bus_id,
        "address": descriptor.address,
        "manufacturer": descriptor.manufacturer,
        "product": descriptor.product,
        "serial": descriptor.serial,
        "family": device.family.map(|f| f.name()),
        "supported": device.is_supported(),
    })
}
