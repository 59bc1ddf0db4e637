//! Audio device enumeration
//!
//! Lists output devices from every available host so callers can pick a
//! specific card rather than whatever the default host exposes.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Host, HostId};

use super::config::DeviceId;
use super::error::{AudioError, AudioResult};

/// Human-readable name for a host id
fn host_name(host_id: HostId) -> String {
    let name = format!("{:?}", host_id);
    match name.as_str() {
        "Alsa" => "ALSA".to_string(),
        "Jack" => "JACK".to_string(),
        "Wasapi" => "WASAPI".to_string(),
        _ => name,
    }
}

fn host_by_name(name: &str) -> Option<Host> {
    for host_id in cpal::available_hosts() {
        if host_name(host_id) == name {
            return cpal::host_from_id(host_id).ok();
        }
    }
    None
}

/// Information about one output device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Identifier for [`super::AudioConfig`]
    pub id: DeviceId,
    pub name: String,
    /// Host backend name (e.g. "ALSA", "WASAPI")
    pub host: String,
    /// Whether this is its host's default output
    pub is_default: bool,
    /// Maximum output channels
    pub max_channels: u16,
}

/// All output devices across every available host
pub fn output_devices() -> AudioResult<Vec<AudioDevice>> {
    let mut all_devices = Vec::new();

    for host_id in cpal::available_hosts() {
        let host = match cpal::host_from_id(host_id) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("could not initialize host {:?}: {}", host_id, e);
                continue;
            }
        };
        let host_label = host_name(host_id);
        let default_name = host
            .default_output_device()
            .and_then(|d: cpal::Device| d.name().ok());

        let devices = match host.output_devices() {
            Ok(d) => d,
            Err(e) => {
                log::debug!("could not enumerate devices for {:?}: {}", host_id, e);
                continue;
            }
        };

        for device in devices {
            let Ok(name) = device.name() else { continue };
            let configs: Vec<_> = match device.supported_output_configs() {
                Ok(c) => c.collect(),
                Err(_) => continue,
            };
            if configs.is_empty() {
                continue;
            }
            let max_channels = configs.iter().map(|c| c.channels()).max().unwrap_or(0);

            all_devices.push(AudioDevice {
                id: DeviceId::with_host(&name, &host_label),
                is_default: default_name.as_ref() == Some(&name),
                name,
                host: host_label.clone(),
                max_channels,
            });
        }
    }

    if all_devices.is_empty() {
        return Err(AudioError::NoDevices);
    }
    Ok(all_devices)
}

/// Resolve a configured device id to a cpal device
pub(crate) fn find_device(id: &DeviceId) -> AudioResult<cpal::Device> {
    let host = match &id.host {
        Some(name) => {
            host_by_name(name).ok_or_else(|| AudioError::DeviceNotFound(id.display_label()))?
        }
        None => cpal::default_host(),
    };

    let devices = host
        .output_devices()
        .map_err(|e| AudioError::NoDefaultDevice(e.to_string()))?;
    for device in devices {
        if device.name().map(|n| n == id.name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(id.display_label()))
}

/// The default host's default output device
pub(crate) fn default_device() -> AudioResult<cpal::Device> {
    cpal::default_host()
        .default_output_device()
        .ok_or(AudioError::NoDevices)
}
