// Finding controllers among the serial ports
//
// Cubes enumerate as FTDI USB serial devices whose product string contains
// "APT" and whose USB serial number is the controller's serial. When the USB
// descriptor doesn't carry it, each candidate is opened and asked for HW_GET_INFO.

use serialport::{SerialPortInfo, SerialPortType};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::apt::{AptBus, Frame, GENERIC_USB, HwInfo, MessageId, Result, StageError};
use super::link::SerialLink;
use crate::wait::BoundedWait;

/// Upper bound on how long one port may take to identify itself
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// A controller found on a serial port
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub port: String,
    pub serial: String,
    pub model: String,
    pub channels: u16,
    pub firmware: String,
}

/// Does this port look like an APT controller?
///
/// Only Thorlabs/APT descriptor strings count; the FTDI vendor id is shared
/// with every other USB serial adapter.
pub fn is_apt_candidate(info: &SerialPortInfo) -> bool {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            let product_says_apt = usb
                .product
                .as_deref()
                .is_some_and(|p| p.contains("APT") || p.contains("Kinesis"));
            let thorlabs = usb
                .manufacturer
                .as_deref()
                .is_some_and(|m| m.contains("Thorlabs"));
            product_says_apt || thorlabs
        }
        _ => false,
    }
}

/// Serial number from the USB descriptor, if any.
///
/// Some platforms append a channel letter to FTDI serials ("27005375A").
fn usb_serial(info: &SerialPortInfo) -> Option<&str> {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => usb
            .serial_number
            .as_deref()
            .map(|s| s.trim_end_matches(|c: char| c.is_ascii_alphabetic())),
        _ => None,
    }
}

/// Pick the port whose controller has `serial`.
///
/// Ports whose USB descriptor names the serial win outright; otherwise every
/// APT candidate is handed to `probe`, which returns the serial it reports.
pub fn locate_in<P>(ports: &[SerialPortInfo], serial: &str, mut probe: P) -> Result<String>
where
    P: FnMut(&str) -> Option<String>,
{
    if let Some(port) = ports.iter().find(|p| usb_serial(p) == Some(serial)) {
        debug!("Matched {} to {} by USB descriptor", serial, port.port_name);
        return Ok(port.port_name.clone());
    }

    for port in ports.iter().filter(|p| is_apt_candidate(p)) {
        match probe(&port.port_name) {
            Some(found) if found == serial => {
                debug!("Matched {} to {} by probing", serial, port.port_name);
                return Ok(port.port_name.clone());
            }
            Some(found) => debug!("{} belongs to controller {}", port.port_name, found),
            None => debug!("{} did not answer HW_REQ_INFO", port.port_name),
        }
    }

    Err(StageError::DeviceNotFound {
        serial: serial.to_string(),
    })
}

/// Find the port of the controller with `serial`
pub fn locate(serial: &str) -> Result<String> {
    let ports = serialport::available_ports()?;
    locate_in(&ports, serial, |port| match probe(port) {
        Ok(info) => Some(info.serial_number.to_string()),
        Err(e) => {
            debug!("Probe of {} failed: {}", port, e);
            None
        }
    })
}

/// Open a port briefly and ask whoever is there for hardware info
pub fn probe(port: &str) -> Result<HwInfo> {
    let link = SerialLink::open(port)?;
    let mut bus = AptBus::new(Box::new(link), GENERIC_USB);
    let request = Frame::short(MessageId::HwReqInfo, 0, 0, GENERIC_USB);
    let reply = bus.transact(request, MessageId::HwGetInfo, &BoundedWait::new(PROBE_TIMEOUT))?;
    HwInfo::parse(&reply.data)
}

/// Probe every APT candidate port
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let ports = serialport::available_ports()?;
    let mut devices = Vec::new();

    for port in ports.iter().filter(|p| is_apt_candidate(p)) {
        match probe(&port.port_name) {
            Ok(info) => {
                info!(
                    "Found {} serial {} on {}",
                    info.model, info.serial_number, port.port_name
                );
                devices.push(DeviceInfo {
                    port: port.port_name.clone(),
                    serial: info.serial_number.to_string(),
                    model: info.model.clone(),
                    channels: info.channels,
                    firmware: info.firmware_version(),
                });
            }
            Err(e) => warn!("{} looks like an APT port but did not answer: {}", port.port_name, e),
        }
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    const FTDI_VID: u16 = 0x0403;

    fn usb_port(name: &str, serial: Option<&str>, product: &str) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: FTDI_VID,
                pid: 0xFAF0,
                serial_number: serial.map(str::to_string),
                manufacturer: Some("Thorlabs".to_string()),
                product: Some(product.to_string()),
            }),
        }
    }

    fn other_port(name: &str) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::PciPort,
        }
    }

    #[test]
    fn test_match_by_usb_serial() {
        let ports = [
            usb_port("/dev/ttyUSB0", Some("27005349"), "Kinesis K-Cube  DC Driver"),
            usb_port("/dev/ttyUSB1", Some("27005375"), "Kinesis K-Cube  DC Driver"),
        ];
        let port = locate_in(&ports, "27005375", |_| panic!("should not probe")).unwrap();
        assert_eq!(port, "/dev/ttyUSB1");
    }

    #[test]
    fn test_channel_letter_ignored() {
        let ports = [usb_port("COM14", Some("27005375A"), "APT DC Motor Controller")];
        assert_eq!(locate_in(&ports, "27005375", |_| None).unwrap(), "COM14");
    }

    #[test]
    fn test_match_by_probe() {
        let ports = [
            usb_port("/dev/ttyUSB0", None, "APT DC Motor Controller"),
            usb_port("/dev/ttyUSB1", None, "APT DC Motor Controller"),
        ];
        let port = locate_in(&ports, "27005349", |name| {
            Some(if name.ends_with('1') { "27005349" } else { "27005375" }.to_string())
        })
        .unwrap();
        assert_eq!(port, "/dev/ttyUSB1");
    }

    #[test]
    fn test_plain_ftdi_adapter_is_never_probed() {
        let adapter = SerialPortInfo {
            port_name: "/dev/ttyUSB2".to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: FTDI_VID,
                pid: 0x6001,
                serial_number: Some("A50285BI".to_string()),
                manufacturer: Some("FTDI".to_string()),
                product: Some("FT232R USB UART".to_string()),
            }),
        };
        assert!(!is_apt_candidate(&adapter));

        let err = locate_in(&[adapter], "27005375", |name| panic!("probed {}", name)).unwrap_err();
        assert!(matches!(err, StageError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_missing_serial_is_device_not_found() {
        let ports = [
            usb_port("/dev/ttyUSB0", Some("27005375"), "APT DC Motor Controller"),
            other_port("/dev/ttyS0"),
        ];
        let err = locate_in(&ports, "27000001", |_| Some("27005375".to_string())).unwrap_err();
        assert!(matches!(err, StageError::DeviceNotFound { ref serial } if serial == "27000001"));
    }

    #[test]
    fn test_no_ports_is_device_not_found() {
        let err = locate_in(&[], "27000001", |_| None).unwrap_err();
        assert!(matches!(err, StageError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_non_usb_ports_never_probed() {
        let ports = [other_port("/dev/ttyS0"), other_port("/dev/ttyS1")];
        let mut probed = 0;
        let result = locate_in(&ports, "27000001", |_| {
            probed += 1;
            None
        });
        assert!(result.is_err());
        assert_eq!(probed, 0);
    }
}
