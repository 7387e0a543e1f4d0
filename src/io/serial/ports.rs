// src/io/serial/ports.rs
//
// Serial device enumeration and the "which port is the board" heuristic.
// Enumeration sits behind `PortEnumerator` so the bridge can be driven by a
// scripted device list in tests.

use serde::Serialize;

use super::SerialError;

// ============================================================================
// Types
// ============================================================================

/// Information about an available serial port
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// A USB port with only a path and manufacturer, as most adapters report
    pub fn usb(port_name: &str, manufacturer: Option<&str>) -> Self {
        SerialPortInfo {
            port_name: port_name.to_string(),
            port_type: "USB".to_string(),
            manufacturer: manufacturer.map(|m| m.to_string()),
            product: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }

    /// True when the manufacturer string contains one of `vendors`, ignoring
    /// case. Blank vendor entries never match.
    pub fn matches_vendor(&self, vendors: &[String]) -> bool {
        let Some(manufacturer) = &self.manufacturer else {
            return false;
        };
        let manufacturer = manufacturer.to_lowercase();
        vendors
            .iter()
            .map(|v| v.trim().to_lowercase())
            .any(|v| !v.is_empty() && manufacturer.contains(&v))
    }
}

impl From<serialport::SerialPortInfo> for SerialPortInfo {
    fn from(port: serialport::SerialPortInfo) -> Self {
        let label = match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                return SerialPortInfo {
                    port_name: port.port_name,
                    port_type: "USB".to_string(),
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                    serial_number: usb.serial_number,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                }
            }
            serialport::SerialPortType::BluetoothPort => "Bluetooth",
            serialport::SerialPortType::PciPort => "PCI",
            serialport::SerialPortType::Unknown => "Unknown",
        };
        SerialPortInfo {
            port_type: label.to_string(),
            ..SerialPortInfo::usb(&port.port_name, None)
        }
    }
}

/// Device enumeration capability
pub trait PortEnumerator: Send + Sync {
    /// Ports in OS enumeration order
    fn list_ports(&self) -> Result<Vec<SerialPortInfo>, SerialError>;
}

// ============================================================================
// Detection
// ============================================================================

/// Pick the port the bridge should monitor: the first one made by a known
/// vendor, otherwise the first one enumerated. With several matching
/// adapters plugged in the first one wins.
pub fn detect_device<'a>(
    ports: &'a [SerialPortInfo],
    known_vendors: &[String],
) -> Option<&'a SerialPortInfo> {
    ports
        .iter()
        .find(|port| port.matches_vendor(known_vendors))
        .or_else(|| ports.first())
}

// ============================================================================
// System enumeration
// ============================================================================

/// macOS lists each device twice. Opening `/dev/tty.*` waits for carrier
/// detect, so only the `/dev/cu.*` twin is offered.
fn is_listable(port_name: &str) -> bool {
    !(cfg!(target_os = "macos") && port_name.starts_with("/dev/tty."))
}

/// Enumerates real devices through the serialport crate
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn list_ports(&self) -> Result<Vec<SerialPortInfo>, SerialError> {
        let ports =
            serialport::available_ports().map_err(|e| SerialError::Enumerate(e.to_string()))?;
        Ok(ports
            .into_iter()
            .filter(|p| is_listable(&p.port_name))
            .map(SerialPortInfo::from)
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn vendors() -> Vec<String> {
        crate::settings::SerialSettings::default().known_vendors
    }

    #[test]
    fn test_single_matching_device() {
        let ports = vec![SerialPortInfo::usb("/dev/ttyUSB0", Some("FTDI"))];
        let chosen = detect_device(&ports, &vendors()).expect("device");
        assert_eq!(chosen.port_name, "/dev/ttyUSB0");
    }

    #[test]
    fn test_matching_device_preferred_over_first() {
        let ports = vec![
            SerialPortInfo::usb("/dev/ttyS0", Some("Intel")),
            SerialPortInfo::usb("/dev/ttyUSB1", Some("FTDI")),
        ];
        let chosen = detect_device(&ports, &vendors()).expect("device");
        assert_eq!(chosen.port_name, "/dev/ttyUSB1");
    }

    #[test]
    fn test_match_is_case_insensitive_substring() {
        let ports = vec![
            SerialPortInfo::usb("/dev/ttyS0", None),
            SerialPortInfo::usb("/dev/ttyUSB3", Some("wch.cn ch340 serial")),
        ];
        let chosen = detect_device(&ports, &vendors()).expect("device");
        assert_eq!(chosen.port_name, "/dev/ttyUSB3");
    }

    #[test]
    fn test_falls_back_to_first_port() {
        let ports = vec![
            SerialPortInfo::usb("/dev/ttyS0", Some("Intel")),
            SerialPortInfo::usb("/dev/ttyS1", None),
        ];
        let chosen = detect_device(&ports, &vendors()).expect("device");
        assert_eq!(chosen.port_name, "/dev/ttyS0");
    }

    #[test]
    fn test_first_match_wins_tie() {
        let ports = vec![
            SerialPortInfo::usb("/dev/ttyACM0", Some("Arduino LLC")),
            SerialPortInfo::usb("/dev/ttyUSB0", Some("FTDI")),
        ];
        let chosen = detect_device(&ports, &vendors()).expect("device");
        assert_eq!(chosen.port_name, "/dev/ttyACM0");
    }

    #[test]
    fn test_no_ports() {
        assert!(detect_device(&[], &vendors()).is_none());
    }

    #[test]
    fn test_empty_vendor_entry_never_matches() {
        let ports = vec![
            SerialPortInfo::usb("/dev/ttyS0", Some("Intel")),
            SerialPortInfo::usb("/dev/ttyUSB0", Some("FTDI")),
        ];
        let chosen = detect_device(&ports, &[String::new()]).expect("device");
        assert_eq!(chosen.port_name, "/dev/ttyS0");
    }

    #[test]
    fn test_vendor_match_ignores_case_and_padding() {
        let port = SerialPortInfo::usb("/dev/ttyUSB0", Some("Silicon Labs CP210x"));
        assert!(port.matches_vendor(&[" silicon labs ".to_string()]));
        assert!(!port.matches_vendor(&["FTDI".to_string(), "  ".to_string()]));
        assert!(!SerialPortInfo::usb("/dev/ttyS0", None).matches_vendor(&vendors()));
    }

    #[test]
    fn test_system_port_conversion() {
        let usb = serialport::SerialPortInfo {
            port_name: "/dev/ttyACM0".to_string(),
            port_type: serialport::SerialPortType::UsbPort(serialport::UsbPortInfo {
                vid: 0x2341,
                pid: 0x0043,
                serial_number: Some("8573".to_string()),
                manufacturer: Some("Arduino (www.arduino.cc)".to_string()),
                product: Some("Uno".to_string()),
            }),
        };
        let info = SerialPortInfo::from(usb);
        assert_eq!(info.port_type, "USB");
        assert_eq!(info.vid, Some(0x2341));
        assert_eq!(info.product.as_deref(), Some("Uno"));
        assert!(info.matches_vendor(&vendors()));

        let bt = SerialPortInfo::from(serialport::SerialPortInfo {
            port_name: "/dev/rfcomm0".to_string(),
            port_type: serialport::SerialPortType::BluetoothPort,
        });
        assert_eq!(bt.port_type, "Bluetooth");
        assert_eq!(bt.port_name, "/dev/rfcomm0");
        assert!(bt.manufacturer.is_none() && bt.vid.is_none());
    }

    #[test]
    fn test_listable_ports() {
        assert!(is_listable("/dev/ttyUSB0"));
        assert!(is_listable("/dev/cu.usbserial-1410"));
        assert_eq!(is_listable("/dev/tty.usbserial-1410"), !cfg!(target_os = "macos"));
    }

    #[test]
    fn test_port_info_serialises_camel_case() {
        let json = serde_json::to_value(SerialPortInfo::usb("COM3", Some("FTDI"))).unwrap();
        assert_eq!(json["portName"], "COM3");
        assert_eq!(json["portType"], "USB");
        assert_eq!(json["manufacturer"], "FTDI");
    }
}
