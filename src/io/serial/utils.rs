// src/io/serial/utils.rs
//
// Line parameters (data bits, parity, stop bits) for opening a port, and the
// conversions from our config values to the serialport crate's types.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity as SpParity, SerialPortBuilder, StopBits};

use crate::settings::SerialSettings;

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl Default for Parity {
    fn default() -> Self {
        Parity::None
    }
}

impl Parity {
    fn letter(&self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        }
    }
}

/// Everything needed to open a port besides its path
#[derive(Clone, Debug, PartialEq)]
pub struct LineParams {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl LineParams {
    /// Line parameters from config, with the baud rate of this connection
    pub fn from_settings(settings: &SerialSettings, baud_rate: u32) -> Self {
        LineParams {
            baud_rate,
            data_bits: settings.data_bits,
            stop_bits: settings.stop_bits,
            parity: settings.parity,
        }
    }

    /// Apply data bits, stop bits and parity to a serialport builder
    pub fn apply(&self, builder: SerialPortBuilder) -> SerialPortBuilder {
        builder
            .data_bits(to_serialport_data_bits(self.data_bits))
            .stop_bits(to_serialport_stop_bits(self.stop_bits))
            .parity(to_serialport_parity(self.parity))
    }

    /// Compact form for logs, e.g. `9600 8-N-1`
    pub fn describe(&self) -> String {
        format!(
            "{} {}-{}-{}",
            self.baud_rate,
            self.data_bits,
            self.parity.letter(),
            self.stop_bits
        )
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

fn to_serialport_parity(p: Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

// ============================================================================
// Tests
// ============================================================================
