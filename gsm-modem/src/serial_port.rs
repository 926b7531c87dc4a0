//! Line discipline for real serial devices, backed by the `serialport` crate.

use std::io::{self, Read, Write};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transport::{ByteStream, PortOpener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
pub enum StopBits {
    #[default]
    #[serde(rename = "1")]
    #[value(name = "1")]
    One,
    #[serde(rename = "2")]
    #[value(name = "2")]
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
    Software,
}

/// Serial line settings applied when the port is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSettings {
    pub baud_rate: u32,
    /// 5 through 8; anything else is treated as 8.
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl PortSettings {
    fn data_bits(&self) -> serialport::DataBits {
        match self.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        }
    }

    fn parity(&self) -> serialport::Parity {
        match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }

    // Legacy deployments configured the tty with the same flag for one and
    // two stop bits; here the two are distinct.
    fn stop_bits(&self) -> serialport::StopBits {
        match self.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }

    fn flow_control(&self) -> serialport::FlowControl {
        match self.flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
            FlowControl::Software => serialport::FlowControl::Software,
        }
    }
}

/// Opens device files such as `/dev/ttyUSB2` with the requested settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortOpener;

/// Upper bound for a single read; reads only happen once data is pending.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

impl PortOpener for SerialPortOpener {
    fn open(&self, port: &str, settings: &PortSettings) -> io::Result<Box<dyn ByteStream>> {
        debug!(port, ?settings, "opening serial port");
        let handle = serialport::new(port, settings.baud_rate)
            .data_bits(settings.data_bits())
            .parity(settings.parity())
            .stop_bits(settings.stop_bits())
            .flow_control(settings.flow_control())
            .timeout(READ_TIMEOUT)
            .open()?;

        Ok(Box::new(SerialDevice(handle)))
    }
}

struct SerialDevice(Box<dyn serialport::SerialPort>);

impl ByteStream for SerialDevice {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pending = self.0.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let len = pending.min(buf.len());

        self.0.read(&mut buf[..len])
    }

    fn write_all_flushed(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.write_all(data)?;
        self.0.flush()
    }
}
