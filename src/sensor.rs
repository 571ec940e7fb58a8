//! Temperature source for a synchronization run.
//!
//! [`TemperatureSensor`] is the narrow interface the driver depends on. The
//! bundled implementation talks to a Microchip MCP9808 over async I2C.

use embedded_hal::i2c::{Error as _, ErrorKind};
use embedded_hal_async::i2c::I2c;

use crate::error::SensorError;

/// One fallible, non-retried temperature reading in whole degrees Fahrenheit.
#[allow(async_fn_in_trait)]
pub trait TemperatureSensor {
    async fn read_temperature(&mut self) -> Result<i32, SensorError>;
}

impl<S: TemperatureSensor + ?Sized> TemperatureSensor for &mut S {
    async fn read_temperature(&mut self) -> Result<i32, SensorError> {
        (**self).read_temperature().await
    }
}

/// How a fractional Fahrenheit value becomes a whole number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rounding {
    /// Drop the fraction, rounding toward zero.
    #[default]
    Truncate,
    /// Round to the nearest degree, halves away from zero.
    Nearest,
}

/// Converts a reading in 1/16 °C to whole °F.
///
/// Works in 1/80 °F so the conversion is exact before rounding:
/// `F * 80 = (C * 16) * 9 + 32 * 80`.
pub fn fahrenheit_from_sixteenths(sixteenths: i32, rounding: Rounding) -> Result<i32, SensorError> {
    let eightieths = sixteenths
        .checked_mul(9)
        .and_then(|v| v.checked_add(32 * 80))
        .ok_or(SensorError::OutOfRange)?;
    let adjusted = match rounding {
        Rounding::Truncate => eightieths,
        Rounding::Nearest => eightieths
            .checked_add(if eightieths < 0 { -40 } else { 40 })
            .ok_or(SensorError::OutOfRange)?,
    };
    Ok(adjusted / 80)
}

/// Default 7-bit address with A2..A0 tied low.
pub const MCP9808_DEFAULT_ADDRESS: u8 = 0x18;

const REG_AMBIENT_TEMPERATURE: u8 = 0x05;
const REG_MANUFACTURER_ID: u8 = 0x06;
const REG_DEVICE_ID: u8 = 0x07;
const MANUFACTURER_ID: u16 = 0x0054;
const DEVICE_ID: u8 = 0x04;

/// MCP9808 digital temperature sensor.
pub struct Mcp9808<I2C> {
    i2c: I2C,
    address: u8,
    rounding: Rounding,
}

impl<I2C: I2c> Mcp9808<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self {
            i2c,
            address: MCP9808_DEFAULT_ADDRESS,
            rounding: Rounding::default(),
        }
    }

    pub fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    pub fn with_rounding(mut self, rounding: Rounding) -> Self {
        self.rounding = rounding;
        self
    }

    /// Checks the manufacturer and device ID registers.
    pub async fn probe(&mut self) -> Result<(), SensorError> {
        let manufacturer = u16::from_be_bytes(self.read_register(REG_MANUFACTURER_ID).await?);
        let [device, revision] = self.read_register(REG_DEVICE_ID).await?;
        if manufacturer != MANUFACTURER_ID || device != DEVICE_ID {
            warn!(
                "unexpected device at {}: manufacturer {}, device {}",
                self.address, manufacturer, device
            );
            return Err(SensorError::UnknownDevice);
        }
        debug!("MCP9808 revision {} at {}", revision, self.address);
        Ok(())
    }

    /// Ambient temperature in 1/16 °C.
    pub async fn read_sixteenths(&mut self) -> Result<i32, SensorError> {
        let [upper, lower] = self.read_register(REG_AMBIENT_TEMPERATURE).await?;
        // Bits 15..13 are alert flags, bit 12 is the sign.
        let magnitude = (i32::from(upper & 0x0F) << 8) | i32::from(lower);
        Ok(if upper & 0x10 != 0 {
            magnitude - 4096
        } else {
            magnitude
        })
    }

    pub fn release(self) -> I2C {
        self.i2c
    }

    async fn read_register(&mut self, register: u8) -> Result<[u8; 2], SensorError> {
        let mut buf = [0u8; 2];
        self.i2c
            .write_read(self.address, &[register], &mut buf)
            .await
            .map_err(|e| {
                match e.kind() {
                    ErrorKind::NoAcknowledge(_) => warn!("no acknowledge from {}", self.address),
                    _ => warn!("i2c transaction with {} failed", self.address),
                }
                SensorError::Bus
            })?;
        Ok(buf)
    }
}

impl<I2C: I2c> TemperatureSensor for Mcp9808<I2C> {
    async fn read_temperature(&mut self) -> Result<i32, SensorError> {
        let sixteenths = self.read_sixteenths().await?;
        let fahrenheit = fahrenheit_from_sixteenths(sixteenths, self.rounding)?;
        trace!("ambient {} / 16 C, {} F", sixteenths, fahrenheit);
        Ok(fahrenheit)
    }
}
