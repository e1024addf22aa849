use std::fmt;
use thiserror::Error;

/// Number of numeric fields that follow the device address on a hub line.
pub const RAW_FIELD_COUNT: usize = 6;

const BATTERY_SCALE: f64 = 256.0;
const TEMPERATURE_SCALE: f64 = 100.0;
const PRESSURE_SCALE: f64 = 10000.0;
const HUMIDITY_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("expected 6 numeric fields, got {0}")]
    FieldCountMismatch(usize),
    #[error("field {field} is not an integer: {value:?}")]
    NotAnInteger { field: &'static str, value: String },
}

/// One sensor sample as reported by the concentrator.
///
/// Measurements are kept in the raw units the hub transmits; the scaled
/// accessors divide once per call so no rounding error accumulates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    address: String,
    rssi: i32,
    cpu_temperature_raw: i64,
    battery_raw: i64,
    temperature_raw: i64,
    pressure_raw: i64,
    humidity_raw: i64,
}

impl Record {
    /// Decodes the six numeric fields (rssi, cpu temperature, battery,
    /// temperature, pressure, humidity) of a line whose address was already
    /// validated.
    pub fn decode_raw_fields<S: AsRef<str>>(
        address: impl Into<String>,
        raw_fields: &[S],
    ) -> Result<Record, DecodeError> {
        if raw_fields.len() != RAW_FIELD_COUNT {
            return Err(DecodeError::FieldCountMismatch(raw_fields.len()));
        }

        Ok(Record {
            address: address.into(),
            rssi: parse_integer("rssi", raw_fields[0].as_ref())?,
            cpu_temperature_raw: parse_integer("cpu_temp", raw_fields[1].as_ref())?,
            battery_raw: parse_integer("battery_volt", raw_fields[2].as_ref())?,
            temperature_raw: parse_integer("temp", raw_fields[3].as_ref())?,
            pressure_raw: parse_integer("pressure", raw_fields[4].as_ref())?,
            humidity_raw: parse_integer("humidity", raw_fields[5].as_ref())?,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn rssi(&self) -> i32 {
        self.rssi
    }

    /// CPU temperature in °C, transmitted unscaled.
    pub fn cpu_temperature(&self) -> f64 {
        self.cpu_temperature_raw as f64
    }

    /// Battery voltage in V.
    pub fn battery_voltage(&self) -> f64 {
        self.battery_raw as f64 / BATTERY_SCALE
    }

    /// Temperature in °C.
    pub fn temperature(&self) -> f64 {
        self.temperature_raw as f64 / TEMPERATURE_SCALE
    }

    /// Pressure in hPa.
    pub fn pressure(&self) -> f64 {
        self.pressure_raw as f64 / PRESSURE_SCALE
    }

    /// Relative humidity in %.
    pub fn humidity(&self) -> f64 {
        self.humidity_raw as f64 / HUMIDITY_SCALE
    }

    /// The six named samples pushed to the remote sink, in push order.
    pub fn samples(&self) -> [(Channel, f64); 6] {
        Channel::ALL.map(|channel| (channel, self.value(channel)))
    }

    /// Scaled value reported on `channel`.
    pub fn value(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Rssi => self.rssi as f64,
            Channel::CpuTemp => self.cpu_temperature(),
            Channel::BatteryVolt => self.battery_voltage(),
            Channel::Temp => self.temperature(),
            Channel::Pressure => self.pressure(),
            Channel::Humidity => self.humidity(),
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "address = {}, rssi = {}, cpu_temp = {:.2}, battery_volt = {:.2}, temp = {:.2}, pressure = {:.4}, humidity = {:.2}",
            self.address,
            self.rssi,
            self.cpu_temperature(),
            self.battery_voltage(),
            self.temperature(),
            self.pressure(),
            self.humidity()
        )
    }
}

fn parse_integer<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, DecodeError> {
    value.parse::<T>().map_err(|_| DecodeError::NotAnInteger {
        field,
        value: value.to_string(),
    })
}

/// Named metric stream accepted by the remote sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Rssi,
    CpuTemp,
    BatteryVolt,
    Temp,
    Pressure,
    Humidity,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Rssi,
        Channel::CpuTemp,
        Channel::BatteryVolt,
        Channel::Temp,
        Channel::Pressure,
        Channel::Humidity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Rssi => "rssi",
            Channel::CpuTemp => "cpu_temp",
            Channel::BatteryVolt => "battery_volt",
            Channel::Temp => "temp",
            Channel::Pressure => "pressure",
            Channel::Humidity => "humidity",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
