//! Weather station decoding.
//!
//! The station's sensors share one field node and are told apart by their
//! 485 address, the first byte of every reply. Each sensor answers a
//! two-register read with the standard Modbus reply layout.

use serde_json::{Map, Value};
use tracing::trace;

use edgelink_common::NODE_SERIAL_KEY;

use crate::config::WeatherStationConfig;
use crate::frame::{FrameError, ReadReply};

/// Wind direction names, indexed by the sensor's raw value.
pub const COMPASS: [&str; 8] = [
    "北风",
    "东北风",
    "东风",
    "东南风",
    "南风",
    "西南风",
    "西风",
    "西北风",
];

/// Error type for weather replies.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WeatherError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("No weather sensor configured at 485 address {0}")]
    UnknownSensor(u8),
    #[error("Reply from sensor {0} is missing register data")]
    MissingData(u8),
    #[error("Wind direction {0} is out of range")]
    Direction(u16),
}

/// One decoded sensor reading.
#[derive(Debug, Clone, PartialEq)]
pub enum WeatherReading {
    /// Temperature (°C) and relative humidity (%).
    Climate { temperature: f64, humidity: f64 },
    WindDirection(&'static str),
    /// Wind speed (m/s).
    WindSpeed(f64),
}

impl WeatherReading {
    /// Event parameters for this reading.
    pub fn to_params(&self, serial: &str) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert(NODE_SERIAL_KEY.to_string(), Value::from(serial));
        match *self {
            Self::Climate {
                temperature,
                humidity,
            } => {
                params.insert("temperature".to_string(), Value::from(temperature));
                params.insert("humidity".to_string(), Value::from(humidity));
            }
            Self::WindDirection(direction) => {
                params.insert("windDirection".to_string(), Value::from(direction));
            }
            Self::WindSpeed(speed) => {
                params.insert("windSpeed".to_string(), Value::from(speed));
            }
        }
        params
    }
}

/// Decoder for the configured weather station.
#[derive(Debug, Clone)]
pub struct WeatherStation {
    config: WeatherStationConfig,
}

impl WeatherStation {
    pub fn new(config: WeatherStationConfig) -> Self {
        Self { config }
    }

    /// Whether a reply from `devaddr` comes from the station.
    pub fn matches(&self, devaddr: &str) -> bool {
        self.config.devaddr.eq_ignore_ascii_case(devaddr)
    }

    /// Serial reported on weather events.
    pub fn report_serial(&self) -> &str {
        &self.config.report_serial
    }

    /// Decode one sensor reply.
    pub fn decode(&self, bytes: &[u8], verify_crc: bool) -> Result<WeatherReading, WeatherError> {
        let reply = ReadReply::parse(bytes, verify_crc)?;
        let sensor = reply.address;
        let word = |index| reply.word(index).ok_or(WeatherError::MissingData(sensor));

        if Some(sensor) == self.config.temp_humi_addr {
            let humidity = word(0)?;
            let temperature = word(1)? as i16;
            trace!("Raw temperature {} humidity {:#x}", temperature, humidity);
            Ok(WeatherReading::Climate {
                temperature: f64::from(temperature) / 10.0,
                humidity: f64::from(humidity) / 10.0,
            })
        } else if Some(sensor) == self.config.wind_dir_addr {
            let raw = word(0)?;
            trace!("Raw wind direction {}", raw);
            COMPASS
                .get(raw as usize)
                .map(|&name| WeatherReading::WindDirection(name))
                .ok_or(WeatherError::Direction(raw))
        } else if Some(sensor) == self.config.wind_speed_addr {
            let raw = word(0)?;
            trace!("Raw wind speed {:#x}", raw);
            Ok(WeatherReading::WindSpeed(f64::from(raw) / 10.0))
        } else {
            Err(WeatherError::UnknownSensor(sensor))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::crc16;

    fn station() -> WeatherStation {
        WeatherStation::new(WeatherStationConfig {
            devaddr: "7076E8FF".to_string(),
            temp_humi_addr: Some(1),
            wind_dir_addr: Some(2),
            wind_speed_addr: Some(3),
            report_serial: "00000000".to_string(),
        })
    }

    fn reply(address: u8, words: &[u16]) -> Vec<u8> {
        let mut bytes = vec![address, 0x03, (words.len() * 2) as u8];
        for word in words {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    #[test]
    fn test_climate_reading() {
        let reading = station().decode(&reply(1, &[0x0118, 0x00F5]), true).unwrap();
        assert_eq!(
            reading,
            WeatherReading::Climate {
                temperature: 24.5,
                humidity: 28.0
            }
        );

        let params = reading.to_params("00000000");
        let keys: Vec<&str> = params.keys().map(String::as_str).collect();
        assert_eq!(keys, vec![NODE_SERIAL_KEY, "temperature", "humidity"]);
        assert_eq!(params["humidity"], 28.0);
        assert_eq!(params["temperature"], 24.5);
    }

    #[test]
    fn test_negative_temperature() {
        let reading = station().decode(&reply(1, &[0x0200, 0xFF9C]), true).unwrap();
        assert_eq!(
            reading,
            WeatherReading::Climate {
                temperature: -10.0,
                humidity: 51.2
            }
        );
    }

    #[test]
    fn test_wind_readings() {
        assert_eq!(
            station().decode(&reply(2, &[0x0003, 0]), true).unwrap(),
            WeatherReading::WindDirection("东南风")
        );
        assert_eq!(
            station().decode(&reply(3, &[0x0023, 0]), true).unwrap(),
            WeatherReading::WindSpeed(3.5)
        );
        assert_eq!(
            station().decode(&reply(2, &[0x0008, 0]), true),
            Err(WeatherError::Direction(8))
        );
    }

    #[test]
    fn test_unknown_sensor_and_bad_frames() {
        assert_eq!(
            station().decode(&reply(9, &[1, 2]), true),
            Err(WeatherError::UnknownSensor(9))
        );
        assert_eq!(
            station().decode(&reply(3, &[]), true),
            Err(WeatherError::MissingData(3))
        );

        let mut corrupt = reply(1, &[0x0118, 0x00F5]);
        corrupt[4] ^= 0xFF;
        assert!(matches!(
            station().decode(&corrupt, true),
            Err(WeatherError::Frame(FrameError::Crc { .. }))
        ));
    }

    #[test]
    fn test_devaddr_match_ignores_case() {
        assert!(station().matches("7076e8ff"));
        assert!(!station().matches("7076e841"));
    }
}
