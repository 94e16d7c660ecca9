use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use sysinfo::System;

use crate::publish::DeliveryMode;
use crate::sensors::mlx90614;

pub const CONFIG_ENV: &str = "EDGESENSE_CONFIG";

const FALLBACK_DEVICE_ID: &str = "zero2";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    /// Publish as the broker's retained last value.
    pub retain: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            keep_alive_secs: 60,
            retain: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
}

impl SerialSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct I2cSettings {
    pub bus: String,
    pub address: u8,
}

impl Default for I2cSettings {
    fn default() -> Self {
        Self {
            bus: "/dev/i2c-1".into(),
            address: mlx90614::DEFAULT_ADDRESS,
        }
    }
}

/// Startup configuration. Loaded once; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device_id: String,
    /// Empty means `zero2/<device_id>/sensor`.
    pub topic: String,
    pub interval_sec: u64,
    pub window_sec: u64,
    pub frame_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub verify_distance_checksum: bool,
    pub mqtt: MqttSettings,
    pub tf_luna: SerialSettings,
    /// The radar is optional; `null` disables it.
    pub ld6002: Option<SerialSettings>,
    pub mlx90614: I2cSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            topic: String::new(),
            interval_sec: 900,
            window_sec: 5,
            frame_timeout_ms: 1_000,
            publish_timeout_ms: 3_000,
            verify_distance_checksum: false,
            mqtt: MqttSettings::default(),
            tf_luna: SerialSettings {
                path: "/dev/serial0".into(),
                baud_rate: 115_200,
                read_timeout_ms: 1_000,
            },
            ld6002: Some(SerialSettings {
                path: "/dev/ttyUSB0".into(),
                baud_rate: 1_382_400,
                read_timeout_ms: 50,
            }),
            mlx90614: I2cSettings::default(),
        }
    }
}

impl Settings {
    /// Defaults, then the JSON file at `path` if it exists, then `EDGESENSE_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.finalize();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("EDGESENSE_DEVICE_ID") {
            self.device_id = value;
        }
        if let Some(value) = lookup("EDGESENSE_TOPIC") {
            self.topic = value;
        }
        if let Some(value) = lookup("EDGESENSE_MQTT_HOST") {
            self.mqtt.host = value;
        }
        if let Some(value) = lookup("EDGESENSE_MQTT_PORT") {
            self.mqtt.port = value
                .parse()
                .with_context(|| format!("EDGESENSE_MQTT_PORT is not a port: {value}"))?;
        }
        if let Some(value) = lookup("EDGESENSE_INTERVAL_SEC") {
            self.interval_sec = value
                .parse()
                .with_context(|| format!("EDGESENSE_INTERVAL_SEC is not a number: {value}"))?;
        }
        if let Some(value) = lookup("EDGESENSE_WINDOW_SEC") {
            self.window_sec = value
                .parse()
                .with_context(|| format!("EDGESENSE_WINDOW_SEC is not a number: {value}"))?;
        }
        Ok(())
    }

    /// Fills identity fields left empty.
    pub fn finalize(&mut self) {
        if self.device_id.trim().is_empty() {
            self.device_id = System::host_name()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| FALLBACK_DEVICE_ID.to_string());
        }
        if self.topic.trim().is_empty() {
            self.topic = format!("zero2/{}/sensor", self.device_id);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_sec == 0 {
            bail!("interval_sec must be greater than zero");
        }
        if self.window_sec > self.interval_sec {
            bail!(
                "window_sec ({}) must fit inside interval_sec ({})",
                self.window_sec,
                self.interval_sec
            );
        }
        if self.frame_timeout_ms == 0 {
            bail!("frame_timeout_ms must be greater than zero");
        }
        if self.publish_timeout_ms == 0 {
            bail!("publish_timeout_ms must be greater than zero");
        }
        if self.topic.trim().is_empty() {
            bail!("topic must not be empty");
        }
        if self.mqtt.keep_alive_secs == 0 {
            bail!("mqtt.keep_alive_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_sec)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        if self.mqtt.retain {
            DeliveryMode::Retained
        } else {
            DeliveryMode::AtMostOnce
        }
    }
}
