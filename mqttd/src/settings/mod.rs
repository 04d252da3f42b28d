use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::{Config, Environment, File, FileFormat};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};

use mqttd_utils::{deserialize_duration, deserialize_duration_option, Bytesize};

use self::log::Log;

pub mod log;

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub storage: Storage,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings(Arc::new(Inner::default()))
    }
}

impl Settings {
    /// Loads `/etc/mqttd/mqttd.toml`, `./mqttd.toml`, the optional `cfg`
    /// file and `MQTTD_*` environment variables, later sources winning.
    ///
    /// Nested keys use a double underscore: `MQTTD_MQTT__RETRY_INTERVAL=10s`.
    pub fn new(cfg: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mqttd/mqttd").required(false))
            .add_source(File::with_name("mqttd").required(false));
        if let Some(cfg) = cfg {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("mqttd").prefix_separator("_").separator("__").try_parsing(true),
        );
        let inner: Inner = builder.build()?.try_deserialize()?;
        inner.check()?;
        Ok(Self(Arc::new(inner)))
    }

    /// Builds settings from an in-memory TOML document.
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let inner: Inner =
            Config::builder().add_source(File::from_str(text, FileFormat::Toml)).build()?.try_deserialize()?;
        inner.check()?;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn logs(&self) {
        ::log::debug!("Config info is {:?}", self.0);
        ::log::info!("log to {:?}, level {:?}, file {:?}", self.log.to, self.log.level.inner(), self.log.filename());
        ::log::info!("max_packet_size is {}", self.mqtt.max_packet_size);
        ::log::info!("retry_interval is {:?}, retry_max is {}", self.mqtt.retry_interval, self.mqtt.retry_max);
        ::log::info!("message_expiry is {:?}", self.mqtt.message_expiry);
        ::log::info!("session_expiry is {:?}", self.mqtt.session_expiry);
        ::log::info!("storage type is {:?}", self.storage.storage_type);
    }
}

impl Inner {
    fn check(&self) -> anyhow::Result<()> {
        if !(self.mqtt.keepalive_backoff > 0.0 && self.mqtt.keepalive_backoff <= 1.0) {
            return Err(anyhow!("mqtt.keepalive_backoff must be in (0, 1], got {}", self.mqtt.keepalive_backoff));
        }
        if self.mqtt.retry_interval.is_zero() {
            return Err(anyhow!("mqtt.retry_interval must not be zero"));
        }
        if self.mqtt.max_inflight == 0 {
            return Err(anyhow!("mqtt.max_inflight must not be zero"));
        }
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    /// Largest packet accepted from a client, `0` is unlimited.
    #[serde(default = "Mqtt::max_packet_size_default")]
    pub max_packet_size: Bytesize,
    #[serde(default = "Mqtt::keepalive_backoff_default")]
    pub keepalive_backoff: f32,
    /// Upper bound on the keep alive a client may ask for, in seconds.
    #[serde(default = "Mqtt::max_keepalive_default")]
    pub max_keepalive: u16,
    #[serde(default = "Mqtt::session_expiry_default", deserialize_with = "deserialize_duration")]
    pub session_expiry: Duration,
    #[serde(default = "Mqtt::message_expiry_default", deserialize_with = "deserialize_duration_option")]
    pub message_expiry: Option<Duration>,
    #[serde(default = "Mqtt::retry_interval_default", deserialize_with = "deserialize_duration")]
    pub retry_interval: Duration,
    /// Resend attempts before a record is dropped, `0` retries forever.
    #[serde(default)]
    pub retry_max: u64,
    #[serde(default = "Mqtt::max_inflight_default")]
    pub max_inflight: u16,
    #[serde(default = "Mqtt::retain_enable_default")]
    pub retain_enable: bool,
    #[serde(default = "Mqtt::shared_subscription_default")]
    pub shared_subscription: bool,
    /// Time allowed between accepting a stream and receiving CONNECT.
    #[serde(default = "Mqtt::handshake_timeout_default", deserialize_with = "deserialize_duration")]
    pub handshake_timeout: Duration,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            max_packet_size: Self::max_packet_size_default(),
            keepalive_backoff: Self::keepalive_backoff_default(),
            max_keepalive: Self::max_keepalive_default(),
            session_expiry: Self::session_expiry_default(),
            message_expiry: Self::message_expiry_default(),
            retry_interval: Self::retry_interval_default(),
            retry_max: 0,
            max_inflight: Self::max_inflight_default(),
            retain_enable: Self::retain_enable_default(),
            shared_subscription: Self::shared_subscription_default(),
            handshake_timeout: Self::handshake_timeout_default(),
        }
    }
}

impl Mqtt {
    fn max_packet_size_default() -> Bytesize {
        Bytesize::from(1024 * 1024)
    }
    fn keepalive_backoff_default() -> f32 {
        0.75
    }
    fn max_keepalive_default() -> u16 {
        u16::MAX
    }
    fn session_expiry_default() -> Duration {
        Duration::from_secs(2 * 60 * 60)
    }
    fn message_expiry_default() -> Option<Duration> {
        Some(Duration::from_secs(5 * 60))
    }
    fn retry_interval_default() -> Duration {
        Duration::from_secs(5)
    }
    fn max_inflight_default() -> u16 {
        u16::MAX
    }
    fn retain_enable_default() -> bool {
        true
    }
    fn shared_subscription_default() -> bool {
        true
    }
    fn handshake_timeout_default() -> Duration {
        Duration::from_secs(10)
    }

    /// Connection is closed after `keep_alive * keepalive_backoff * 2` idle seconds.
    #[inline]
    pub fn keepalive_timeout(&self, keep_alive: u16) -> Option<Duration> {
        if keep_alive == 0 {
            return None;
        }
        Some(Duration::from_secs_f32(keep_alive as f32 * self.keepalive_backoff * 2.0))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Storage {
    #[serde(default, rename = "type")]
    pub storage_type: StorageType,
    #[serde(default)]
    pub sled: SledConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum StorageType {
    //in-process maps, lost on restart
    #[default]
    Ram,
    //sled: embedded database, survives restarts
    Sled,
}

impl<'de> Deserialize<'de> for StorageType {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let t = String::deserialize(deserializer)?;
        match t.to_ascii_lowercase().as_str() {
            "ram" | "memory" => Ok(StorageType::Ram),
            "sled" => Ok(StorageType::Sled),
            _ => Err(serde::de::Error::unknown_variant(&t, &["ram", "sled"])),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SledConfig {
    #[serde(default = "SledConfig::path_default")]
    pub path: String,
    #[serde(default = "SledConfig::cache_capacity_default")]
    pub cache_capacity: Bytesize,
}

impl Default for SledConfig {
    fn default() -> Self {
        Self { path: Self::path_default(), cache_capacity: Self::cache_capacity_default() }
    }
}

impl SledConfig {
    fn path_default() -> String {
        "/var/lib/mqttd/sled".into()
    }
    fn cache_capacity_default() -> Bytesize {
        Bytesize::from(3 * 1024 * 1024 * 1024)
    }

    #[inline]
    pub fn to_sled_config(&self) -> anyhow::Result<sled::Config> {
        if self.path.trim().is_empty() {
            return Err(anyhow!("storage dir is empty"));
        }
        let sled_cfg = sled::Config::default()
            .path(self.path.trim())
            .cache_capacity(self.cache_capacity.as_u64())
            .mode(sled::Mode::HighThroughput);
        Ok(sled_cfg)
    }
}
