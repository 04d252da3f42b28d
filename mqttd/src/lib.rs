#![deny(unsafe_code)]

//! MQTT broker core.
//!
//! - [`router`] holds subscriptions in a per-node locked topic trie and
//!   resolves shared subscription groups
//! - [`retain`] keeps the latest retained publish per topic
//! - [`delivery`] tracks QoS 1/2 handshakes per client on top of a
//!   [`store::Store`] backend (in memory or sled)
//! - [`session`] drives one client connection over any byte stream
//!
//! All shared state hangs off a [`ServerContext`] built from [`Settings`].

pub use mqttd_codec as codec;
pub use mqttd_utils as utils;

pub mod context;
pub mod delivery;
pub mod error;
pub mod inflight;
pub mod logger;
pub mod retain;
pub mod router;
pub mod session;
pub mod settings;
pub mod store;
pub mod topic;
pub mod trie;
pub mod types;

pub use self::context::ServerContext;
pub use self::error::{MqttError, ToReasonCode};
pub use self::settings::Settings;

pub type Result<T, E = MqttError> = std::result::Result<T, E>;
