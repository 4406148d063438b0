#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::anyhow;
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use self::logging::Log;

pub use self::options::Options;

pub mod logging;
pub mod options;

pub type Result<T> = anyhow::Result<T, anyhow::Error>;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mqflow/mqflow").required(false))
            .add_source(File::with_name("mqflow").required(false))
            .add_source(config::Environment::with_prefix("mqflow").separator("__").try_parsing(true));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(max) = opts.max_inflight_window {
            inner.mqtt.max_inflight_window = max;
        }
        if let Some(size) = opts.shutdown_partition_size {
            inner.mqtt.shutdown_partition_size = size;
        }
        inner.mqtt.validate()?;

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("max_inflight_window is {}", self.mqtt.max_inflight_window);
        log::info!("publish_poll_batch_size is {}", self.mqtt.publish_poll_batch_size);
        log::info!(
            "shutdown_partition_size is {}, shutdown_legacy is {}",
            self.mqtt.shutdown_partition_size,
            self.mqtt.shutdown_legacy
        );
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
    //Upper bound of unacknowledged outbound QoS 1/2 publishes per connection,
    //further limited by the receive maximum the client announces.
    #[serde(default = "Mqtt::max_inflight_window_default")]
    pub max_inflight_window: u16,

    //Maximum number of new queued messages handed to a connection per poll.
    #[serde(default = "Mqtt::publish_poll_batch_size_default")]
    pub publish_poll_batch_size: usize,

    //Connections closed concurrently in one shutdown batch.
    #[serde(default = "Mqtt::shutdown_partition_size_default")]
    pub shutdown_partition_size: usize,

    //Skip closing listeners and connections on shutdown.
    #[serde(default)]
    pub shutdown_legacy: bool,
}

impl Default for Mqtt {
    #[inline]
    fn default() -> Self {
        Self {
            max_inflight_window: Self::max_inflight_window_default(),
            publish_poll_batch_size: Self::publish_poll_batch_size_default(),
            shutdown_partition_size: Self::shutdown_partition_size_default(),
            shutdown_legacy: false,
        }
    }
}

impl Mqtt {
    fn max_inflight_window_default() -> u16 {
        50
    }

    fn publish_poll_batch_size_default() -> usize {
        50
    }

    fn shutdown_partition_size_default() -> usize {
        100
    }

    fn validate(&self) -> Result<()> {
        if self.max_inflight_window == 0 {
            return Err(anyhow!("mqtt.max_inflight_window must be greater than 0"));
        }
        if self.publish_poll_batch_size == 0 {
            return Err(anyhow!("mqtt.publish_poll_batch_size must be greater than 0"));
        }
        if self.shutdown_partition_size == 0 {
            return Err(anyhow!("mqtt.shutdown_partition_size must be greater than 0"));
        }
        Ok(())
    }
}
