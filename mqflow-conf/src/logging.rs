use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default")]
    pub level: Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self {
            to: Self::to_default(),
            level: Self::level_default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
        }
    }
}

impl Log {
    #[inline]
    fn to_default() -> To {
        To::Console
    }
    #[inline]
    fn level_default() -> Level {
        Level(slog::Level::Info)
    }
    #[inline]
    fn dir_default() -> String {
        "/var/log/mqflow".into()
    }
    #[inline]
    fn file_default() -> String {
        "mqflow.log".into()
    }

    /// Full path of the log file, empty when file logging has no target.
    #[inline]
    pub fn filename(&self) -> String {
        if self.file.is_empty() {
            return String::new();
        }
        let dir = self.dir.trim_end_matches(['/', '\\']);
        if dir.is_empty() {
            self.file.clone()
        } else {
            format!("{}/{}", dir, self.file)
        }
    }
}

/// Where log records are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl FromStr for To {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(To::Off),
            "file" => Ok(To::File),
            "console" => Ok(To::Console),
            "both" => Ok(To::Both),
            other => Err(format!("unknown log destination '{}'", other)),
        }
    }
}

impl<'de> Deserialize<'de> for To {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl fmt::Debug for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_str())
    }
}

impl From<slog::Level> for Level {
    #[inline]
    fn from(l: slog::Level) -> Self {
        Level(l)
    }
}

impl<'de> Deserialize<'de> for Level {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        slog::Level::from_str(&level)
            .map(Level)
            .map_err(|_| de::Error::custom(format!("invalid log level '{}'", level)))
    }
}
