//! Per-device configuration.
//!
//! A [`DeviceConfig`] is built once per session from a [`DeviceVariant`] and
//! then changed only through [`DeviceConfig::apply_option`], which validates
//! the new value before touching anything. The returned [`Applied`] tells the
//! session what the change implies (a link reopen, a timing reset).

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::icarus::{
    codec::{FrameLayout, NonceOrder},
    timing::{read_count_for, HashCountMode},
};

/// Length of one wait tick.
pub const TICK: Duration = Duration::from_millis(100);

/// Ticks per second, used to turn a full-nonce time into a poll window.
pub const TICKS_PER_SECOND: u32 = 10;

/// Poll window used while an adaptive mode is still collecting samples.
pub const READ_COUNT_TIMING: u32 = 5 * TICKS_PER_SECOND;

/// Largest poll-window cap accepted by the `short=N`/`long=N` forms.
pub const READ_COUNT_LIMIT_MAX: u32 = 100;

/// Default link speed.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Link speeds the serial layer can be asked for.
pub const VALID_BAUDS: [u32; 13] = [
    300, 600, 1_200, 2_400, 4_800, 9_600, 19_200, 38_400, 57_600, 115_200, 230_400, 460_800,
    921_600,
];

/// Size of the nonce carried at the head of every reply.
pub const NONCE_SIZE: usize = 4;

/// Seconds per hash of an original Icarus board.
pub const ICARUS_HASH_TIME: f64 = 0.000_000_002_640_83;

/// Seconds per hash of an Enterpoint Cairnsmore1.
pub const CAIRNSMORE_HASH_TIME: f64 = 0.000_000_002_631_6;

/// DualMiner PLL frequencies, in MHz.
pub const DUAL_PLL_STEPS: [u32; 15] = [
    400, 500, 550, 600, 650, 700, 750, 800, 850, 900, 950, 1_000, 1_050, 1_100, 1_200,
];

/// Number of SHA-256 units on a DualMiner chip.
pub const DUAL_BTC_UNITS: u32 = 160;

/// Rejected configuration value. Nothing is changed when this is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("invalid {name} '{value}': {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("option list '{0}' has more than 4 fields")]
    TooManyFields(String),
}

fn invalid(name: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Hardware family behind the link.
///
/// Selected at construction; every variant-specific behavior (frame layout,
/// nonce byte order, default timing, hash accounting) is derived from it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceVariant {
    Icarus,
    Cairnsmore,
    DualSha256,
    DualScrypt,
}

impl DeviceVariant {
    pub fn frame_layout(self) -> FrameLayout {
        match self {
            Self::Icarus | Self::Cairnsmore => FrameLayout::Icarus64,
            Self::DualSha256 => FrameLayout::Compact52,
            Self::DualScrypt => FrameLayout::Scrypt160,
        }
    }

    pub fn nonce_order(self) -> NonceOrder {
        match self {
            Self::Icarus | Self::Cairnsmore => NonceOrder::BigEndian,
            Self::DualSha256 | Self::DualScrypt => NonceOrder::LittleEndian,
        }
    }

    pub fn is_dual(self) -> bool {
        matches!(self, Self::DualSha256 | Self::DualScrypt)
    }

    fn default_reopen(self) -> ReopenPolicy {
        if self.is_dual() {
            ReopenPolicy::Never
        } else {
            ReopenPolicy::Timeout
        }
    }
}

/// Number of equal partitions of the nonce space searched in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct WorkDivision(u32);

impl WorkDivision {
    pub const ONE: Self = Self(1);
    pub const TWO: Self = Self(2);

    pub fn get(self) -> u32 {
        self.0
    }

    /// Mask applied to a reply to recover the position inside one partition.
    pub fn nonce_mask(self) -> u32 {
        u32::MAX >> self.0.trailing_zeros()
    }
}

impl TryFrom<u32> for WorkDivision {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 | 2 | 4 | 8 => Ok(Self(value)),
            _ => Err(invalid(
                "work_division",
                &value.to_string(),
                "must be 1, 2, 4 or 8",
            )),
        }
    }
}

impl fmt::Display for WorkDivision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// When the link is closed and reopened as a matter of routine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ReopenPolicy {
    #[strum(to_string = "never", serialize = "-r")]
    Never,
    #[strum(to_string = "timeout")]
    Timeout,
    #[strum(to_string = "cycle", serialize = "r")]
    Cycle,
}

/// Poll-window policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timing {
    /// Window from the nominal hash time, or a fixed tick count.
    Default { read_count: Option<u32> },
    /// Adaptive; calibration stops once the sample threshold saturates.
    Short { limit: u32 },
    /// Adaptive for the life of the session.
    Long { limit: u32 },
    /// Fixed hash time in nanoseconds, optionally with a fixed window.
    Fixed {
        hash_time_ns: f64,
        read_count: Option<u32>,
    },
}

impl Default for Timing {
    fn default() -> Self {
        Self::Default { read_count: None }
    }
}

impl Timing {
    pub fn is_adaptive(&self) -> bool {
        matches!(self, Self::Short { .. } | Self::Long { .. })
    }

    /// Cap on the refit window, zero meaning none.
    pub fn limit(&self) -> u32 {
        match *self {
            Self::Short { limit } | Self::Long { limit } => limit,
            _ => 0,
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::Default { .. } => "default",
            Self::Short { .. } => "short",
            Self::Long { .. } => "long",
            Self::Fixed { .. } => "value",
        }
    }
}

fn parse_limit(value: &str, raw: &str) -> Result<u32, ConfigError> {
    let limit: u32 = raw
        .trim()
        .parse()
        .map_err(|_| invalid("timing", value, "limit must be a non-negative integer"))?;
    Ok(limit.min(READ_COUNT_LIMIT_MAX))
}

fn parse_read_count(value: &str, raw: Option<&str>) -> Result<Option<u32>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(raw) => {
            let count: u32 = raw
                .trim()
                .parse()
                .map_err(|_| invalid("timing", value, "read count must be an integer"))?;
            Ok((count > 0).then_some(count))
        }
    }
}

impl FromStr for Timing {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lower = value.trim().to_ascii_lowercase();
        let (head, arg) = match lower.split_once('=') {
            Some((head, arg)) => (head, Some(arg)),
            None => (lower.as_str(), None),
        };

        match head {
            "" | "default" => Ok(Self::Default {
                read_count: parse_read_count(value, arg)?,
            }),
            "short" => Ok(Self::Short {
                limit: arg.map(|a| parse_limit(value, a)).transpose()?.unwrap_or(0),
            }),
            "long" => Ok(Self::Long {
                limit: arg.map(|a| parse_limit(value, a)).transpose()?.unwrap_or(0),
            }),
            ns => {
                let hash_time_ns: f64 = ns.parse().map_err(|_| {
                    invalid(
                        "timing",
                        value,
                        "expected short[=N], long[=N], default[=N] or <ns>[=N]",
                    )
                })?;
                if !hash_time_ns.is_finite() || hash_time_ns <= 0.0 {
                    return Err(invalid("timing", value, "hash time must be positive"));
                }
                Ok(Self::Fixed {
                    hash_time_ns,
                    read_count: parse_read_count(value, arg)?,
                })
            }
        }
    }
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Default { read_count: None } => write!(f, "default"),
            Self::Default {
                read_count: Some(n),
            } => write!(f, "default={n}"),
            Self::Short { limit: 0 } => write!(f, "short"),
            Self::Short { limit } => write!(f, "short={limit}"),
            Self::Long { limit: 0 } => write!(f, "long"),
            Self::Long { limit } => write!(f, "long={limit}"),
            Self::Fixed {
                hash_time_ns,
                read_count: None,
            } => write!(f, "{hash_time_ns}"),
            Self::Fixed {
                hash_time_ns,
                read_count: Some(n),
            } => write!(f, "{hash_time_ns}={n}"),
        }
    }
}

/// DualMiner clocking, used only for nominal throughput and hash accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DualOptions {
    pub pll_mhz: u32,
    pub btc_units: u32,
}

impl Default for DualOptions {
    fn default() -> Self {
        Self {
            pll_mhz: 400,
            btc_units: DUAL_BTC_UNITS,
        }
    }
}

/// What a successful [`DeviceConfig::apply_option`] implies for the session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// Some stored value actually changed.
    pub changed: bool,
    /// Link reopen needed before the next job.
    pub reopen_now: bool,
    /// Calibration state must be rebuilt from the new settings.
    pub retime: bool,
}

impl std::ops::BitOrAssign for Applied {
    fn bitor_assign(&mut self, rhs: Self) {
        self.changed |= rhs.changed;
        self.reopen_now |= rhs.reopen_now;
        self.retime |= rhs.retime;
    }
}

/// Fields of the positional `baud:work_division:fpga_count:reopen` string.
const POSITIONAL_OPTIONS: [&str; 4] = ["baud", "work_division", "fpga_count", "reopen"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceConfig {
    pub variant: DeviceVariant,
    pub baud: u32,
    pub work_division: WorkDivision,
    pub fpga_count: u32,
    /// Bytes per reply; the first four are the nonce.
    pub reply_size: usize,
    pub reopen: ReopenPolicy,
    #[serde(serialize_with = "serialize_display")]
    pub timing: Timing,
    /// Keep listening for more nonces from the current job after a hit.
    pub continue_search: bool,
    /// Hardware errors tolerated before a reopen; `None` never reopens.
    pub hw_error_reopen: Option<u32>,
    pub dual: DualOptions,
    /// Probe the device for its work division when the session starts.
    pub autodetect_work_division: bool,
    #[serde(skip)]
    fpga_count_pinned: bool,
}

fn serialize_display<S: serde::Serializer, T: fmt::Display>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl DeviceConfig {
    pub fn new(variant: DeviceVariant) -> Self {
        Self {
            variant,
            baud: DEFAULT_BAUD,
            work_division: WorkDivision::TWO,
            fpga_count: 2,
            reply_size: NONCE_SIZE,
            reopen: variant.default_reopen(),
            timing: Timing::default(),
            continue_search: false,
            hw_error_reopen: Some(1),
            dual: DualOptions::default(),
            autodetect_work_division: false,
            fpga_count_pinned: false,
        }
    }

    pub fn nonce_mask(&self) -> u32 {
        self.work_division.nonce_mask()
    }

    /// Nominal throughput in hashes per second, before any measurement.
    pub fn nominal_hashrate(&self) -> f64 {
        match self.variant {
            DeviceVariant::Icarus => 1.0 / ICARUS_HASH_TIME,
            DeviceVariant::Cairnsmore => 1.0 / CAIRNSMORE_HASH_TIME,
            DeviceVariant::DualSha256 => {
                self.dual.btc_units as f64 * 1e9 / DUAL_BTC_UNITS as f64
                    * self.dual.pll_mhz as f64
                    / 400.0
            }
            DeviceVariant::DualScrypt => 50_000.0 * self.dual.pll_mhz as f64 / 600.0,
        }
    }

    /// Seconds per hash the session starts from.
    pub fn hash_time(&self) -> f64 {
        match self.timing {
            Timing::Fixed { hash_time_ns, .. } => hash_time_ns / 1e9,
            _ => 1.0 / self.nominal_hashrate(),
        }
    }

    /// Poll window at session start, in ticks.
    pub fn initial_read_count(&self) -> u32 {
        let from_hash_time = || read_count_for(self.hash_time() * 4_294_967_296.0);
        match self.timing {
            Timing::Short { .. } | Timing::Long { .. } => READ_COUNT_TIMING,
            Timing::Fixed { read_count, .. } => read_count.unwrap_or_else(from_hash_time),
            Timing::Default {
                read_count: Some(n),
            } => n,
            Timing::Default { read_count: None } => match self.variant {
                DeviceVariant::Icarus => READ_COUNT_TIMING,
                DeviceVariant::Cairnsmore => from_hash_time(),
                DeviceVariant::DualSha256 => 16,
                DeviceVariant::DualScrypt => 48,
            },
        }
    }

    /// Whether the session should run the one-time speed classification.
    pub fn auto_classify(&self) -> bool {
        self.variant == DeviceVariant::Icarus && matches!(self.timing, Timing::Default { .. })
    }

    pub fn hash_count_mode(&self) -> HashCountMode {
        match self.variant {
            DeviceVariant::Icarus | DeviceVariant::Cairnsmore => HashCountMode::NonceMask {
                mask: self.nonce_mask(),
                fpga_count: self.fpga_count,
            },
            DeviceVariant::DualSha256 => HashCountMode::UnitRatio {
                active: self.dual.btc_units,
                total: DUAL_BTC_UNITS,
            },
            DeviceVariant::DualScrypt => HashCountMode::UnitRatio {
                active: 1,
                total: 1,
            },
        }
    }

    /// Time the reply spends on the wire at the configured speed.
    pub fn transfer_time(&self) -> Duration {
        Duration::from_secs_f64(self.reply_size as f64 * 8.0 / self.baud as f64)
    }

    /// Validate and apply one named option.
    ///
    /// Re-applying the value already in effect is a no-op: nothing changes
    /// and no reopen is requested. `reopen=now` is the one exception, being
    /// a request rather than a setting.
    pub fn apply_option(&mut self, name: &str, value: &str) -> Result<Applied, ConfigError> {
        let value = value.trim();
        let mut applied = Applied::default();

        match name.trim().to_ascii_lowercase().as_str() {
            "baud" => {
                let baud: u32 = value
                    .parse()
                    .map_err(|_| invalid("baud", value, "not a number"))?;
                if !VALID_BAUDS.contains(&baud) {
                    return Err(invalid("baud", value, "unsupported baud rate"));
                }
                if baud != self.baud {
                    self.baud = baud;
                    applied.changed = true;
                    applied.reopen_now = true;
                }
            }
            "work_division" => {
                if value.eq_ignore_ascii_case("auto") {
                    if !self.autodetect_work_division {
                        self.autodetect_work_division = true;
                        applied.changed = true;
                    }
                    return Ok(applied);
                }
                let raw: u32 = value
                    .parse()
                    .map_err(|_| invalid("work_division", value, "not a number"))?;
                let division = WorkDivision::try_from(raw)?;
                if self.fpga_count_pinned && self.fpga_count > division.get() {
                    return Err(invalid(
                        "work_division",
                        value,
                        "must be >= fpga_count",
                    ));
                }
                let fpga_count = if self.fpga_count_pinned {
                    self.fpga_count
                } else {
                    division.get()
                };
                if division != self.work_division || fpga_count != self.fpga_count {
                    applied.changed = true;
                    applied.retime = true;
                }
                self.work_division = division;
                self.fpga_count = fpga_count;
                self.autodetect_work_division = false;
            }
            "fpga_count" => {
                let count: u32 = value
                    .parse()
                    .map_err(|_| invalid("fpga_count", value, "not a number"))?;
                if count < 1 || count > self.work_division.get() {
                    return Err(invalid(
                        "fpga_count",
                        value,
                        "must be >0 and <=work_division",
                    ));
                }
                if count != self.fpga_count {
                    self.fpga_count = count;
                    applied.changed = true;
                    applied.retime = true;
                }
                self.fpga_count_pinned = true;
            }
            "reopen" => {
                if value.eq_ignore_ascii_case("now") {
                    applied.reopen_now = true;
                    return Ok(applied);
                }
                let policy: ReopenPolicy = value
                    .parse()
                    .map_err(|_| invalid("reopen", value, "expected never, timeout, cycle or now"))?;
                if policy != self.reopen {
                    self.reopen = policy;
                    applied.changed = true;
                }
            }
            "timing" => {
                let timing: Timing = value.parse()?;
                if timing != self.timing {
                    self.timing = timing;
                    applied.changed = true;
                    applied.retime = true;
                }
            }
            "continue_search" => {
                let enabled = parse_bool(value).ok_or_else(|| {
                    invalid("continue_search", value, "expected true or false")
                })?;
                if enabled != self.continue_search {
                    self.continue_search = enabled;
                    applied.changed = true;
                }
            }
            "hw_error_reopen" => {
                let threshold = if value.eq_ignore_ascii_case("off") {
                    None
                } else {
                    let n: u32 = value.parse().map_err(|_| {
                        invalid("hw_error_reopen", value, "expected off or a count")
                    })?;
                    if n == 0 {
                        return Err(invalid("hw_error_reopen", value, "count must be positive"));
                    }
                    Some(n)
                };
                if threshold != self.hw_error_reopen {
                    self.hw_error_reopen = threshold;
                    applied.changed = true;
                }
            }
            "pll" => {
                let mhz: u32 = value
                    .parse()
                    .map_err(|_| invalid("pll", value, "not a number"))?;
                if !DUAL_PLL_STEPS.contains(&mhz) {
                    return Err(invalid("pll", value, "unsupported PLL frequency"));
                }
                if mhz != self.dual.pll_mhz {
                    self.dual.pll_mhz = mhz;
                    applied.changed = true;
                    applied.retime = true;
                }
            }
            "btc_units" => {
                let units: u32 = value
                    .parse()
                    .map_err(|_| invalid("btc_units", value, "not a number"))?;
                if !(1..=DUAL_BTC_UNITS).contains(&units) {
                    return Err(invalid("btc_units", value, "must be 1 to 160"));
                }
                if units != self.dual.btc_units {
                    self.dual.btc_units = units;
                    applied.changed = true;
                    applied.retime = true;
                }
            }
            other => return Err(ConfigError::UnknownOption(other.to_string())),
        }

        Ok(applied)
    }

    /// Apply a `baud:work_division:fpga_count:reopen` string.
    ///
    /// Empty fields are skipped. Either every field applies or none does.
    pub fn apply_option_list(&mut self, list: &str) -> Result<Applied, ConfigError> {
        let fields: Vec<&str> = list.split(':').collect();
        if fields.len() > POSITIONAL_OPTIONS.len() {
            return Err(ConfigError::TooManyFields(list.to_string()));
        }

        let mut staged = self.clone();
        let mut applied = Applied::default();
        for (name, value) in POSITIONAL_OPTIONS.iter().zip(fields) {
            if value.trim().is_empty() {
                continue;
            }
            applied |= staged.apply_option(name, value)?;
        }
        *self = staged;
        Ok(applied)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// A value in a [`DeviceOptions`] document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Flag(bool),
    Number(u64),
    Text(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(b) => b.fmt(f),
            Self::Number(n) => n.fmt(f),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Device description as read from a JSON document.
///
/// ```json
/// { "variant": "icarus", "options": "115200:2:2:timeout", "timing": "short=80" }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceOptions {
    pub variant: DeviceVariant,
    /// Positional `baud:work_division:fpga_count:reopen` string.
    #[serde(default)]
    pub options: Option<String>,
    #[serde(default)]
    pub baud: Option<OptionValue>,
    #[serde(default)]
    pub work_division: Option<OptionValue>,
    #[serde(default)]
    pub fpga_count: Option<OptionValue>,
    #[serde(default)]
    pub reopen: Option<OptionValue>,
    #[serde(default)]
    pub timing: Option<OptionValue>,
    #[serde(default)]
    pub continue_search: Option<OptionValue>,
    #[serde(default)]
    pub hw_error_reopen: Option<OptionValue>,
    #[serde(default)]
    pub pll: Option<OptionValue>,
    #[serde(default)]
    pub btc_units: Option<OptionValue>,
}

impl DeviceOptions {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Build a config, passing every field through the option validator.
    pub fn into_config(self) -> Result<DeviceConfig, ConfigError> {
        let mut config = DeviceConfig::new(self.variant);
        if let Some(list) = &self.options {
            config.apply_option_list(list)?;
        }

        let named = [
            ("baud", &self.baud),
            ("work_division", &self.work_division),
            ("fpga_count", &self.fpga_count),
            ("reopen", &self.reopen),
            ("timing", &self.timing),
            ("continue_search", &self.continue_search),
            ("hw_error_reopen", &self.hw_error_reopen),
            ("pll", &self.pll),
            ("btc_units", &self.btc_units),
        ];
        for (name, value) in named {
            if let Some(value) = value {
                config.apply_option(name, &value.to_string())?;
            }
        }
        Ok(config)
    }
}
