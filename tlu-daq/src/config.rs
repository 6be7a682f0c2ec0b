//! Run configuration: which scintillator inputs feed the coincidence, which
//! DUT channels receive triggers, and the trigger-logic parameters pushed to
//! the master block.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::device::{DeviceError, IpSel, Tlu};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown channel name '{0}'")]
    BadChannel(String),
    #[error("output channels CH{0} and LEMO{0} are exclusive")]
    ConflictingOutputs(u8),
    #[error("{name} must be between {min} and {max}, got {value}")]
    Range { name: &'static str, min: u32, max: u32, value: u32 },
}

/// Scintillator input, CH0..CH3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InputChannel(pub u8);

impl FromStr for InputChannel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        match upper.strip_prefix("CH").and_then(|n| n.parse::<u8>().ok()) {
            Some(n) if n < 4 => Ok(InputChannel(n)),
            _ => Err(ConfigError::BadChannel(s.to_string())),
        }
    }
}

impl fmt::Display for InputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH{}", self.0)
    }
}

/// Trigger output: RJ45 jacks CH0..CH5 or the front-panel LEMO0..LEMO3.
/// Channels sharing the trailing digit drive the same output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutputChannel {
    Ch(u8),
    Lemo(u8),
}

impl OutputChannel {
    pub fn number(&self) -> u8 {
        match self {
            OutputChannel::Ch(n) | OutputChannel::Lemo(n) => *n,
        }
    }

    pub fn is_lemo(&self) -> bool {
        matches!(self, OutputChannel::Lemo(_))
    }
}

impl FromStr for OutputChannel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        if let Some(n) = upper.strip_prefix("LEMO").and_then(|n| n.parse::<u8>().ok()) {
            if n < 4 {
                return Ok(OutputChannel::Lemo(n));
            }
        } else if let Some(n) = upper.strip_prefix("CH").and_then(|n| n.parse::<u8>().ok()) {
            if n < 6 {
                return Ok(OutputChannel::Ch(n));
            }
        }
        Err(ConfigError::BadChannel(s.to_string()))
    }
}

impl fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputChannel::Ch(n) => write!(f, "CH{}", n),
            OutputChannel::Lemo(n) => write!(f, "LEMO{}", n),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub input_enable: Vec<InputChannel>,
    pub output_enable: Vec<OutputChannel>,
    pub input_invert: Vec<InputChannel>,
    /// Digital debounce threshold, 640 MHz samples.
    pub threshold: u8,
    /// Coincidence window in 1.5625 ns units; 0 disables coincidence.
    pub max_distance: u8,
    pub n_bits_trigger_id: u8,
    /// BUSY handshake timeout; 0 waits forever.
    pub timeout: u16,
    /// Internal pulser period in 25 ns units; None uses physical inputs.
    pub test: Option<u32>,
    /// Pulses to generate in test mode, 0 for endless.
    pub count: u16,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            input_enable: Vec::new(),
            output_enable: Vec::new(),
            input_invert: Vec::new(),
            threshold: 0,
            max_distance: 31,
            n_bits_trigger_id: 16,
            timeout: 0xffff,
            test: None,
            count: 0,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for digit in 0..4u8 {
            let shared = self.output_enable.iter().filter(|ch| ch.number() == digit).count();
            if shared > 1 {
                return Err(ConfigError::ConflictingOutputs(digit));
            }
        }
        check_range("threshold", self.threshold as u32, 31)?;
        check_range("max_distance", self.max_distance as u32, 31)?;
        check_range("n_bits_trigger_id", self.n_bits_trigger_id as u32, 31)?;
        Ok(())
    }

    pub fn input_mask(&self) -> u8 {
        self.input_enable.iter().fold(0, |mask, ch| mask | (1 << ch.0))
    }

    pub fn invert_mask(&self) -> u8 {
        self.input_invert.iter().fold(0, |mask, ch| mask | (1 << ch.0))
    }

    pub fn output_mask(&self) -> u8 {
        self.output_enable.iter().fold(0, |mask, ch| mask | (1 << ch.number()))
    }

    /// Push everything except `EN_INPUT` to the device: front-panel LEDs and
    /// input selection derived from the outputs, then the master block.
    /// Inputs are armed separately once the readout is live.
    pub fn apply(&self, tlu: &Tlu) -> Result<(), DeviceError> {
        for channel in &self.output_enable {
            match channel {
                OutputChannel::Ch(n) => tlu.set_led_cnt(*n, 3),
                OutputChannel::Lemo(n) => tlu.set_lemo_leds(*n, true),
            }
        }
        for channel in &self.output_enable {
            let n = channel.number();
            if n < 4 {
                tlu.set_ip_sel(n, if channel.is_lemo() { IpSel::Lemo } else { IpSel::Rj45 });
            }
        }
        tlu.write_i2c_config()?;

        let master = tlu.master();
        master.set_max_distance(self.max_distance)?;
        master.set_threshold(self.threshold)?;
        master.set_timeout(self.timeout)?;
        master.set_n_bits_trigger_id(self.n_bits_trigger_id)?;
        master.set_en_output(self.output_mask())?;
        master.set_invert_input(self.invert_mask())?;
        Ok(())
    }
}

fn check_range(name: &'static str, value: u32, max: u32) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::Range { name, min: 0, max, value });
    }
    Ok(())
}
