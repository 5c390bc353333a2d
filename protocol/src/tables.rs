/// Static lookup tables referenced by index from the waveform preamble.
use anyhow::anyhow;

use crate::Error;

/// Seconds per horizontal division, indexed by the preamble `time_base` field.
pub const TIMEBASE_VALUES: [f64; 39] = [
    200e-12, 500e-12, // picoseconds
    1e-9, 2e-9, 5e-9, 10e-9, 20e-9, 50e-9, 100e-9, 200e-9, 500e-9, // nanoseconds
    1e-6, 2e-6, 5e-6, 10e-6, 20e-6, 50e-6, 100e-6, 200e-6, 500e-6, // microseconds
    1e-3, 2e-3, 5e-3, 10e-3, 20e-3, 50e-3, 100e-3, 200e-3, 500e-3, // milliseconds
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0,
];

/// Channel names, indexed by the preamble `wave_source` field.
pub const WAVEFORM_SOURCES: [&str; 32] = [
    "C1", "C2", "C3", "C4", "C5", "C6", "C7", "C8", //
    "F1", "F2", "F3", "F4", "F5", "F6", "F7", "F8", //
    "D0", "D1", "D2", "D3", "D4", "D5", "D6", "D7", //
    "D8", "D9", "D10", "D11", "D12", "D13", "D14", "D15",
];

pub fn timebase(index: u16) -> crate::Result<f64> {
    TIMEBASE_VALUES
        .get(index as usize)
        .copied()
        .ok_or_else(|| Error::interpretation(anyhow!("Unknown time base index {}", index)))
}

pub fn waveform_source(index: u16) -> crate::Result<&'static str> {
    WAVEFORM_SOURCES
        .get(index as usize)
        .copied()
        .ok_or_else(|| Error::interpretation(anyhow!("Unknown waveform source index {}", index)))
}

/// Index of a channel name in [`WAVEFORM_SOURCES`].
pub fn source_index(name: &str) -> Option<u16> {
    WAVEFORM_SOURCES
        .iter()
        .position(|x| x.eq_ignore_ascii_case(name))
        .map(|x| x as u16)
}

/// Analog input channels, e.g. `C1`.
pub fn is_analog(channel: &str) -> bool {
    channel.starts_with('C')
}

/// Math function channels, e.g. `F1`. Their data is never chunked by the device.
pub fn is_math(channel: &str) -> bool {
    channel.starts_with('F')
}

/// Parse a list of channels such as `"C1,C2"`, `"1 2"` or `"C1, F1"`.
///
/// Bare numbers refer to analog channels. Order is preserved and duplicates are dropped.
pub fn parse_channel_list(channels: &str) -> crate::Result<Vec<String>> {
    let mut ret: Vec<String> = Vec::new();
    for token in channels.split(|c: char| c == ',' || c == ';' || c.is_whitespace()) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let name = if token.chars().all(|c| c.is_ascii_digit()) {
            format!("C{}", token)
        } else {
            token.to_uppercase()
        };
        let index = source_index(&name).ok_or_else(|| Error::argument(anyhow!("Unknown channel `{}`", token)))?;
        let name = WAVEFORM_SOURCES[index as usize].to_string();
        if !ret.contains(&name) {
            ret.push(name);
        }
    }
    Ok(ret)
}
