use std::ops::Range;

use anyhow::anyhow;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::preamble::Preamble;
use crate::{tables, DeviceModel, Error};

/// Last known acquisition configuration of a connection.
///
/// All fields start out unknown. The preamble fields are replaced wholesale by
/// [`apply_preamble`](Self::apply_preamble), `chunk_size_max` and `wave_array_points` come from
/// separate queries. The addressing fields are only consistent with each other right after a
/// refresh for the currently selected source channel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveformParameters {
    /// 0 = off, 1 = 20 MHz, 2 = 200 MHz
    pub bandwidth_limit: Option<u16>,
    /// Maximum number of points in a single data transfer.
    pub chunk_size_max: Option<u32>,
    pub code_per_div: Option<f32>,
    pub descriptor_name: Option<String>,
    pub frames_index: Option<u32>,
    /// Frames returned by a single data transfer in sequence mode.
    pub frames_read: Option<u32>,
    /// Frames acquired in sequence mode.
    pub frames_sum: Option<u32>,
    /// Seconds between two samples.
    pub horizontal_interval: Option<f32>,
    pub horizontal_offset: Option<f64>,
    pub instrument_name: Option<String>,
    pub probe_attenuation: Option<f32>,
    /// Seconds per horizontal division.
    pub time_base: Option<f64>,
    /// Volts per vertical division.
    pub vertical_gain: Option<f32>,
    pub vertical_offset: Option<f32>,
    pub wave_array_interval: Option<u32>,
    pub wave_array_max: Option<u32>,
    /// Points per waveform returned by a data request.
    pub wave_array_points: Option<u32>,
    pub wave_array_start: Option<u32>,
    pub wave_source: Option<String>,
}

fn count(preamble: &Preamble, name: &str) -> crate::Result<u32> {
    let value = preamble.i32(name)?;
    if value < 0 {
        return Err(Error::interpretation(anyhow!("Negative value {} for `{}`", value, name)));
    }
    Ok(value as u32)
}

fn missing(name: &str) -> Error {
    Error::interpretation(anyhow!("Waveform parameter `{}` is unknown", name))
}

impl WaveformParameters {
    /// Replace the preamble fields. Either all fields are updated or, on error, none.
    pub fn apply_preamble(&mut self, preamble: &Preamble) -> crate::Result<()> {
        let time_base = tables::timebase(preamble.u16("time_base")?)?;
        let wave_source = tables::waveform_source(preamble.u16("wave_source")?)?;
        let updated = WaveformParameters {
            bandwidth_limit: Some(preamble.u16("bandwidth_limit")?),
            chunk_size_max: self.chunk_size_max,
            code_per_div: Some(preamble.f32("code_per_div")?),
            descriptor_name: Some(preamble.text("descriptor_name")?),
            frames_index: Some(count(preamble, "frames_index")?),
            frames_read: Some(count(preamble, "frames_read")?),
            frames_sum: Some(count(preamble, "frames_sum")?),
            horizontal_interval: Some(preamble.f32("horizontal_interval")?),
            horizontal_offset: Some(preamble.f64("horizontal_offset")?),
            instrument_name: Some(preamble.text("instrument_name")?),
            probe_attenuation: Some(preamble.f32("probe_attenuation")?),
            time_base: Some(time_base),
            vertical_gain: Some(preamble.f32("vertical_gain")?),
            vertical_offset: Some(preamble.f32("vertical_offset")?),
            wave_array_interval: Some(count(preamble, "wave_array_interval")?),
            wave_array_max: Some(count(preamble, "wave_array_max")?),
            wave_array_points: self.wave_array_points,
            wave_array_start: Some(count(preamble, "wave_array_start")?),
            wave_source: Some(wave_source.to_string()),
        };
        *self = updated;
        Ok(())
    }

    pub fn set_chunk_size_max(&mut self, value: u32) {
        self.chunk_size_max = Some(value);
    }

    /// The instrument reports 0 points when all points are to be transferred.
    pub fn set_points(&mut self, value: u32) {
        self.wave_array_points = if value == 0 { self.wave_array_max } else { Some(value) };
    }

    pub fn points(&self) -> crate::Result<u32> {
        self.wave_array_points.ok_or_else(|| missing("wave_array_points"))
    }

    pub fn start(&self) -> crate::Result<u32> {
        self.wave_array_start.ok_or_else(|| missing("wave_array_start"))
    }

    /// Sample decimation, never less than 1.
    pub fn interval(&self) -> crate::Result<u32> {
        self.wave_array_interval
            .map(|x| x.max(1))
            .ok_or_else(|| missing("wave_array_interval"))
    }

    /// Convert a raw data block of ADC codes into volts.
    pub fn to_volts(&self, raw: &[u8], model: &DeviceModel) -> crate::Result<Vec<f32>> {
        let gain = self.vertical_gain.ok_or_else(|| missing("vertical_gain"))? as f64;
        let code_per_div = self.code_per_div.ok_or_else(|| missing("code_per_div"))? as f64;
        let offset = self.vertical_offset.ok_or_else(|| missing("vertical_offset"))? as f64;
        if code_per_div == 0.0 {
            return Err(Error::interpretation(anyhow!("code_per_div is zero")));
        }
        let scale = gain / code_per_div;
        if model.bytes_per_sample() == 2 && raw.len() % 2 != 0 {
            return Err(Error::interpretation(anyhow!(
                "Odd length {} of 16 bit sample data",
                raw.len()
            )));
        }
        let ret = if model.bytes_per_sample() == 1 {
            raw.iter()
                .map(|x| (*x as i8 as f64 * scale - offset) as f32)
                .collect()
        } else {
            raw.chunks_exact(2)
                .map(|x| (LittleEndian::read_i16(x) as f64 * scale - offset) as f32)
                .collect()
        };
        Ok(ret)
    }

    /// Cut a full length waveform, as returned for math function channels, down to the
    /// window addressed by start, points and interval.
    pub fn trim<T: Copy>(&self, data: &[T]) -> crate::Result<Vec<T>> {
        let start = (self.start()?.max(1) - 1) as usize;
        let interval = self.interval()? as usize;
        let stop = start + self.points()? as usize * interval;
        let stop = stop.min(data.len());
        if start >= stop {
            return Ok(Vec::new());
        }
        Ok(data[start..stop].iter().step_by(interval).copied().collect())
    }

    /// Time of each sample point relative to the trigger, in seconds.
    ///
    /// `t[i] = (horizontal_offset - time_base * grid / 2) + (start + i * interval) * horizontal_interval`
    pub fn time_axis(&self, grid: u8) -> crate::Result<Vec<f64>> {
        let offset = self.horizontal_offset.ok_or_else(|| missing("horizontal_offset"))?;
        let time_base = self.time_base.ok_or_else(|| missing("time_base"))?;
        let dt = self.horizontal_interval.ok_or_else(|| missing("horizontal_interval"))? as f64;
        let start = self.start()? as f64;
        let interval = self.interval()? as f64;
        let t0 = offset - time_base * grid as f64 / 2.0;
        let ret = (0..self.points()?)
            .map(|i| t0 + (start + i as f64 * interval) * dt)
            .collect();
        Ok(ret)
    }
}

/// Where the instrument should continue after a chunk has been transferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advance {
    /// Move the first transferred point (`:WAV:STAR`).
    StartPoint(u64),
    /// Move the first transferred sequence frame (`:WAV:SEQ 0,<index>`).
    FrameIndex(u64),
}

/// Chunking of one acquisition, derived from the waveform parameters at planning time.
#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionPlan {
    pub points: usize,
    pub frames: usize,
    pub chunk_size_max: usize,
    pub n_chunks: usize,
    pub start: u64,
    pub frames_read: u64,
    pub frames_sum: u64,
}

impl AcquisitionPlan {
    pub fn new(wfp: &WaveformParameters) -> crate::Result<Self> {
        let points = wfp.points()? as usize;
        let chunk_size_max = wfp.chunk_size_max.ok_or_else(|| missing("chunk_size_max"))? as usize;
        if chunk_size_max == 0 {
            return Err(Error::interpretation(anyhow!("chunk_size_max is zero")));
        }
        let frames_sum = wfp.frames_sum.ok_or_else(|| missing("frames_sum"))?;
        let frames = frames_sum.max(1) as usize;
        let total = points * frames;
        let n_chunks = (total + chunk_size_max - 1) / chunk_size_max;
        Ok(AcquisitionPlan {
            points,
            frames,
            chunk_size_max,
            n_chunks,
            start: wfp.start()? as u64,
            frames_read: wfp.frames_read.unwrap_or(1) as u64,
            frames_sum: frames_sum as u64,
        })
    }

    /// Samples per channel, `frames * points`.
    pub fn buffer_len(&self) -> usize {
        self.frames * self.points
    }

    /// Column range of a chunk within the channel buffer, clamped to the buffer.
    pub fn columns(&self, chunk: usize, len: usize) -> Range<usize> {
        let lo = (chunk * self.chunk_size_max).min(self.buffer_len());
        let hi = (lo + len).min(self.buffer_len());
        lo..hi
    }

    /// Register update to issue after `chunk` if more chunks follow.
    pub fn advance(&self, chunk: usize) -> Option<Advance> {
        if chunk + 1 >= self.n_chunks {
            return None;
        }
        if self.points > self.chunk_size_max {
            let next = self.start + ((chunk + 1) * self.chunk_size_max) as u64;
            Some(Advance::StartPoint(next))
        } else {
            // the instrument addresses the frames transferred next from the end of the sequence
            let behind = (self.n_chunks - chunk - 2) as u64 * self.frames_read;
            Some(Advance::FrameIndex(self.frames_sum.saturating_sub(behind).max(1)))
        }
    }
}
