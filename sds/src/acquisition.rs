//! Multi-channel waveform retrieval in chunks bounded by the instrument's transfer limit.
//!
//! The whole plan is enqueued up front and relies on the dispatcher executing it in order: the
//! instrument is stateful, so selecting a source must complete before the preamble refresh,
//! which must complete before the data request.
use std::sync::{Arc, Mutex};

use serde::Serialize;

use sds_protocol::scpi::{self, DATA_DELIMITER};
use sds_protocol::tables::{is_analog, is_math};
use sds_protocol::{Advance, AcquisitionPlan, WaveformParameters};

use crate::dispatcher::{Command, Completion, Dispatcher};
use crate::store::ParameterStore;
use crate::Error;

/// Acquired samples of several channels.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Waveforms {
    pub channels: Vec<String>,
    /// Seconds relative to the trigger, one entry per point.
    pub time: Vec<f64>,
    pub frames: usize,
    pub points: usize,
    /// Volts, row-major `[channel][frame][point]`. Samples which could not be retrieved are NaN.
    pub data: Vec<f32>,
}

impl Waveforms {
    /// `(channels, frames, points)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.channels.len(), self.frames, self.points)
    }

    pub fn channel(&self, channel: usize) -> &[f32] {
        let len = self.frames * self.points;
        &self.data[channel * len..(channel + 1) * len]
    }

    pub fn frame(&self, channel: usize, frame: usize) -> &[f32] {
        let offset = frame * self.points;
        &self.channel(channel)[offset..offset + self.points]
    }

    /// Index of a channel by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|x| x == name)
    }

    /// Number of samples that were not retrieved.
    pub fn missing(&self) -> usize {
        self.data.iter().filter(|x| x.is_nan()).count()
    }
}

/// Delivers the outcome exactly once, whichever callback gets there first.
#[derive(Clone)]
struct Finish(Arc<Mutex<Option<Completion<Option<Waveforms>>>>>);

impl Finish {
    fn new(done: Completion<Option<Waveforms>>) -> Self {
        Finish(Arc::new(Mutex::new(Some(done))))
    }

    fn finish(&self, result: crate::Result<Option<Waveforms>>) {
        let done = match self.0.lock() {
            Ok(mut x) => x.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(done) = done {
            done(result);
        }
    }
}

struct Assembly {
    channels: Vec<String>,
    plan: AcquisitionPlan,
    /// Parameters at planning time, the time axis derives from these.
    planned: WaveformParameters,
    grid: u8,
    data: Vec<f32>,
    attempted: usize,
}

impl Assembly {
    fn total(&self) -> usize {
        self.channels.iter().map(|x| chunks_of(&self.plan, x)).sum()
    }

    fn insert(&mut self, channel: usize, chunk: usize, values: &[f32]) {
        let len = self.plan.buffer_len();
        let columns = if is_math(&self.channels[channel]) {
            // trimmed to the first frame
            0..values.len().min(self.plan.points)
        } else {
            self.plan.columns(chunk, values.len())
        };
        let n = columns.len();
        let row = &mut self.data[channel * len..(channel + 1) * len];
        row[columns].copy_from_slice(&values[..n]);
    }

    fn complete(&mut self) -> crate::Result<Waveforms> {
        let time = self.planned.time_axis(self.grid)?;
        Ok(Waveforms {
            channels: self.channels.clone(),
            time,
            frames: self.plan.frames,
            points: self.plan.points,
            data: std::mem::take(&mut self.data),
        })
    }
}

/// Math function channels always return the full waveform in one block, so they are requested once.
fn chunks_of(plan: &AcquisitionPlan, channel: &str) -> usize {
    if is_math(channel) {
        plan.n_chunks.min(1)
    } else {
        plan.n_chunks
    }
}

/// Retrieve complete waveforms of `channels`.
///
/// `done` receives `None` if the instrument has no new acquisition. It is called once all planned
/// chunks were attempted: chunks which failed are left as NaN and do not fail the acquisition.
pub fn acquire(
    dispatcher: &Dispatcher,
    store: &ParameterStore,
    channels: Vec<String>,
    done: Completion<Option<Waveforms>>,
) {
    let finish = Finish::new(done);
    let on_err = finish.clone();
    let d = dispatcher.clone();
    let s = store.clone();
    let cmd = Command::query("INR?")
        .on_success(move |data| match scpi::parse_inr(&data) {
            Ok(true) => {
                log::debug!("Retrieving new waveform data.");
                start(&d, &s, channels, finish);
            }
            Ok(false) => {
                log::debug!("No new waveform data available.");
                finish.finish(Ok(None));
            }
            Err(err) => finish.finish(Err(err)),
        })
        .on_error(move |err| on_err.finish(Err(err)));
    dispatcher.enqueue(cmd);
}

fn start(dispatcher: &Dispatcher, store: &ParameterStore, channels: Vec<String>, finish: Finish) {
    if let Some(analog) = channels.iter().find(|x| is_analog(x)) {
        dispatcher.enqueue(Command::write(format!(":WAV:SOUR {}", analog)));
    }
    let d = dispatcher.clone();
    let s = store.clone();
    store.refresh(
        dispatcher,
        Some(Box::new(move |wfp| match wfp {
            Ok(wfp) => enqueue_plan(&d, &s, channels, wfp, finish),
            Err(err) => finish.finish(Err(err)),
        })),
    );
}

fn enqueue_plan(
    dispatcher: &Dispatcher,
    store: &ParameterStore,
    channels: Vec<String>,
    wfp: WaveformParameters,
    finish: Finish,
) {
    let plan = match AcquisitionPlan::new(&wfp) {
        Ok(x) => x,
        Err(err) => return finish.finish(Err(err)),
    };
    let model = store.model();
    let mut assembly = Assembly {
        data: vec![f32::NAN; channels.len() * plan.buffer_len()],
        channels,
        plan,
        planned: wfp,
        grid: model.waveform_grid,
        attempted: 0,
    };
    log::debug!(
        "Acquiring {} channels with {} frames of {} points in {} chunks each.",
        assembly.channels.len(),
        assembly.plan.frames,
        assembly.plan.points,
        assembly.plan.n_chunks
    );
    if assembly.total() == 0 {
        return finish.finish(assembly.complete().map(Some));
    }
    let channels = assembly.channels.clone();
    let plan = assembly.plan.clone();
    let assembly = Arc::new(Mutex::new(assembly));

    dispatcher.enqueue(Command::write(":WAV:SEQ 0,1"));
    for (channel_i, channel) in channels.iter().enumerate() {
        dispatcher.enqueue(Command::write(format!(":WAV:SOUR {}", channel)));
        let n_chunks = chunks_of(&plan, channel);
        for chunk_i in 0..n_chunks {
            dispatcher.enqueue(store.preamble(None));
            let on_data = chunk_handler(store, &assembly, &finish, channel_i, chunk_i);
            let on_err = on_data.clone();
            let cmd = Command::binary(":WAV:DATA?")
                .delimiter(DATA_DELIMITER)
                .on_success(move |data| on_data.handle(Ok(data)))
                .on_error(move |err| on_err.handle(Err(err)));
            dispatcher.enqueue(cmd);
            if chunk_i + 1 == n_chunks {
                continue;
            }
            match plan.advance(chunk_i) {
                Some(Advance::StartPoint(x)) => dispatcher.enqueue(Command::write(format!(":WAV:STAR {}", x))),
                Some(Advance::FrameIndex(x)) => dispatcher.enqueue(Command::write(format!(":WAV:SEQ 0,{}", x))),
                None => {}
            }
        }
        dispatcher.enqueue(Command::write(format!(":WAV:STAR {}", plan.start)));
        store.refresh(dispatcher, None);
    }
}

fn chunk_handler(
    store: &ParameterStore,
    assembly: &Arc<Mutex<Assembly>>,
    finish: &Finish,
    channel: usize,
    chunk: usize,
) -> ChunkHandler {
    ChunkHandler {
        store: store.clone(),
        assembly: assembly.clone(),
        finish: finish.clone(),
        channel,
        chunk,
    }
}

#[derive(Clone)]
struct ChunkHandler {
    store: ParameterStore,
    assembly: Arc<Mutex<Assembly>>,
    finish: Finish,
    channel: usize,
    chunk: usize,
}

impl ChunkHandler {
    fn convert(&self, assembly: &Assembly, name: &str, data: &[u8]) -> crate::Result<Vec<f32>> {
        // the preamble refreshed right before this chunk describes its scaling
        let wfp = self.store.snapshot();
        let values = wfp.to_volts(data, &self.store.model())?;
        if is_math(name) {
            // the window is the planned one, the instrument's start point may have moved since
            assembly.planned.trim(&values)
        } else {
            Ok(values)
        }
    }

    fn handle(&self, result: crate::Result<Vec<u8>>) {
        let mut assembly = match self.assembly.lock() {
            Ok(x) => x,
            Err(poisoned) => poisoned.into_inner(),
        };
        let name = assembly.channels[self.channel].clone();
        let n_chunks = chunks_of(&assembly.plan, &name);
        match result.and_then(|data| self.convert(&assembly, &name, &data)) {
            Ok(values) if values.is_empty() => {
                log::debug!("No data received for chunk {} of {}.", self.chunk + 1, name);
            }
            Ok(values) => {
                log::debug!(
                    "Received waveform chunk {}/{} for {}, length = {} points.",
                    self.chunk + 1,
                    n_chunks,
                    name,
                    values.len()
                );
                assembly.insert(self.channel, self.chunk, &values);
            }
            Err(err) => {
                log::warn!("Chunk {}/{} of {} failed: {}", self.chunk + 1, n_chunks, name, err);
            }
        }
        assembly.attempted += 1;
        if assembly.attempted == assembly.total() {
            let result = assembly.complete().map(Some);
            drop(assembly);
            self.finish.finish(result);
        }
    }
}

/// Check a channel list before planning an acquisition.
pub fn validate_channels(channels: &[String]) -> crate::Result<()> {
    if channels.is_empty() {
        return Err(Error::argument(anyhow::anyhow!("No channels to acquire")));
    }
    Ok(())
}
