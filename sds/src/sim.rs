//! Simulated instrument speaking the SCPI subset used by this crate, for tests.
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{LittleEndian, WriteBytesExt};
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use sds_protocol::scpi::{block_header, PNG_DELIMITER};
use sds_protocol::tables::{is_math, source_index};
use sds_protocol::{FieldValue, Preamble};

use crate::config::{ScopeConfig, Timeouts, DEFAULT_BUFFER_LIMIT};
use crate::connector::StreamConnector;
use crate::dispatcher::Dispatcher;
use crate::framing::Framing;
use crate::scope::Scope;

pub const PNG_DATA: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR fake image";

pub struct SimState {
    pub received: Vec<String>,
    pub wave_array_max: u32,
    /// As configured by `:WAV:POIN`, 0 selects all points.
    pub points: u32,
    pub start: u32,
    pub interval: u32,
    pub chunk_size_max: u32,
    pub frames_sum: u32,
    pub frames_read: u32,
    pub source: String,
    pub word: bool,
    pub inr: u32,
    pub inr_reply: Option<String>,
    pub maxpoints_reply: Option<String>,
    /// Leave the n-th data request after selecting the given source unanswered.
    pub swallow: Option<(String, usize)>,
    /// Commands which are never answered.
    pub muted: Vec<String>,
    /// Close the connection when this command arrives.
    pub hangup_on: Option<String>,
    data_requests: usize,
    frame_cursor: u32,
}

impl Default for SimState {
    fn default() -> Self {
        SimState {
            received: Vec::new(),
            wave_array_max: 10_000,
            points: 0,
            start: 0,
            interval: 1,
            chunk_size_max: 2_500_000,
            frames_sum: 1,
            frames_read: 1,
            source: "C1".to_string(),
            word: true,
            inr: 1,
            inr_reply: None,
            maxpoints_reply: None,
            swallow: None,
            muted: Vec::new(),
            hangup_on: None,
            data_requests: 0,
            frame_cursor: 0,
        }
    }
}

enum Action {
    Reply(Vec<u8>),
    Silent,
    Hangup,
}

fn line(x: String) -> Action {
    let mut ret = x.into_bytes();
    ret.push(b'\n');
    Action::Reply(ret)
}

/// Raw ADC code of sample `index` of channel `name`.
pub fn sample(name: &str, index: usize) -> i16 {
    let channel = (source_index(name).unwrap_or(0) % 16) as i16;
    (channel + 1) * 1000 + (index % 997) as i16
}

impl SimState {
    pub fn mute(&mut self, cmd: &str) {
        self.muted.push(cmd.to_string());
    }

    fn effective_points(&self) -> u32 {
        if self.points == 0 {
            self.wave_array_max
        } else {
            self.points
        }
    }

    fn preamble(&self) -> Vec<u8> {
        let mut preamble = Preamble::default();
        preamble
            .set("descriptor_name", FieldValue::Text("WAVEDESC".to_string()))
            .unwrap()
            .set("instrument_name", FieldValue::Text("SDS824X HD".to_string()))
            .unwrap()
            .set("wave_array_max", FieldValue::I32(self.wave_array_max as i32))
            .unwrap()
            .set("wave_array_start", FieldValue::I32(self.start as i32))
            .unwrap()
            .set("wave_array_interval", FieldValue::I32(self.interval as i32))
            .unwrap()
            .set("frames_index", FieldValue::I32(1))
            .unwrap()
            .set("frames_read", FieldValue::I32(self.frames_read as i32))
            .unwrap()
            .set("frames_sum", FieldValue::I32(self.frames_sum as i32))
            .unwrap()
            .set("vertical_gain", FieldValue::F32(1.0))
            .unwrap()
            .set("vertical_offset", FieldValue::F32(0.0))
            .unwrap()
            .set("code_per_div", FieldValue::F32(1.0))
            .unwrap()
            .set("horizontal_interval", FieldValue::F32(1e-9))
            .unwrap()
            .set("horizontal_offset", FieldValue::F64(0.0))
            .unwrap()
            .set("time_base", FieldValue::U16(11))
            .unwrap()
            .set("probe_attenuation", FieldValue::F32(1.0))
            .unwrap()
            .set("bandwidth_limit", FieldValue::U16(0))
            .unwrap()
            .set("wave_source", FieldValue::U16(source_index(&self.source).unwrap_or(0)))
            .unwrap();
        let data = preamble.encode();
        let mut ret = b"DESC,".to_vec();
        ret.extend_from_slice(&block_header(data.len()));
        ret.extend_from_slice(&data);
        ret.push(b'\n');
        ret
    }

    fn sample_indices(&mut self) -> Vec<usize> {
        let points = self.effective_points() as usize;
        if is_math(&self.source) {
            return (0..self.wave_array_max as usize).collect();
        }
        if self.frames_sum > 1 {
            let frames = self.frames_read.min(self.frames_sum.saturating_sub(self.frame_cursor));
            let first = self.frame_cursor as usize;
            self.frame_cursor += frames;
            return (first * points..(first + frames as usize) * points).collect();
        }
        let interval = self.interval.max(1) as usize;
        let available = (self.wave_array_max.saturating_sub(self.start) as usize + interval - 1) / interval;
        let n = points.min(self.chunk_size_max as usize).min(available);
        (0..n).map(|k| self.start as usize + k * interval).collect()
    }

    fn waveform(&mut self) -> Action {
        let request = self.data_requests;
        self.data_requests += 1;
        if let Some((channel, n)) = &self.swallow {
            if *channel == self.source && *n == request {
                return Action::Silent;
            }
        }
        let mut data = Vec::new();
        for index in self.sample_indices() {
            let code = sample(&self.source, index);
            if self.word {
                WriteBytesExt::write_i16::<LittleEndian>(&mut data, code).unwrap();
            } else {
                data.push(code as i8 as u8);
            }
        }
        let mut ret = format!("{}:WF DAT2,", self.source).into_bytes();
        ret.extend_from_slice(format!("#9{:09}", data.len()).as_bytes());
        ret.extend_from_slice(&data);
        ret.extend_from_slice(b"\n\n");
        Action::Reply(ret)
    }

    fn handle(&mut self, cmd: &str) -> Action {
        self.received.push(cmd.to_string());
        if self.hangup_on.as_deref() == Some(cmd) {
            return Action::Hangup;
        }
        if self.muted.iter().any(|x| x == cmd) {
            return Action::Silent;
        }
        let (head, arg) = match cmd.split_once(' ') {
            Some((head, arg)) => (head, arg.trim()),
            None => (cmd, ""),
        };
        let number = || arg.parse::<u32>().unwrap_or(0);
        match head {
            "*IDN?" => line("Siglent Technologies,SDS824X HD,SIM0000001,1.0".to_string()),
            "INR?" => line(
                self.inr_reply
                    .clone()
                    .unwrap_or_else(|| format!("INR {}", self.inr)),
            ),
            "TRIG:STAT?" => line("Stop".to_string()),
            ":WAV:MAXP?" => line(
                self.maxpoints_reply
                    .clone()
                    .unwrap_or_else(|| self.chunk_size_max.to_string()),
            ),
            ":WAV:POIN?" => line(self.points.to_string()),
            ":WAV:PRE?" => Action::Reply(self.preamble()),
            ":WAV:DATA?" => self.waveform(),
            ":PRIN?" => {
                let mut ret = PNG_DATA.to_vec();
                ret.extend_from_slice(PNG_DELIMITER);
                Action::Reply(ret)
            }
            ":WAV:SOUR" => {
                self.source = arg.to_string();
                self.data_requests = 0;
                self.frame_cursor = 0;
                Action::Silent
            }
            ":WAV:STAR" => {
                self.start = number();
                Action::Silent
            }
            ":WAV:POIN" => {
                self.points = number();
                Action::Silent
            }
            ":WAV:INT" => {
                self.interval = number().max(1);
                Action::Silent
            }
            ":WAV:WIDT" => {
                self.word = arg != "BYTE";
                Action::Silent
            }
            ":WAV:SEQ" => {
                if arg == "0,1" {
                    self.frame_cursor = 0;
                }
                Action::Silent
            }
            _ => Action::Silent,
        }
    }
}

#[derive(Clone, Default)]
pub struct Simulator {
    state: Arc<Mutex<SimState>>,
}

impl Simulator {
    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn received(&self) -> Vec<String> {
        self.state().received.clone()
    }

    pub fn sample(&self, name: &str, index: usize) -> i16 {
        sample(name, index)
    }

    pub fn timeouts() -> Timeouts {
        Timeouts {
            text: sds_protocol::Duration::from_millis(500),
            block_header: sds_protocol::Duration::from_millis(500),
            block_payload: sds_protocol::Duration::from_secs(30),
            drain: sds_protocol::Duration::from_millis(20),
            ..Timeouts::default()
        }
    }

    pub fn framing() -> Framing {
        Framing::new(Self::timeouts(), DEFAULT_BUFFER_LIMIT)
    }

    pub fn config() -> ScopeConfig {
        ScopeConfig {
            timeouts: Self::timeouts(),
            ..ScopeConfig::default()
        }
    }

    /// Connect a new client. Must be called within a tokio runtime, which drives the instrument.
    pub fn connector(&self) -> StreamConnector<DuplexStream> {
        let (client, instrument) = duplex(1 << 20);
        tokio::spawn(serve(self.state.clone(), instrument));
        StreamConnector::new(client, "simulator")
    }

    pub fn spawn_dispatcher(&self) -> Dispatcher {
        Dispatcher::spawn(self.connector(), Self::framing())
    }

    pub fn start_dispatcher(&self) -> crate::Result<Dispatcher> {
        let sim = self.clone();
        Dispatcher::start(move || async move { Ok(sim.connector()) }, Self::framing())
    }

    pub fn open_scope(&self) -> crate::Result<Scope> {
        let sim = self.clone();
        Scope::open(move || async move { Ok(sim.connector()) }, Self::config())
    }
}

async fn serve(state: Arc<Mutex<SimState>>, stream: DuplexStream) {
    let (rd, mut wr) = split(stream);
    let mut lines = BufReader::new(rd).lines();
    while let Ok(Some(cmd)) = lines.next_line().await {
        let action = state.lock().unwrap().handle(cmd.trim());
        match action {
            Action::Reply(data) => {
                if wr.write_all(&data).await.is_err() {
                    break;
                }
            }
            Action::Silent => {}
            Action::Hangup => break,
        }
    }
}
