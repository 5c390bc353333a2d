//! Blocking high level control of an oscilloscope.
//!
//! A [`Scope`] owns the dispatcher worker and the waveform parameter cache. Every operation
//! enqueues its commands and blocks until the last of them completed. Operations with a `_with`
//! variant also accept a completion callback instead and return immediately.
use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use tokio::net::TcpStream;

use sds_protocol::scpi::{trim_reply, Value, DATA_DELIMITER, PNG_DELIMITER};
use sds_protocol::tables::is_math;

use crate::acquisition::{self, Waveforms};
use crate::bridge::pending;
use crate::config::ScopeConfig;
use crate::connector::{Connector, StreamConnector};
use crate::dispatcher::{Command, Completion, Dispatcher};
use crate::framing::Framing;
use crate::store::ParameterStore;
use crate::{parse_channel_list, DeviceModel, Error, WaveformParameters};

const RESET_SETTLE: Duration = Duration::from_secs(6);
const AUTOSET_SETTLE: Duration = Duration::from_secs(4);
const CHANNEL_SETTLE: Duration = Duration::from_millis(500);
const MEMDEPTH_SETTLE: Duration = Duration::from_millis(100);
const SEQUENCE_SETTLE: Duration = Duration::from_millis(100);
// `:TIM:SCAL` and friends misbehave if followed immediately by another command
const TIMEBASE_SETTLE: Duration = Duration::from_millis(1);
const VERTICAL_SETTLE: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    Single,
    Normal,
    Auto,
    Force,
}

impl TriggerMode {
    fn keyword(&self) -> &'static str {
        match self {
            TriggerMode::Single => "SINGLE",
            TriggerMode::Normal => "NORMAL",
            TriggerMode::Auto => "AUTO",
            TriggerMode::Force => "FTRIG",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slope {
    Rising,
    Falling,
    Alternate,
}

impl Slope {
    fn keyword(&self) -> &'static str {
        match self {
            Slope::Rising => "RISING",
            Slope::Falling => "FALLING",
            Slope::Alternate => "ALTERNATE",
        }
    }
}

/// Sequence mode setting. A count of 1 or less turns sequence mode off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sequence {
    Count(u32),
    On,
    Off,
}

/// A waveform window given either in points or in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Extent {
    Points(u32),
    Time(f64),
}

fn known<T>(x: Option<T>, name: &str) -> crate::Result<T> {
    x.ok_or_else(|| {
        Error::argument(anyhow!(
            "Waveform parameter `{}` is unknown, update the waveform parameters first",
            name
        ))
    })
}

/// Point index for `:WAV:STAR`. A time is relative to the trigger in the middle of the record.
pub fn start_point(wfp: &WaveformParameters, extent: Option<Extent>) -> crate::Result<u32> {
    let max = known(wfp.wave_array_max, "wave_array_max")? as i64;
    let point = match extent {
        None => 0,
        Some(Extent::Points(x)) => x as i64,
        Some(Extent::Time(t)) => {
            let dt = known(wfp.horizontal_interval, "horizontal_interval")? as f64;
            max / 2 + (t / dt) as i64 - 1
        }
    };
    Ok(point.min(max - 1).max(0) as u32)
}

/// Point count for `:WAV:POIN`, limited to what remains after the start point.
pub fn point_count(wfp: &WaveformParameters, extent: Option<Extent>) -> crate::Result<u32> {
    let max = known(wfp.wave_array_max, "wave_array_max")? as i64;
    let start = wfp.start().map_err(|_| missing_start())? as i64;
    let interval = wfp.interval().unwrap_or(1) as i64;
    let count = match extent {
        None => max,
        Some(Extent::Points(x)) => x as i64,
        Some(Extent::Time(t)) => {
            let dt = known(wfp.horizontal_interval, "horizontal_interval")? as f64;
            (0.5 + t / (dt * interval as f64)) as i64
        }
    };
    let count = if count <= 0 { max } else { count };
    Ok(count.min((max - start).max(0) / interval) as u32)
}

fn missing_start() -> Error {
    Error::argument(anyhow!("Waveform parameter `wave_array_start` is unknown"))
}

/// Decimation for `:WAV:INT`.
pub fn interval_count(wfp: &WaveformParameters, extent: Option<Extent>) -> crate::Result<u32> {
    let ret = match extent {
        None => 1,
        Some(Extent::Points(x)) => x.max(1),
        Some(Extent::Time(t)) => {
            let dt = known(wfp.horizontal_interval, "horizontal_interval")? as f64;
            ((t / dt) as i64).max(1) as u32
        }
    };
    Ok(ret)
}

fn on_off(state: bool) -> &'static str {
    if state {
        "ON"
    } else {
        "OFF"
    }
}

pub struct Scope {
    dispatcher: Dispatcher,
    store: ParameterStore,
    config: ScopeConfig,
}

impl Scope {
    /// Start the worker on the connection produced by `connect` and queue the initial
    /// configuration. Returns once the connection is established.
    pub fn open<F, Fut, C>(connect: F, config: ScopeConfig) -> crate::Result<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = crate::Result<C>>,
        C: Connector + 'static,
    {
        let framing = Framing::new(config.timeouts.clone(), config.buffer_limit);
        let dispatcher = Dispatcher::start(connect, framing)?;
        let store = ParameterStore::new(config.model);
        dispatcher.enqueue(Command::write(format!(":WAV:WIDT {}", config.model.width_keyword())));
        dispatcher.enqueue(store.preamble(None));
        dispatcher.enqueue(store.maxpoints(None));
        dispatcher.enqueue(store.points(None));
        Ok(Scope {
            dispatcher,
            store,
            config,
        })
    }

    /// Connect to the raw socket SCPI port, e.g. `"192.168.1.20"` or `"scope.local:5025"`.
    pub fn connect(addr: &str, config: ScopeConfig) -> crate::Result<Self> {
        let addr = addr.to_string();
        let timeout: Duration = config.timeouts.connect.into();
        Self::open(
            move || async move { StreamConnector::<TcpStream>::connect_tcp(&addr, timeout).await },
            config,
        )
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn model(&self) -> DeviceModel {
        self.store.model()
    }

    fn timeout(&self) -> Duration {
        self.config.timeouts.command.into()
    }

    fn block<T, F>(&self, name: &str, timeout: Duration, f: F) -> crate::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Completion<T>),
    {
        self.dispatcher.check_blocking()?;
        let (done, pending) = pending(name);
        f(done);
        pending.wait(timeout)
    }

    // generic

    /// Queue a command without waiting for it.
    pub fn enqueue(&self, cmd: Command) {
        self.dispatcher.enqueue(cmd)
    }

    /// Send a command and wait for its reply. The timeout covers the post-wait of the command.
    pub fn send(&self, cmd: Command) -> crate::Result<Vec<u8>> {
        let timeout = cmd.get_post_wait().unwrap_or_default() + self.timeout();
        self.dispatcher.send(cmd, timeout)
    }

    pub fn send_timeout(&self, cmd: Command, timeout: Duration) -> crate::Result<Vec<u8>> {
        self.dispatcher.send(cmd, timeout)
    }

    pub fn command(&self, cmd: &str) -> crate::Result<()> {
        self.send(Command::write(cmd)).map(|_| ())
    }

    /// Send a query and interpret the reply. Returns `None` for an empty reply.
    pub fn query(&self, cmd: &str) -> crate::Result<Option<Value>> {
        let reply = self.send(Command::query(cmd))?;
        Ok(Value::parse(&reply))
    }

    /// Pause the command queue.
    pub fn wait(&self, duration: Duration) -> crate::Result<()> {
        self.send_timeout(Command::wait(duration), duration + self.timeout())
            .map(|_| ())
    }

    /// True if connected and no command is outstanding.
    pub fn ready(&self) -> bool {
        self.dispatcher.ready()
    }

    /// Stop the dispatcher and forget the cached waveform parameters.
    pub fn close(&self) {
        self.dispatcher.close();
        self.store.clear();
    }

    // acquisition control

    pub fn reset(&self) -> crate::Result<()> {
        self.send(Command::write("*RST").post_wait(RESET_SETTLE)).map(|_| ())
    }

    pub fn run(&self) -> crate::Result<()> {
        self.command(":TRIG:RUN")
    }

    pub fn stop(&self) -> crate::Result<()> {
        self.command(":TRIG:STOP")
    }

    pub fn trigger_mode(&self, mode: TriggerMode) -> crate::Result<()> {
        self.command(&format!(":TRIG:MODE {}", mode.keyword()))
    }

    /// Select edge triggering, optionally updating its source, level in volts and slope.
    pub fn trigger_edge(&self, source: Option<&str>, level: Option<f64>, slope: Option<Slope>) -> crate::Result<()> {
        if let Some(source) = source {
            let source = if source.chars().all(|c| c.is_ascii_digit()) {
                format!("C{}", source)
            } else {
                source.to_string()
            };
            self.enqueue(Command::write(format!("TRIG:EDGE:SOUR {}", source)));
        }
        if let Some(level) = level {
            self.enqueue(Command::write(format!("TRIG:EDGE:LEV {}", level)).post_wait(TIMEBASE_SETTLE));
        }
        if let Some(slope) = slope {
            self.enqueue(Command::write(format!("TRIG:EDGE:SLOP {}", slope.keyword())));
        }
        self.command("TRIG:TYPE EDGE")
    }

    /// Trigger state in lower case, e.g. `stop`, `ready` or `trig'd`.
    pub fn trigger_status(&self) -> crate::Result<String> {
        let reply = self.send(Command::query("TRIG:STAT?"))?;
        let status = std::str::from_utf8(trim_reply(&reply))
            .map_err(|_| Error::interpretation(anyhow!("Trigger status is not ASCII")))?;
        Ok(status.trim().to_lowercase())
    }

    /// Maximum memory depth, e.g. `"10k"` or `"1M"`.
    pub fn acquire_memdepth(&self, depth: &str) -> crate::Result<()> {
        self.send(Command::write(format!("ACQ:MDEP {}", depth)).post_wait(MEMDEPTH_SETTLE))
            .map(|_| ())
    }

    pub fn sequence(&self, seq: Sequence) -> crate::Result<()> {
        match seq {
            Sequence::Count(n) if n > 1 => {
                self.enqueue(Command::write(format!("ACQ:SEQ:COUN {}", n)));
                self.enqueue(Command::write("ACQ:SEQ ON"));
            }
            Sequence::On => self.enqueue(Command::write("ACQ:SEQ ON")),
            Sequence::Count(_) | Sequence::Off => self.enqueue(Command::write("ACQ:SEQ OFF")),
        }
        self.wait(SEQUENCE_SETTLE)
    }

    /// Run the autoset routine. The instrument does not respond until it is done.
    pub fn autoset(&self) -> crate::Result<WaveformParameters> {
        self.enqueue(Command::write(":AUT"));
        self.wait(AUTOSET_SETTLE)?;
        self.update_waveform_preamble()
    }

    // waveform parameters

    pub fn update_waveform_preamble_with(&self, done: Completion<WaveformParameters>) {
        self.dispatcher.enqueue(self.store.preamble(Some(done)));
    }

    pub fn update_waveform_preamble(&self) -> crate::Result<WaveformParameters> {
        self.block(":WAV:PRE?", self.timeout(), |done| {
            self.update_waveform_preamble_with(done)
        })
    }

    pub fn update_waveform_maxpoints_with(&self, done: Completion<u32>) {
        self.dispatcher.enqueue(self.store.maxpoints(Some(done)));
    }

    pub fn update_waveform_maxpoints(&self) -> crate::Result<u32> {
        self.block(":WAV:MAXP?", self.timeout(), |done| {
            self.update_waveform_maxpoints_with(done)
        })
    }

    pub fn update_waveform_points_with(&self, done: Completion<u32>) {
        self.dispatcher.enqueue(self.store.points(Some(done)));
    }

    pub fn update_waveform_points(&self) -> crate::Result<u32> {
        self.block(":WAV:POIN?", self.timeout(), |done| {
            self.update_waveform_points_with(done)
        })
    }

    pub fn update_waveform_parameters_with(&self, done: Completion<WaveformParameters>) {
        self.store.refresh(&self.dispatcher, Some(done));
    }

    pub fn update_waveform_parameters(&self) -> crate::Result<WaveformParameters> {
        self.block("update_waveform_parameters", self.timeout(), |done| {
            self.update_waveform_parameters_with(done)
        })
    }

    /// Last known waveform parameters, without talking to the instrument.
    pub fn waveform_parameters(&self) -> WaveformParameters {
        self.store.snapshot()
    }

    /// Select 8 or 16 bit samples. Any width other than 8 selects 16 bit.
    pub fn waveform_width(&self, width: u8) -> crate::Result<WaveformParameters> {
        self.store.set_waveform_width(width);
        let keyword = self.store.model().width_keyword();
        self.enqueue(Command::write(format!(":WAV:WIDT {}", keyword)));
        self.update_waveform_preamble()
    }

    /// Select the channel addressed by subsequent waveform requests, e.g. `C1` or `F1`.
    pub fn waveform_source(&self, source: &str) -> crate::Result<WaveformParameters> {
        let source = match parse_channel_list(source)?.as_slice() {
            [x] => x.clone(),
            _ => return Err(Error::argument(anyhow!("Expected a single channel, got `{}`", source))),
        };
        self.enqueue(Command::write(format!(":WAV:SOUR {}", source)));
        self.update_waveform_preamble()
    }

    /// First point returned by waveform requests. Defaults to the first point of the record.
    pub fn waveform_start(&self, start: Option<Extent>) -> crate::Result<WaveformParameters> {
        let point = start_point(&self.store.snapshot(), start)?;
        self.enqueue(Command::write(format!(":WAV:STAR {}", point)));
        self.update_waveform_preamble()
    }

    /// Number of points returned by waveform requests. Defaults to all points.
    pub fn waveform_points(&self, points: Option<Extent>) -> crate::Result<WaveformParameters> {
        let count = point_count(&self.store.snapshot(), points)?;
        self.enqueue(Command::write(format!(":WAV:POIN {}", count)));
        self.update_waveform_preamble()
    }

    /// Spacing of the points returned by waveform requests. Defaults to every point.
    pub fn waveform_interval(&self, interval: Option<Extent>) -> crate::Result<WaveformParameters> {
        let count = interval_count(&self.store.snapshot(), interval)?;
        self.enqueue(Command::write(format!(":WAV:INT {}", count)));
        self.update_waveform_preamble()
    }

    /// Delay between the trigger event and the reference point, in seconds.
    pub fn timebase_delay(&self, delay: f64) -> crate::Result<WaveformParameters> {
        self.enqueue(Command::write(format!(":TIM:DEL {}", delay)).post_wait(TIMEBASE_SETTLE));
        self.update_waveform_parameters()
    }

    /// Seconds per horizontal division.
    pub fn timebase_scale(&self, scale: f64) -> crate::Result<WaveformParameters> {
        self.enqueue(Command::write(format!(":TIM:SCAL {}", scale)).post_wait(TIMEBASE_SETTLE));
        self.update_waveform_parameters()
    }

    // channels

    pub fn channel_switch(&self, channel: u8, state: bool) -> crate::Result<()> {
        self.command(&format!("CHAN{}:SWIT {}", channel, on_off(state)))
    }

    /// Enable the listed analog channels and disable all others.
    pub fn channels_enabled(&self, channels: &str) -> crate::Result<()> {
        let channels = parse_channel_list(channels)?;
        for i in 1..=self.model().analog_channels {
            let state = channels.contains(&format!("C{}", i));
            self.enqueue(Command::write(format!("CHAN{}:SWIT {}", i, on_off(state))));
        }
        self.wait(CHANNEL_SETTLE)
    }

    /// Hidden channels still acquire data.
    pub fn channel_visible(&self, channel: u8, state: bool) -> crate::Result<()> {
        self.command(&format!("CHAN{}:VIS {}", channel, on_off(state)))
    }

    /// Show the listed analog channels and hide all others.
    pub fn channels_visible(&self, channels: &str) -> crate::Result<()> {
        let channels = parse_channel_list(channels)?;
        let n = self.model().analog_channels;
        for i in 1..n {
            let state = channels.contains(&format!("C{}", i));
            self.enqueue(Command::write(format!("CHAN{}:VIS {}", i, on_off(state))));
        }
        self.channel_visible(n, channels.contains(&format!("C{}", n)))
    }

    /// Volts per division, optionally together with offset in volts and skew in seconds.
    pub fn channel_scale(&self, channel: u8, scale: f64, offset: Option<f64>, skew: Option<f64>) -> crate::Result<()> {
        self.enqueue(Command::write(format!("CHAN{}:SCAL {}", channel, scale)).post_wait(VERTICAL_SETTLE));
        if let Some(offset) = offset {
            self.enqueue(Command::write(format!("CHAN{}:OFFS {}", channel, offset)).post_wait(VERTICAL_SETTLE));
        }
        if let Some(skew) = skew {
            self.enqueue(Command::write(format!("CHAN{}:SKEW {}", channel, skew)));
        }
        self.wait(CHANNEL_SETTLE)
    }

    pub fn channel_offset(&self, channel: u8, offset: f64) -> crate::Result<()> {
        self.command(&format!("CHAN{}:OFFS {}", channel, offset))
    }

    pub fn channel_skew(&self, channel: u8, skew: f64) -> crate::Result<()> {
        self.command(&format!("CHAN{}:SKEW {}", channel, skew))
    }

    // data

    /// A single data transfer of the selected source, limited to `chunk_size_max` points.
    /// Returns the time axis and the samples in volts, or `None` if no data was returned.
    pub fn waveform_data(&self) -> crate::Result<Option<(Vec<f64>, Vec<f32>)>> {
        self.dispatcher.check_blocking()?;
        self.store.refresh(&self.dispatcher, None);
        let raw = self.send(Command::binary(":WAV:DATA?").delimiter(DATA_DELIMITER))?;
        if raw.is_empty() {
            log::debug!("No data was received from waveform request.");
            return Ok(None);
        }
        let wfp = self.store.snapshot();
        let model = self.store.model();
        let mut data = wfp.to_volts(&raw, &model)?;
        if wfp.wave_source.as_deref().map(is_math).unwrap_or(false) {
            data = wfp.trim(&data)?;
        }
        let mut time = wfp.time_axis(model.waveform_grid)?;
        let n = time.len().min(data.len());
        time.truncate(n);
        data.truncate(n);
        Ok(Some((time, data)))
    }

    /// Acquire complete waveforms of `channels`, e.g. `"C1,C2"`, in as many transfers as needed.
    /// `done` receives `None` if there is no new acquisition.
    pub fn acquire_waveforms(&self, channels: &str, done: Completion<Option<Waveforms>>) -> crate::Result<()> {
        let channels = parse_channel_list(channels)?;
        acquisition::validate_channels(&channels)?;
        acquisition::acquire(&self.dispatcher, &self.store, channels, done);
        Ok(())
    }

    pub fn get_waveforms(&self, channels: &str) -> crate::Result<Option<Waveforms>> {
        let channels = parse_channel_list(channels)?;
        acquisition::validate_channels(&channels)?;
        self.block("get_waveforms", self.config.timeouts.acquisition.into(), |done| {
            acquisition::acquire(&self.dispatcher, &self.store, channels, done)
        })
    }

    /// Screenshot of the display as PNG image.
    pub fn png(&self) -> crate::Result<Vec<u8>> {
        let mut data = self.send(Command::query(":PRIN? PNG").delimiter(PNG_DELIMITER))?;
        data.pop();
        Ok(data)
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.dispatcher.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Simulator, PNG_DATA};
    use std::time::Instant;

    fn wfp() -> WaveformParameters {
        WaveformParameters {
            wave_array_max: Some(1000),
            wave_array_start: Some(100),
            wave_array_interval: Some(2),
            horizontal_interval: Some(1e-6),
            ..WaveformParameters::default()
        }
    }

    /// Commands the simulator has seen, once everything sent before has been processed.
    fn settled(sim: &Simulator, scope: &Scope) -> Vec<String> {
        scope.query("*IDN?").unwrap();
        let mut received = sim.received();
        assert_eq!(received.pop().as_deref(), Some("*IDN?"));
        received
    }

    #[test]
    fn window_conversions() {
        let wfp = wfp();
        assert_eq!(start_point(&wfp, None).unwrap(), 0);
        assert_eq!(start_point(&wfp, Some(Extent::Points(5000))).unwrap(), 999);
        assert_eq!(start_point(&wfp, Some(Extent::Time(0.0))).unwrap(), 499);
        assert_eq!(start_point(&wfp, Some(Extent::Time(-1.0))).unwrap(), 0);

        assert_eq!(point_count(&wfp, None).unwrap(), 450);
        assert_eq!(point_count(&wfp, Some(Extent::Points(100))).unwrap(), 100);
        assert_eq!(point_count(&wfp, Some(Extent::Points(0))).unwrap(), 450);
        assert_eq!(point_count(&wfp, Some(Extent::Time(20e-6))).unwrap(), 10);

        assert_eq!(interval_count(&wfp, None).unwrap(), 1);
        assert_eq!(interval_count(&wfp, Some(Extent::Points(0))).unwrap(), 1);
        assert_eq!(interval_count(&wfp, Some(Extent::Time(4.5e-6))).unwrap(), 4);

        let unknown = WaveformParameters::default();
        assert!(matches!(start_point(&unknown, None), Err(Error::Argument(_))));
        assert!(point_count(&unknown, Some(Extent::Points(10))).is_err());
    }

    #[test]
    fn open_configures_instrument() {
        let sim = Simulator::default();
        let scope = sim.open_scope().unwrap();
        let wfp = scope.update_waveform_parameters().unwrap();
        assert_eq!(wfp.wave_array_max, Some(10_000));
        assert_eq!(scope.waveform_parameters(), wfp);
        assert_eq!(
            sim.received()[..4],
            [":WAV:WIDT WORD", ":WAV:PRE?", ":WAV:MAXP?", ":WAV:POIN?"]
        );
        // the outstanding count drops right after the reply was delivered
        let started = Instant::now();
        while !scope.ready() {
            assert!(started.elapsed() < Duration::from_secs(1));
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn generic_operations() {
        let sim = Simulator::default();
        let scope = sim.open_scope().unwrap();
        assert_eq!(scope.query(":WAV:MAXP?").unwrap(), Some(Value::Integer(2_500_000)));
        match scope.query("*IDN?").unwrap() {
            Some(Value::Text(x)) => assert!(x.starts_with("Siglent")),
            x => panic!("unexpected reply {:?}", x),
        }
        scope.command(":TRIG:RUN").unwrap();
        assert_eq!(scope.trigger_status().unwrap(), "stop");
        let started = Instant::now();
        scope.wait(Duration::from_millis(50)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        scope.trigger_mode(TriggerMode::Force).unwrap();
        scope.trigger_edge(Some("2"), Some(0.5), Some(Slope::Falling)).unwrap();
        let received = settled(&sim, &scope);
        let tail = &received[received.len() - 5..];
        assert_eq!(
            tail,
            [
                ":TRIG:MODE FTRIG",
                "TRIG:EDGE:SOUR C2",
                "TRIG:EDGE:LEV 0.5",
                "TRIG:EDGE:SLOP FALLING",
                "TRIG:TYPE EDGE"
            ]
        );
    }

    #[test]
    fn waveform_window() {
        let sim = Simulator::default();
        {
            let mut state = sim.state();
            state.wave_array_max = 1000;
            state.start = 100;
        }
        let scope = sim.open_scope().unwrap();
        scope.update_waveform_preamble().unwrap();
        let wfp = scope.waveform_points(Some(Extent::Points(5000))).unwrap();
        assert_eq!(wfp.wave_array_start, Some(100));
        let wfp = scope.waveform_start(Some(Extent::Points(10))).unwrap();
        assert_eq!(wfp.wave_array_start, Some(10));
        scope.waveform_interval(Some(Extent::Points(3))).unwrap();
        assert_eq!(scope.waveform_parameters().wave_array_interval, Some(3));
        let wfp = scope.waveform_source("F2").unwrap();
        assert_eq!(wfp.wave_source.as_deref(), Some("F2"));
        assert!(scope.waveform_source("C1,C2").is_err());
        let wfp = scope.timebase_scale(1e-3).unwrap();
        assert_eq!(wfp.chunk_size_max, Some(2_500_000));
        let received = settled(&sim, &scope);
        assert!(received.contains(&":WAV:POIN 900".to_string()));
        assert!(received.contains(&":WAV:STAR 10".to_string()));
        assert!(received.contains(&":WAV:INT 3".to_string()));
        assert!(received.contains(&":TIM:SCAL 0.001".to_string()));
    }

    #[test]
    fn width_follows_model() {
        let sim = Simulator::default();
        let scope = sim.open_scope().unwrap();
        scope.waveform_width(8).unwrap();
        assert_eq!(scope.model().waveform_width, 8);
        assert!(settled(&sim, &scope).contains(&":WAV:WIDT BYTE".to_string()));
        // 8 bit samples of the simulator are the low byte of its 16 bit codes
        sim.state().wave_array_max = 100;
        let (time, data) = scope.waveform_data().unwrap().unwrap();
        assert_eq!(data.len(), 100);
        assert_eq!(time.len(), 100);
        assert_eq!(data[7], sim.sample("C1", 7) as i8 as f32);
    }

    #[test]
    fn channel_selection() {
        let sim = Simulator::default();
        let scope = sim.open_scope().unwrap();
        scope.channels_enabled("C1 3").unwrap();
        scope.channels_visible("2").unwrap();
        scope.channel_scale(1, 0.2, Some(-0.1), None).unwrap();
        scope.sequence(Sequence::Count(5)).unwrap();
        scope.sequence(Sequence::Count(1)).unwrap();
        let received = settled(&sim, &scope);
        for cmd in [
            "CHAN1:SWIT ON",
            "CHAN2:SWIT OFF",
            "CHAN3:SWIT ON",
            "CHAN4:SWIT OFF",
            "CHAN1:VIS OFF",
            "CHAN2:VIS ON",
            "CHAN4:VIS OFF",
            "CHAN1:SCAL 0.2",
            "CHAN1:OFFS -0.1",
            "ACQ:SEQ:COUN 5",
            "ACQ:SEQ ON",
            "ACQ:SEQ OFF",
        ] {
            assert!(received.contains(&cmd.to_string()), "missing {}", cmd);
        }
        assert!(!received.iter().any(|x| x.starts_with("CHAN1:SKEW")));
        assert!(scope.channels_enabled("C9").is_err());
    }

    #[test]
    fn blocking_acquisition() {
        let sim = Simulator::default();
        sim.state().wave_array_max = 5000;
        let scope = sim.open_scope().unwrap();
        let ret = scope.get_waveforms("1,2").unwrap().unwrap();
        assert_eq!(ret.shape(), (2, 1, 5000));
        assert_eq!(ret.missing(), 0);
        assert_eq!(ret.channel(1)[4999], sim.sample("C2", 4999) as f32);
        assert!(matches!(scope.get_waveforms(""), Err(Error::Argument(_))));

        sim.state().inr = 0;
        assert_eq!(scope.get_waveforms("C1").unwrap(), None);
    }

    #[test]
    fn screenshot() {
        let sim = Simulator::default();
        let scope = sim.open_scope().unwrap();
        let png = scope.png().unwrap();
        assert!(png.starts_with(PNG_DATA));
        assert!(png.ends_with(&PNG_DELIMITER[..PNG_DELIMITER.len() - 1]));
    }

    #[test]
    fn instrument_hangs_up() {
        let sim = Simulator::default();
        sim.state().hangup_on = Some("*IDN?".to_string());
        let scope = sim.open_scope().unwrap();
        let err = scope.query("*IDN?").unwrap_err();
        assert!(err.is_connection_lost(), "{}", err);
        assert!(matches!(scope.command(":TRIG:RUN"), Err(Error::Disconnected)));
        assert!(!scope.ready());
    }

    #[test]
    fn close_forgets_parameters() {
        let sim = Simulator::default();
        let scope = sim.open_scope().unwrap();
        let wfp = scope.update_waveform_parameters().unwrap();
        assert_eq!(wfp.wave_array_max, Some(10_000));
        scope.close();
        assert_eq!(scope.waveform_parameters(), WaveformParameters::default());
        assert!(matches!(scope.query("*IDN?"), Err(Error::Disconnected)));
    }
}
