//! Cache of the waveform parameters of a connection, refreshed by replies on the dispatcher.
use std::sync::{Arc, Mutex, RwLock};

use sds_protocol::scpi;
use sds_protocol::{DeviceModel, Preamble, WaveformParameters};

use crate::dispatcher::{Command, Completion, Dispatcher};
use crate::Error;

#[derive(Clone)]
pub struct ParameterStore {
    wfp: Arc<RwLock<WaveformParameters>>,
    model: Arc<RwLock<DeviceModel>>,
}

/// Deliver `result` to `done` if present, otherwise log failures.
fn finish<T>(done: Option<Completion<T>>, what: &str, result: crate::Result<T>) {
    match (done, result) {
        (Some(done), result) => done(result),
        (None, Err(err)) => log::warn!("Unable to update {}: {}", what, err),
        (None, Ok(_)) => {}
    }
}

impl ParameterStore {
    pub fn new(model: DeviceModel) -> Self {
        Self {
            wfp: Arc::new(RwLock::new(WaveformParameters::default())),
            model: Arc::new(RwLock::new(model)),
        }
    }

    /// Copy of the last known parameters. Only fresh right after an update completed.
    pub fn snapshot(&self) -> WaveformParameters {
        match self.wfp.read() {
            Ok(x) => x.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update<T, F: FnOnce(&mut WaveformParameters) -> crate::Result<T>>(&self, f: F) -> crate::Result<T> {
        match self.wfp.write() {
            Ok(mut x) => f(&mut x),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn model(&self) -> DeviceModel {
        match self.model.read() {
            Ok(x) => *x,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_waveform_width(&self, width: u8) {
        let width = if width == 8 { 8 } else { 16 };
        match self.model.write() {
            Ok(mut x) => x.waveform_width = width,
            Err(poisoned) => poisoned.into_inner().waveform_width = width,
        }
    }

    /// Forget all parameters, e.g. once the connection is closed.
    pub fn clear(&self) {
        let _ = self.update(|x| {
            *x = WaveformParameters::default();
            Ok(())
        });
    }

    /// `:WAV:PRE?` applying the preamble to the cache.
    pub fn preamble(&self, done: Option<Completion<WaveformParameters>>) -> Command {
        let store = self.clone();
        let done = Arc::new(Mutex::new(done));
        let on_err = done.clone();
        Command::binary(":WAV:PRE?")
            .on_success(move |data| {
                let result = Preamble::decode(&data).and_then(|preamble| {
                    store.update(|wfp| {
                        wfp.apply_preamble(&preamble)?;
                        Ok(wfp.clone())
                    })
                });
                finish(take(&done), "waveform preamble", result);
            })
            .on_error(move |err| finish(take(&on_err), "waveform preamble", Err(err)))
    }

    /// `:WAV:MAXP?` updating `chunk_size_max`.
    pub fn maxpoints(&self, done: Option<Completion<u32>>) -> Command {
        let store = self.clone();
        let done = Arc::new(Mutex::new(done));
        let on_err = done.clone();
        Command::query(":WAV:MAXP?")
            .on_success(move |data| {
                let result = parse_count(&data).and_then(|x| {
                    store.update(|wfp| {
                        wfp.set_chunk_size_max(x);
                        Ok(x)
                    })
                });
                finish(take(&done), "waveform max points", result);
            })
            .on_error(move |err| finish(take(&on_err), "waveform max points", Err(err)))
    }

    /// `:WAV:POIN?` updating `wave_array_points`. A reply of 0 selects all points.
    pub fn points(&self, done: Option<Completion<u32>>) -> Command {
        let store = self.clone();
        let done = Arc::new(Mutex::new(done));
        let on_err = done.clone();
        Command::query(":WAV:POIN?")
            .on_success(move |data| {
                let result = parse_count(&data).and_then(|x| {
                    store.update(|wfp| {
                        wfp.set_points(x);
                        wfp.points()
                    })
                });
                finish(take(&done), "waveform points", result);
            })
            .on_error(move |err| finish(take(&on_err), "waveform points", Err(err)))
    }

    /// Enqueue a refresh of preamble, points and max points. `done` receives the parameters
    /// after the last reply, or the first error encountered.
    pub fn refresh(&self, dispatcher: &Dispatcher, done: Option<Completion<WaveformParameters>>) {
        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        dispatcher.enqueue(self.preamble(Some(record(&first_error))));
        dispatcher.enqueue(self.points(Some(record(&first_error))));
        let store = self.clone();
        dispatcher.enqueue(self.maxpoints(Some(Box::new(move |x: crate::Result<u32>| {
            let earlier = take(&first_error);
            let result = match (x, earlier) {
                (Err(err), _) => Err(err),
                (Ok(_), Some(err)) => Err(err),
                (Ok(_), None) => Ok(store.snapshot()),
            };
            finish(done, "waveform parameters", result);
        }))));
    }
}

/// Completion keeping the first error in `slot`.
fn record<T: 'static>(slot: &Arc<Mutex<Option<Error>>>) -> Completion<T> {
    let slot = slot.clone();
    Box::new(move |x: crate::Result<T>| {
        if let Err(err) = x {
            log::warn!("Unable to refresh waveform parameters: {}", err);
            let mut slot = lock(&slot);
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    })
}

fn lock<T>(x: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match x.lock() {
        Ok(x) => x,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn take<T>(x: &Mutex<Option<T>>) -> Option<T> {
    lock(x).take()
}

fn parse_count(data: &[u8]) -> crate::Result<u32> {
    let x = scpi::parse_int(data)?;
    if x < 0 || x > u32::MAX as i64 {
        return Err(Error::interpretation(anyhow::anyhow!("Count {} out of range", x)));
    }
    Ok(x as u32)
}
