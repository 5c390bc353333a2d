//! The single consumer of the command queue and the only writer to the transport.
//!
//! Commands are executed strictly in the order they were enqueued: a command is written, its
//! reply read and its callbacks invoked before the next command is dequeued. Callbacks run on
//! the worker and may enqueue further commands through a cloned [`Dispatcher`].
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

use crate::connector::Connector;
use crate::framing::Framing;
use crate::Error;

pub type Callback = Box<dyn FnOnce(Vec<u8>) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(Error) + Send>;
pub type Completion<T> = Box<dyn FnOnce(crate::Result<T>) + Send>;

/// What reply a command expects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expect {
    Nothing,
    /// Text terminated by the given delimiter.
    Text(Vec<u8>),
    /// A `#`-prefixed binary block followed by the given delimiter.
    Binary(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Scpi(String),
    /// Pause the queue instead of talking to the instrument.
    Wait(Duration),
}

pub struct Command {
    payload: Payload,
    expect: Expect,
    post_wait: Option<Duration>,
    on_success: Option<Callback>,
    on_error: Option<ErrorCallback>,
    reply: Option<Completion<Vec<u8>>>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("payload", &self.payload)
            .field("expect", &self.expect)
            .field("post_wait", &self.post_wait)
            .finish()
    }
}

impl Command {
    fn new(payload: Payload, expect: Expect) -> Self {
        Command {
            payload,
            expect,
            post_wait: None,
            on_success: None,
            on_error: None,
            reply: None,
        }
    }

    /// A command without reply.
    pub fn write<T: Into<String>>(cmd: T) -> Self {
        Self::new(Payload::Scpi(cmd.into()), Expect::Nothing)
    }

    /// A query answered by a newline terminated text.
    pub fn query<T: Into<String>>(cmd: T) -> Self {
        Self::new(Payload::Scpi(cmd.into()), Expect::Text(b"\n".to_vec()))
    }

    /// A query answered by a binary block terminated by a newline.
    pub fn binary<T: Into<String>>(cmd: T) -> Self {
        Self::new(Payload::Scpi(cmd.into()), Expect::Binary(b"\n".to_vec()))
    }

    pub fn wait(duration: Duration) -> Self {
        Self::new(Payload::Wait(duration), Expect::Nothing)
    }

    /// Replace the delimiter of the expected reply. Has no effect on commands without reply.
    pub fn delimiter(mut self, delimiter: &[u8]) -> Self {
        match &mut self.expect {
            Expect::Text(x) | Expect::Binary(x) => *x = delimiter.to_vec(),
            Expect::Nothing => {}
        }
        self
    }

    /// Pause the queue for `wait` after the command completed, before its callbacks run.
    pub fn post_wait(mut self, wait: Duration) -> Self {
        self.post_wait = if wait.is_zero() { None } else { Some(wait) };
        self
    }

    pub fn on_success<F: FnOnce(Vec<u8>) + Send + 'static>(mut self, f: F) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error<F: FnOnce(Error) + Send + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called with the outcome after the callbacks.
    pub(crate) fn reply(mut self, f: Completion<Vec<u8>>) -> Self {
        self.reply = Some(f);
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn expect(&self) -> &Expect {
        &self.expect
    }

    pub fn get_post_wait(&self) -> Option<Duration> {
        self.post_wait
    }

    pub fn name(&self) -> String {
        match &self.payload {
            Payload::Scpi(x) => x.clone(),
            Payload::Wait(x) => format!("WAIT {}", x.as_secs_f64()),
        }
    }

    fn resolve(self, result: crate::Result<Vec<u8>>) {
        let name = self.name();
        let Command {
            on_success,
            on_error,
            reply,
            ..
        } = self;
        match result {
            Ok(data) => match (on_success, reply) {
                (Some(cb), Some(reply)) => {
                    cb(data.clone());
                    reply(Ok(data));
                }
                (Some(cb), None) => cb(data),
                (None, Some(reply)) => reply(Ok(data)),
                (None, None) => {}
            },
            Err(err) => {
                match (on_error, &reply) {
                    (Some(cb), _) => cb(err.clone()),
                    (None, None) => log::error!("Command `{}` failed: {}", name, err),
                    (None, Some(_)) => {}
                }
                if let Some(reply) = reply {
                    reply(Err(err));
                }
            }
        }
    }
}

struct Shared {
    pending: AtomicUsize,
    connected: AtomicBool,
    close: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Mutex<Option<ThreadId>>,
}

/// Handle to the command queue. Cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl Dispatcher {
    fn create() -> (Self, mpsc::UnboundedReceiver<Command>, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            pending: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            close: Mutex::new(Some(close_tx)),
            worker: Mutex::new(None),
            worker_id: Mutex::new(None),
        });
        (Dispatcher { tx, shared }, rx, close_rx)
    }

    /// Run the worker as a task on the current tokio runtime.
    pub fn spawn<C: Connector + 'static>(connector: C, framing: Framing) -> Self {
        let (ret, rx, close) = Self::create();
        ret.shared.connected.store(true, Ordering::SeqCst);
        tokio::task::spawn(run(connector, framing, rx, close, ret.shared.clone()));
        ret
    }

    /// Run the worker on a dedicated thread with its own runtime. `connect` is evaluated on the
    /// worker and its outcome is reported before this function returns.
    pub fn start<F, Fut, C>(connect: F, framing: Framing) -> crate::Result<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = crate::Result<C>>,
        C: Connector + 'static,
    {
        let (ret, rx, close) = Self::create();
        let shared = ret.shared.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let handle = thread::Builder::new()
            .name("sds-dispatcher".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = ready_tx.send(Err(Error::transport(err)));
                        return;
                    }
                };
                rt.block_on(async move {
                    match connect().await {
                        Ok(connector) => {
                            shared.connected.store(true, Ordering::SeqCst);
                            let _ = ready_tx.send(Ok(()));
                            run(connector, framing, rx, close, shared).await;
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                        }
                    }
                });
            })
            .map_err(Error::transport)?;
        *lock(&ret.shared.worker_id) = Some(handle.thread().id());
        *lock(&ret.shared.worker) = Some(handle);
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(ret),
            Ok(Err(err)) => {
                ret.join();
                Err(err)
            }
            Err(_) => {
                ret.join();
                Err(Error::Disconnected)
            }
        }
    }

    /// Append a command to the queue. Never blocks. If the worker has stopped, the command
    /// fails with [`Error::Disconnected`] right away.
    pub fn enqueue(&self, cmd: Command) {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(cmd) {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            log::debug!("Dispatcher stopped, dropping `{}`", cmd.name());
            cmd.resolve(Err(Error::Disconnected));
        }
    }

    /// Enqueue a command and wait for its outcome.
    pub async fn request(&self, cmd: Command) -> crate::Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(cmd.reply(Box::new(move |x| {
            let _ = tx.send(x);
        })));
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// True if connected and no command is queued or in flight.
    pub fn ready(&self) -> bool {
        self.is_connected() && self.pending() == 0
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Number of commands queued or in flight.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn on_worker_thread(&self) -> bool {
        *lock(&self.shared.worker_id) == Some(thread::current().id())
    }

    /// Stop the worker. The command in flight and all queued commands fail with
    /// [`Error::Disconnected`].
    pub fn close(&self) {
        if let Some(tx) = lock(&self.shared.close).take() {
            log::info!("Closing connection.");
            let _ = tx.send(());
        }
        if !self.on_worker_thread() {
            self.join();
        }
    }

    fn join(&self) {
        let handle = lock(&self.shared.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Dispatcher worker panicked.");
            }
        }
    }
}

fn lock<T>(x: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match x.lock() {
        Ok(x) => x,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Write a command and read its reply.
async fn transact<C: Connector + ?Sized>(
    conn: &mut C,
    framing: &Framing,
    cmd: &str,
    expect: &Expect,
) -> crate::Result<Vec<u8>> {
    log::debug!("Sending command: {}", cmd);
    let mut line = Vec::with_capacity(cmd.len() + 1);
    line.extend_from_slice(cmd.as_bytes());
    line.push(b'\n');
    conn.write_all(&line).await?;
    conn.flush().await?;
    match expect {
        Expect::Nothing => Ok(Vec::new()),
        Expect::Text(delimiter) => framing.read_text(conn, delimiter).await,
        Expect::Binary(delimiter) => framing.read_binary(conn, delimiter).await,
    }
}

async fn execute<C: Connector + ?Sized>(
    conn: &mut C,
    framing: &Framing,
    payload: &Payload,
    expect: &Expect,
    post_wait: Option<Duration>,
    resync: bool,
) -> crate::Result<Vec<u8>> {
    let ret = match payload {
        Payload::Wait(duration) => {
            log::debug!("Waiting for {:?} before sending next command.", duration);
            sleep(*duration).await;
            Ok(Vec::new())
        }
        Payload::Scpi(text) => {
            if resync {
                log::debug!("Previous command failed, first flushing read buffer.");
                framing.resync(conn).await;
            }
            transact(conn, framing, text, expect).await
        }
    };
    if let Some(wait) = post_wait {
        sleep(wait).await;
    }
    ret
}

async fn run<C: Connector>(
    mut conn: C,
    framing: Framing,
    mut rx: mpsc::UnboundedReceiver<Command>,
    mut close: oneshot::Receiver<()>,
    shared: Arc<Shared>,
) {
    log::info!("Connection established with {}.", conn.name());
    let mut last_failed = false;
    loop {
        let cmd = tokio::select! {
            biased;
            _ = &mut close => break,
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };
        let outcome = tokio::select! {
            biased;
            _ = &mut close => None,
            x = execute(&mut conn, &framing, &cmd.payload, &cmd.expect, cmd.post_wait, last_failed) => Some(x),
        };
        let result = match outcome {
            Some(x) => x,
            None => {
                cmd.resolve(Err(Error::Disconnected));
                shared.pending.fetch_sub(1, Ordering::SeqCst);
                break;
            }
        };
        if let Payload::Scpi(_) = cmd.payload {
            last_failed = result.is_err();
        }
        if let Err(err) = &result {
            log::debug!("Command `{}` failed: {}", cmd.name(), err);
        }
        let eof = conn.at_eof();
        cmd.resolve(result);
        shared.pending.fetch_sub(1, Ordering::SeqCst);
        if eof {
            log::info!("Connection with {} closed.", conn.name());
            break;
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
    rx.close();
    while let Ok(cmd) = rx.try_recv() {
        cmd.resolve(Err(Error::Disconnected));
        shared.pending.fetch_sub(1, Ordering::SeqCst);
    }
    log::debug!("Dispatcher for {} stopped.", conn.name());
}
