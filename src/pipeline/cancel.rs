//! Cooperative stop/proceed requests from signals and the keyboard
//!
//! The signal and input listeners only ever write into [`CancelHandle`];
//! the run loop reads the result once per tick through
//! [`CancellationSource::poll`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flume::{Receiver, Sender};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    None,
    Stop,
    Proceed,
}

/// User signals that take part in the external-signal channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSignal {
    Usr1,
    Usr2,
    Pipe,
}

/// Pending requests. Stops stay set until a poll consumes them, so a later
/// event can never cancel one out.
struct SignalState {
    interrupted: AtomicBool,
    key_stop: AtomicBool,
    signal_stop: AtomicBool,
    proceed: AtomicBool,
    wake: Sender<()>,
}

impl SignalState {
    fn wake(&self) {
        // A full channel already has a wake-up queued.
        let _ = self.wake.try_send(());
    }
}

pub struct CancellationSource {
    state: Arc<SignalState>,
    wake: Receiver<()>,
    keypress: bool,
    signal: bool,
}

/// Write side given to the signal and keyboard listeners
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<SignalState>,
}

impl CancellationSource {
    /// `keypress` enables stop-on-`x`; `signal` enables the USR1/USR2/PIPE
    /// channel. Interrupts always stop.
    pub fn new(keypress: bool, signal: bool) -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            state: Arc::new(SignalState {
                interrupted: AtomicBool::new(false),
                key_stop: AtomicBool::new(false),
                signal_stop: AtomicBool::new(false),
                proceed: AtomicBool::new(false),
                wake: tx,
            }),
            wake: rx,
            keypress,
            signal,
        }
    }

    pub fn handle(&self) -> CancelHandle {
        CancelHandle {
            state: self.state.clone(),
        }
    }

    /// Receiver that gets a message whenever a new event is recorded, so
    /// blocking waits can return early.
    pub fn waker(&self) -> &Receiver<()> {
        &self.wake
    }

    /// Consume whatever arrived since the last poll.
    pub fn poll(&self) -> ControlEvent {
        while self.wake.try_recv().is_ok() {}

        if self.state.interrupted.load(Ordering::Acquire) {
            return ControlEvent::Stop;
        }

        let key_stop = self.keypress && self.state.key_stop.swap(false, Ordering::AcqRel);
        let (signal_stop, proceed) = if self.signal {
            (
                self.state.signal_stop.swap(false, Ordering::AcqRel),
                self.state.proceed.swap(false, Ordering::AcqRel),
            )
        } else {
            (false, false)
        };

        if key_stop || signal_stop {
            ControlEvent::Stop
        } else if proceed {
            ControlEvent::Proceed
        } else {
            ControlEvent::None
        }
    }
}

impl CancelHandle {
    pub fn interrupt(&self) {
        self.state.interrupted.store(true, Ordering::Release);
        self.state.wake();
    }

    pub fn user_signal(&self, sig: UserSignal) {
        let flag = match sig {
            UserSignal::Usr1 => &self.state.proceed,
            UserSignal::Usr2 | UserSignal::Pipe => &self.state.signal_stop,
        };
        flag.store(true, Ordering::Release);
        self.state.wake();
    }

    /// Only `x` and `X` mean anything; other keys just wake the waiter.
    pub fn key_pressed(&self, key: char) {
        if matches!(key, 'x' | 'X') {
            self.state.key_stop.store(true, Ordering::Release);
        }
        self.state.wake();
    }
}

/// Forward process signals into `handle` until the runtime shuts down.
pub async fn listen_for_signals(handle: CancelHandle) -> io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let mut pipe = signal(SignalKind::pipe())?;

    loop {
        tokio::select! {
            Some(()) = interrupt.recv() => {
                info!("Received interrupt");
                handle.interrupt();
            }
            Some(()) = usr1.recv() => {
                debug!("Received SIGUSR1");
                handle.user_signal(UserSignal::Usr1);
            }
            Some(()) = usr2.recv() => {
                debug!("Received SIGUSR2");
                handle.user_signal(UserSignal::Usr2);
            }
            Some(()) = pipe.recv() => {
                debug!("Received SIGPIPE");
                handle.user_signal(UserSignal::Pipe);
            }
            else => return Ok(()),
        }
    }
}

/// Forward the first character of every stdin line into `handle`.
pub async fn listen_for_keys(handle: CancelHandle) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        handle.key_pressed(line.chars().next().unwrap_or('\n'));
    }
    Ok(())
}
