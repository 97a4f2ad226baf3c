use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

/// Depth decimation rate. `Hz` is resolved against the source's native
/// framerate; `EveryN` expresses the schedule in frames directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DepthRate {
    EveryFrame,
    Hz(f32),
    EveryN(u32),
}

/// Control-surface message kinds. Commands invalid for the current state are
/// rejected with a diagnostic event and do not mutate state.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Skip { frames: u64 },
    ReconfigureDepth(DepthRate),
    Stop,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "Start",
            Command::Pause => "Pause",
            Command::Resume => "Resume",
            Command::Skip { .. } => "Skip",
            Command::ReconfigureDepth(_) => "ReconfigureDepth",
            Command::Stop => "Stop",
        }
    }
}

/// Producer half of the command channel. Enqueue is non-blocking and never
/// fails while the orchestrator is alive; sends to a finished orchestrator
/// are silently discarded.
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
}

impl CommandSender {
    pub fn send(&self, cmd: Command) {
        let _ = self.tx.send(cmd);
    }
}

/// Consumer half, owned by the orchestrator. Commands are applied in enqueue
/// order.
pub struct CommandReceiver {
    rx: Receiver<Command>,
}

pub enum CommandWait {
    Command(Command),
    TimedOut,
    Disconnected,
}

impl CommandReceiver {
    /// Non-blocking poll used at the top of each running-loop iteration.
    pub fn try_next(&self) -> Option<Command> {
        self.rx.try_recv().ok()
    }

    /// Bounded blocking wait used while Ready or Paused.
    pub fn wait_next(&self, timeout: Duration) -> CommandWait {
        match self.rx.recv_timeout(timeout) {
            Ok(cmd) => CommandWait::Command(cmd),
            Err(mpsc::RecvTimeoutError::Timeout) => CommandWait::TimedOut,
            Err(mpsc::RecvTimeoutError::Disconnected) => CommandWait::Disconnected,
        }
    }
}

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel();
    (CommandSender { tx }, CommandReceiver { rx })
}
