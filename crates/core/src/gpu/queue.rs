use std::any::Any;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, trace, warn};

use super::event::{Completion, SharedEvent};
use crate::error::GpuError;

type PassFn = Box<dyn FnOnce() -> Result<(), GpuError> + Send + 'static>;
type CheckpointFn = Box<dyn FnOnce(Option<GpuError>) + Send + 'static>;
type DiscardFn = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Pass { label: String, run: PassFn },
    Signal { label: String, event: SharedEvent, value: u64 },
    Wait { label: String, event: SharedEvent, value: u64 },
    Checkpoint { label: String, run: CheckpointFn },
}

impl Command {
    fn label(&self) -> &str {
        match self {
            Self::Pass { label, .. }
            | Self::Signal { label, .. }
            | Self::Wait { label, .. }
            | Self::Checkpoint { label, .. } => label,
        }
    }
}

struct Batch {
    label: String,
    commands: Vec<Command>,
    done: Arc<Completion<Result<(), GpuError>>>,
}

/// In-order GPU queue backed by a dedicated worker thread.
///
/// Committed streams execute strictly in submission order. A failing pass
/// does not stop the rest of its stream; the stream's result is its first
/// failure.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    label: String,
    sender: Mutex<Sender<Batch>>,
}

impl CommandQueue {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let (sender, receiver) = channel::<Batch>();
        let worker_label = label.clone();
        thread::spawn(move || run_worker(worker_label, receiver));
        Self {
            inner: Arc::new(QueueInner {
                label,
                sender: Mutex::new(sender),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn create_stream(&self, label: impl Into<String>) -> CommandStream {
        CommandStream {
            label: label.into(),
            queue: self.clone(),
            commands: Vec::new(),
            discard_hooks: Vec::new(),
        }
    }

    fn submit(&self, batch: Batch) -> Result<(), Batch> {
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sender.send(batch).map_err(|error| error.0)
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("label", &self.inner.label)
            .finish()
    }
}

/// Recorded GPU work. Nothing runs until [`CommandStream::commit`].
///
/// Dropping an uncommitted stream runs its discard hooks so that anything
/// waiting on work recorded here can be released.
pub struct CommandStream {
    label: String,
    queue: CommandQueue,
    commands: Vec<Command>,
    discard_hooks: Vec<DiscardFn>,
}

impl CommandStream {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn encode_pass<F>(&mut self, label: impl Into<String>, run: F)
    where
        F: FnOnce() -> Result<(), GpuError> + Send + 'static,
    {
        self.commands.push(Command::Pass {
            label: label.into(),
            run: Box::new(run),
        });
    }

    pub fn encode_signal(&mut self, event: &SharedEvent, value: u64) {
        self.commands.push(Command::Signal {
            label: format!("signal:{}", event.label()),
            event: event.clone(),
            value,
        });
    }

    pub fn encode_wait(&mut self, event: &SharedEvent, value: u64) {
        self.commands.push(Command::Wait {
            label: format!("wait:{}", event.label()),
            event: event.clone(),
            value,
        });
    }

    /// Records a callback that receives the first pass failure since the
    /// previous checkpoint of this stream, if any.
    pub fn encode_checkpoint<F>(&mut self, label: impl Into<String>, run: F)
    where
        F: FnOnce(Option<GpuError>) + Send + 'static,
    {
        self.commands.push(Command::Checkpoint {
            label: label.into(),
            run: Box::new(run),
        });
    }

    /// Records whatever `record` encodes, but makes every pass of it a no-op
    /// once `skip` is set at execution time.
    pub fn encode_unless<R>(
        &mut self,
        skip: &Arc<AtomicBool>,
        record: impl FnOnce(&mut CommandStream) -> R,
    ) -> R {
        let mut section = self.queue.create_stream(format!("{}.gated", self.label));
        let result = record(&mut section);
        self.discard_hooks.append(&mut section.discard_hooks);
        for command in section.commands.drain(..) {
            let command = match command {
                Command::Pass { label, run } => {
                    let skip = Arc::clone(skip);
                    let gated_label = label.clone();
                    Command::Pass {
                        label,
                        run: Box::new(move || {
                            if skip.load(Ordering::Acquire) {
                                trace!(command = %gated_label, "Skipping gated pass");
                                return Ok(());
                            }
                            run()
                        }),
                    }
                }
                other => other,
            };
            self.commands.push(command);
        }
        result
    }

    pub fn on_discard<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.discard_hooks.push(Box::new(hook));
    }

    pub fn labels(&self) -> Vec<&str> {
        self.commands.iter().map(Command::label).collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commit(mut self) -> Submission {
        let done = Completion::new();
        let hooks = mem::take(&mut self.discard_hooks);
        let batch = Batch {
            label: self.label.clone(),
            commands: mem::take(&mut self.commands),
            done: Arc::clone(&done),
        };

        trace!(stream = %self.label, commands = batch.commands.len(), "Committing command stream");
        if let Err(batch) = self.queue.submit(batch) {
            warn!(stream = %batch.label, "Command queue is closed; discarding stream");
            drop(batch);
            for hook in hooks {
                hook();
            }
            done.complete(Err(GpuError::QueueClosed));
        }

        Submission {
            label: self.label.clone(),
            done,
        }
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        if self.discard_hooks.is_empty() {
            return;
        }
        debug!(
            stream = %self.label,
            commands = self.commands.len(),
            "Command stream dropped without commit"
        );
        for hook in self.discard_hooks.drain(..) {
            hook();
        }
    }
}

/// Handle to a committed stream.
pub struct Submission {
    label: String,
    done: Arc<Completion<Result<(), GpuError>>>,
}

impl Submission {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_complete(&self) -> bool {
        self.done.is_complete()
    }

    /// Blocks until every command of the stream has executed.
    pub fn wait(self) -> Result<(), GpuError> {
        self.done.wait()
    }
}

fn run_worker(label: String, receiver: Receiver<Batch>) {
    for batch in receiver {
        let result = execute(&batch.label, batch.commands);
        batch.done.complete(result);
    }
    debug!(queue = %label, "Command queue worker exiting");
}

fn execute(stream: &str, commands: Vec<Command>) -> Result<(), GpuError> {
    let mut first_error: Option<GpuError> = None;
    let mut scope_error: Option<GpuError> = None;

    for command in commands {
        match command {
            Command::Pass { label, run } => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(run)).unwrap_or_else(|payload| {
                    Err(GpuError::command_failed(
                        label.clone(),
                        format!("pass panicked: {}", panic_message(payload.as_ref())),
                    ))
                });
                if let Err(error) = outcome {
                    warn!(stream, command = %label, error = %error, "GPU command failed");
                    if first_error.is_none() {
                        first_error = Some(error.clone());
                    }
                    if scope_error.is_none() {
                        scope_error = Some(error);
                    }
                }
            }
            Command::Signal { event, value, .. } => event.signal(value),
            Command::Wait { event, value, .. } => event.wait_for(value),
            Command::Checkpoint { run, .. } => run(scope_error.take()),
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
