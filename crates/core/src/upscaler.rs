//! Per-frame orchestration of preprocess, inference and decode.
//!
//! The GPU side of a frame is recorded into the caller's [`CommandStream`];
//! inference runs on a dedicated accelerator thread owned by the
//! [`Upscaler`]. The two domains are ordered with two [`SharedEvent`]s whose
//! values are frame numbers:
//!
//! ```text
//! GPU:  begin | upsample warp pack | checkpoint | signal(gpu, n) | dispatch | wait(accel, n) | decode | complete
//! ACC:                                                   wait(gpu, n) -> process -> signal(accel, n)
//! ```
//!
//! A frame that fails anywhere is aborted: the decode pass is skipped so the
//! output texture keeps its previous contents, and the failure is reported
//! through the frame's [`FrameTicket`].
//!
//! Both events only move forward, so streams must reach the GPU in the order
//! they were recorded. A frame whose stream runs after a newer one is aborted
//! with [`PipelineError::OutOfOrder`] before it is dispatched.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tracing::{debug, trace, warn};

use crate::buffer::SharedBuffer;
use crate::decoder::Decoder;
use crate::error::{ConfigurationError, LoadError, PipelineError, ProcessError};
use crate::gpu::{Completion, CommandQueue, CommandStream, Device, SharedEvent, Texture};
use crate::history::FrameHistory;
use crate::model::ModelDescriptor;
use crate::preprocess::Preprocessor;
use crate::reconstructor::Reconstructor;

const BEGIN_CHECKPOINT: &str = "nss.begin";
const PREPROCESS_CHECKPOINT: &str = "nss.preprocess.done";
const DISPATCH_CHECKPOINT: &str = "nss.dispatch";
const COMPLETE_CHECKPOINT: &str = "nss.complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpscalerStage {
    Idle = 0,
    Preprocessing = 1,
    Inferring = 2,
    Decoding = 3,
}

impl UpscalerStage {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Preprocessing,
            2 => Self::Inferring,
            3 => Self::Decoding,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for UpscalerStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Preprocessing => "preprocessing",
            Self::Inferring => "inferring",
            Self::Decoding => "decoding",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct StageCell(AtomicU8);

impl StageCell {
    fn get(&self) -> UpscalerStage {
        UpscalerStage::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, stage: UpscalerStage) {
        self.0.store(stage as u8, Ordering::Release);
    }
}

/// Shared state of one in-flight frame.
struct FrameState {
    number: u64,
    slot: usize,
    aborted: Arc<AtomicBool>,
    error: Mutex<Option<PipelineError>>,
    stage: StageCell,
    pipeline_stage: Arc<StageCell>,
    done: Arc<Completion<Result<(), PipelineError>>>,
}

impl FrameState {
    fn set_stage(&self, stage: UpscalerStage) {
        trace!(frame = self.number, %stage, "Frame stage transition");
        self.stage.set(stage);
        self.pipeline_stage.set(stage);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Aborts the frame and keeps the first recorded failure.
    fn fail(&self, error: PipelineError) {
        self.aborted.store(true, Ordering::Release);
        let mut slot = self
            .error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn take_error(&self) -> Option<PipelineError> {
        self.error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Handle to the asynchronous result of one frame.
pub struct FrameTicket {
    state: Arc<FrameState>,
}

impl FrameTicket {
    /// 1-based number of the frame.
    pub fn frame(&self) -> u64 {
        self.state.number
    }

    /// History slot the frame was written into.
    pub fn slot(&self) -> usize {
        self.state.slot
    }

    pub fn stage(&self) -> UpscalerStage {
        self.state.stage.get()
    }

    pub fn is_complete(&self) -> bool {
        self.state.done.is_complete()
    }

    /// Blocks until the frame finished or was aborted.
    pub fn wait(self) -> Result<(), PipelineError> {
        self.state.done.wait()
    }
}

impl fmt::Debug for FrameTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTicket")
            .field("frame", &self.state.number)
            .field("slot", &self.state.slot)
            .field("stage", &self.stage())
            .finish()
    }
}

/// Owns the three pipeline components and both tensor buffers.
pub struct Upscaler {
    model: ModelDescriptor,
    preprocessor: Box<dyn Preprocessor>,
    reconstructor: Arc<Mutex<Reconstructor>>,
    decoder: Box<dyn Decoder>,
    input_buffer: SharedBuffer,
    output_buffer: SharedBuffer,
    history: FrameHistory,
    gpu_event: SharedEvent,
    accel_event: SharedEvent,
    stage: Arc<StageCell>,
    sync_mode: bool,
    jobs: Sender<Arc<FrameState>>,
}

impl Upscaler {
    /// Allocates the tensor buffers, binds them to the components and starts
    /// the accelerator worker. The reconstructor does not need to be loaded.
    pub fn new(
        device: &Device,
        model: ModelDescriptor,
        preprocessor: Box<dyn Preprocessor>,
        mut reconstructor: Reconstructor,
        mut decoder: Box<dyn Decoder>,
    ) -> Result<Self, ConfigurationError> {
        let input_layout = model.input_layout();
        if preprocessor.descriptor().layout != input_layout {
            return Err(ConfigurationError::LayoutMismatch {
                what: "preprocessor output",
                expected: input_layout,
                actual: preprocessor.descriptor().layout,
            });
        }
        if reconstructor.model() != &model {
            return Err(ConfigurationError::InvalidDescriptor(format!(
                "reconstructor was built for {} instead of {}",
                reconstructor.model().model_key(),
                model.model_key()
            )));
        }

        let history = FrameHistory::new(model.input_frame_count())?;
        let input_buffer = device.create_shared_buffer("nss.input", input_layout);
        let output_buffer = device.create_shared_buffer("nss.output", model.output_layout());
        reconstructor.attach(input_buffer.clone(), output_buffer.clone())?;
        decoder.attach_input(output_buffer.clone())?;

        let gpu_event = device.create_event("nss.gpu");
        let accel_event = device.create_event("nss.accelerator");
        let reconstructor = Arc::new(Mutex::new(reconstructor));
        let (jobs, receiver) = channel::<Arc<FrameState>>();

        {
            let reconstructor = Arc::clone(&reconstructor);
            let gpu_event = gpu_event.clone();
            let accel_event = accel_event.clone();
            thread::spawn(move || {
                for frame in receiver {
                    gpu_event.wait_for(frame.number);
                    if !frame.is_aborted() {
                        let result = lock(&reconstructor).process();
                        match result {
                            Ok(()) => frame.set_stage(UpscalerStage::Decoding),
                            Err(error) => {
                                warn!(frame = frame.number, error = %error, "Inference failed");
                                frame.fail(error.into());
                            }
                        }
                    }
                    accel_event.signal(frame.number);
                }
                debug!("Accelerator worker exiting");
            });
        }

        debug!(
            input = %input_layout,
            output = %model.output_layout(),
            frames = model.input_frame_count(),
            "Upscaler ready"
        );

        Ok(Self {
            history,
            model,
            preprocessor,
            reconstructor,
            decoder,
            input_buffer,
            output_buffer,
            gpu_event,
            accel_event,
            stage: Arc::new(StageCell::default()),
            sync_mode: false,
            jobs,
        })
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    /// Compiles the network. Must succeed before the first frame.
    pub fn load(&mut self) -> Result<(), LoadError> {
        lock(&self.reconstructor).load()
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.reconstructor).is_ready()
    }

    pub fn sync_mode(&self) -> bool {
        self.sync_mode
    }

    pub fn set_sync_mode(&mut self, sync_mode: bool) {
        self.sync_mode = sync_mode;
    }

    /// Stage of the most recently advanced frame.
    pub fn stage(&self) -> UpscalerStage {
        self.stage.get()
    }

    pub fn history(&self) -> &FrameHistory {
        &self.history
    }

    pub fn input_buffer(&self) -> &SharedBuffer {
        &self.input_buffer
    }

    pub fn output_buffer(&self) -> &SharedBuffer {
        &self.output_buffer
    }

    /// Records one frame into `stream` and hands inference to the
    /// accelerator worker once the GPU reaches it.
    ///
    /// Nothing runs until the caller commits `stream`, and streams of one
    /// upscaler must be committed to one queue in recording order. Errors
    /// returned here are synchronous rejections; the frame never entered the
    /// ring.
    pub fn process(
        &mut self,
        color: &Texture,
        depth: &Texture,
        motion: Option<&Texture>,
        output: &Texture,
        stream: &mut CommandStream,
    ) -> Result<FrameTicket, PipelineError> {
        if !self.is_ready() {
            return Err(ProcessError::NotLoaded.into());
        }
        self.preprocessor.validate_input(color, depth, motion)?;
        self.decoder.validate_target(output)?;

        let (slot, number) = self.history.advance();
        let frame = Arc::new(FrameState {
            number,
            slot,
            aborted: Arc::new(AtomicBool::new(false)),
            error: Mutex::new(None),
            stage: StageCell::default(),
            pipeline_stage: Arc::clone(&self.stage),
            done: Completion::new(),
        });
        frame.set_stage(UpscalerStage::Preprocessing);
        debug!(frame = number, slot, motion = motion.is_some(), "Encoding frame");

        stream.encode_checkpoint(BEGIN_CHECKPOINT, |_| {});
        self.preprocessor
            .preprocess(color, depth, motion, &self.input_buffer, slot, stream);
        {
            let frame = Arc::clone(&frame);
            stream.encode_checkpoint(PREPROCESS_CHECKPOINT, move |error| match error {
                Some(error) => frame.fail(error.into()),
                None => frame.set_stage(UpscalerStage::Inferring),
            });
        }

        stream.encode_signal(&self.gpu_event, number);
        {
            let frame = Arc::clone(&frame);
            let jobs = self.jobs.clone();
            let gpu_event = self.gpu_event.clone();
            let accel_event = self.accel_event.clone();
            stream.encode_checkpoint(DISPATCH_CHECKPOINT, move |_| {
                let reached = gpu_event.signaled_value();
                if reached > number {
                    frame.fail(PipelineError::OutOfOrder {
                        frame: number,
                        newer: reached,
                    });
                }
                if frame.is_aborted() {
                    accel_event.signal(number);
                } else if let Err(rejected) = jobs.send(Arc::clone(&frame)) {
                    rejected.0.fail(ProcessError::WorkerStopped.into());
                    accel_event.signal(number);
                }
            });
        }
        stream.encode_wait(&self.accel_event, number);

        let aborted = Arc::clone(&frame.aborted);
        let decode = stream.encode_unless(&aborted, |section| {
            self.decoder.decode_into_texture(output, section)
        });
        if let Err(error) = decode {
            frame.fail(error.into());
        }

        {
            let frame = Arc::clone(&frame);
            stream.encode_checkpoint(COMPLETE_CHECKPOINT, move |error| {
                if let Some(error) = error {
                    frame.fail(error.into());
                }
                frame.set_stage(UpscalerStage::Idle);
                let result = match frame.take_error() {
                    Some(error) => {
                        warn!(frame = frame.number, error = %error, "Frame failed");
                        Err(error)
                    }
                    None => {
                        debug!(frame = frame.number, "Frame complete");
                        Ok(())
                    }
                };
                frame.done.complete(result);
            });
        }
        {
            let frame = Arc::clone(&frame);
            stream.on_discard(move || {
                frame.aborted.store(true, Ordering::Release);
                frame.set_stage(UpscalerStage::Idle);
                frame.done.complete(Err(PipelineError::FrameDiscarded {
                    frame: frame.number,
                }));
            });
        }

        Ok(FrameTicket { state: frame })
    }

    /// Records a frame into a fresh stream on `queue` and commits it.
    ///
    /// In sync mode this waits for the frame and returns its result; otherwise
    /// it returns as soon as the work is queued and failures are only logged.
    pub fn process_with_queue(
        &mut self,
        color: &Texture,
        depth: &Texture,
        motion: Option<&Texture>,
        output: &Texture,
        queue: &CommandQueue,
    ) -> Result<(), PipelineError> {
        let mut stream = queue.create_stream(format!("nss.frame.{}", self.history.frames_written() + 1));
        let ticket = self.process(color, depth, motion, output, &mut stream)?;
        let submission = stream.commit();
        if !self.sync_mode {
            return Ok(());
        }

        let frame = ticket.wait();
        let gpu = submission.wait();
        frame?;
        gpu?;
        Ok(())
    }
}

impl Drop for Upscaler {
    fn drop(&mut self) {
        debug!(
            frames = self.history.frames_written(),
            "Shutting down upscaler"
        );
    }
}

fn lock(reconstructor: &Mutex<Reconstructor>) -> MutexGuard<'_, Reconstructor> {
    reconstructor
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
