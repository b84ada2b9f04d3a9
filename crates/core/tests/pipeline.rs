use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nss_core::buffer::{AcceleratorAccess, SharedBuffer};
use nss_core::decoder::{AcceleratorOutputDecoder, DecodeColorspace, Decoder};
use nss_core::error::{ConfigurationError, LoadError, PipelineError, ProcessError};
use nss_core::gpu::kernels::unpack_slot;
use nss_core::gpu::{
    CommandStream, Device, Extent, Texture, TextureDescriptor, TextureFormat, UpsampleFilter,
};
use nss_core::model::{ModelLocation, ModelParameters};
use nss_core::preprocess::{InputFormats, MultiFrameRgbdMotionPreprocessor, WARP_PASS};
use nss_core::reconstructor::{
    key_shape, InferenceBackend, InferenceHandle, Reconstructor, ReferenceBackend,
    TensorSignature,
};
use nss_core::{ModelDescriptor, Upscaler};

const INPUT: Extent = Extent::new(2, 2);
const OUTPUT: Extent = Extent::new(4, 4);

fn rgbd_model(frames: usize) -> ModelDescriptor {
    ModelDescriptor::new(ModelParameters {
        input_width: INPUT.width,
        input_height: INPUT.height,
        input_channel_count: 4,
        input_frame_count: frames,
        scale_factor: 2,
        model_key: format!(
            r#"{{"inputs":{{"in":{{"shape":[{},4,1,4,1]}}}},"outputs":{{"out":{{"shape":[3,4,1,4,1]}}}}}}"#,
            4 * frames
        ),
        model_location: ModelLocation::bundled("tiny"),
    })
    .expect("tiny descriptor")
}

fn assemble(device: &Device, model: ModelDescriptor, backend: Arc<dyn InferenceBackend>) -> Upscaler {
    let decoder = AcceleratorOutputDecoder::new(&model, DecodeColorspace::Identity);
    assemble_with(device, model, backend, Box::new(decoder))
}

fn assemble_with(
    device: &Device,
    model: ModelDescriptor,
    backend: Arc<dyn InferenceBackend>,
    decoder: Box<dyn Decoder>,
) -> Upscaler {
    let preprocessor = MultiFrameRgbdMotionPreprocessor::new(
        device,
        &model,
        InputFormats::default(),
        UpsampleFilter::Bilinear,
    )
    .expect("preprocessor");
    let reconstructor = Reconstructor::new(model.clone(), backend, std::env::temp_dir());
    let mut upscaler = Upscaler::new(device, model, Box::new(preprocessor), reconstructor, decoder)
        .expect("upscaler");
    upscaler.set_sync_mode(true);
    upscaler
}

fn filled(device: &Device, extent: Extent, format: TextureFormat, texel: &[f32]) -> Texture {
    let texture = device.create_texture(&TextureDescriptor::new("fixture", extent, format));
    let data: Vec<f32> = texel
        .iter()
        .copied()
        .cycle()
        .take(texture.len())
        .collect();
    texture.write_texels(&data).expect("fill texture");
    texture
}

struct Frame {
    color: Texture,
    depth: Texture,
}

fn frame(device: &Device, red: f32) -> Frame {
    Frame {
        color: filled(device, INPUT, TextureFormat::Rgba16Float, &[red, red, red, 1.0]),
        depth: filled(device, INPUT, TextureFormat::R16Float, &[0.5]),
    }
}

fn output_texture(device: &Device) -> Texture {
    filled(device, OUTPUT, TextureFormat::Rgba32Float, &[0.0])
}

fn assert_rgb(texture: &Texture, expected: f32, tolerance: f32) {
    for texel in texture.read_texels().chunks_exact(4) {
        for &value in &texel[..3] {
            assert!(
                (value - expected).abs() <= tolerance,
                "expected {expected}, got {value}"
            );
        }
        assert_eq!(texel[3], 1.0);
    }
}

/// Writes constant channel values into every output pixel, or fails while
/// `fail` is set.
struct ConstantBackend {
    values: [f32; 3],
    fail: Arc<AtomicBool>,
    output_channels: usize,
}

impl ConstantBackend {
    fn new(value: f32) -> Self {
        Self::per_channel([value; 3])
    }

    fn per_channel(values: [f32; 3]) -> Self {
        Self {
            values,
            fail: Arc::new(AtomicBool::new(false)),
            output_channels: 3,
        }
    }
}

struct ConstantHandle {
    values: [f32; 3],
    fail: Arc<AtomicBool>,
    signature: TensorSignature,
}

impl InferenceBackend for ConstantBackend {
    fn name(&self) -> &str {
        "constant"
    }

    fn requires_artifact(&self) -> bool {
        false
    }

    fn compile(
        &self,
        _artifact: &Path,
        model: &ModelDescriptor,
    ) -> Result<Box<dyn InferenceHandle>, LoadError> {
        let mut signature = TensorSignature::from_key(model.model_key());
        for shape in signature.outputs.values_mut() {
            *shape = key_shape(
                self.output_channels,
                model.output_width() as usize,
                model.output_height() as usize,
            );
        }
        Ok(Box::new(ConstantHandle {
            values: self.values,
            fail: Arc::clone(&self.fail),
            signature,
        }))
    }
}

impl InferenceHandle for ConstantHandle {
    fn signature(&self) -> &TensorSignature {
        &self.signature
    }

    fn run(
        &mut self,
        _input: &AcceleratorAccess<'_>,
        output: &mut AcceleratorAccess<'_>,
    ) -> Result<(), ProcessError> {
        if self.fail.load(Ordering::Acquire) {
            return Err(ProcessError::AcceleratorFault("injected fault".to_string()));
        }
        let layout = *output.layout();
        for y in 0..layout.height {
            for x in 0..layout.width {
                for c in 0..layout.channels {
                    output.set_element(0, x, y, c, self.values[c % 3]);
                }
            }
        }
        Ok(())
    }
}

#[test]
fn cold_start_output_is_mean_over_history_slots() {
    let device = Device::cpu_reference();
    let mut upscaler = assemble(&device, rgbd_model(3), Arc::new(ReferenceBackend));
    upscaler.load().expect("load");
    let queue = device.create_command_queue("test");
    let output = output_texture(&device);

    let first = frame(&device, 0.25);
    upscaler
        .process_with_queue(&first.color, &first.depth, None, &output, &queue)
        .expect("first frame");
    assert_rgb(&output, 0.25 / 3.0, 1e-3);

    for red in [0.5, 0.75] {
        let next = frame(&device, red);
        upscaler
            .process_with_queue(&next.color, &next.depth, None, &output, &queue)
            .expect("next frame");
    }
    assert_rgb(&output, 0.5, 1e-3);
    assert!(upscaler.history().is_warm());
}

#[test]
fn warp_pass_is_recorded_only_with_motion() {
    let device = Device::cpu_reference();
    let mut upscaler = assemble(&device, rgbd_model(2), Arc::new(ReferenceBackend));
    upscaler.load().expect("load");
    let queue = device.create_command_queue("test");
    let output = output_texture(&device);
    let still = frame(&device, 0.5);
    let motion = filled(&device, INPUT, TextureFormat::Rg16Float, &[0.0, 0.0]);

    let mut stream = queue.create_stream("no-motion");
    let ticket = upscaler
        .process(&still.color, &still.depth, None, &output, &mut stream)
        .expect("accepted");
    assert!(!stream.labels().contains(&WARP_PASS));
    stream.commit().wait().expect("gpu work");
    ticket.wait().expect("frame");

    let mut stream = queue.create_stream("motion");
    let ticket = upscaler
        .process(&still.color, &still.depth, Some(&motion), &output, &mut stream)
        .expect("accepted");
    assert!(stream.labels().contains(&WARP_PASS));
    stream.commit().wait().expect("gpu work");
    ticket.wait().expect("frame");
}

#[test]
fn history_ring_overwrites_oldest_slot() {
    let device = Device::cpu_reference();
    let mut upscaler = assemble(&device, rgbd_model(3), Arc::new(ReferenceBackend));
    upscaler.load().expect("load");
    let queue = device.create_command_queue("test");
    let output = output_texture(&device);

    for red in [0.125, 0.25, 0.375, 0.5] {
        let next = frame(&device, red);
        upscaler
            .process_with_queue(&next.color, &next.depth, None, &output, &queue)
            .expect("frame");
    }

    assert_eq!(upscaler.history().frames_written(), 4);
    assert_eq!(upscaler.history().slots_by_age(), vec![0, 2, 1]);

    let layout = *upscaler.input_buffer().layout();
    let bytes = upscaler.input_buffer().snapshot().expect("snapshot");
    let red_of = |slot| unpack_slot(&bytes, &layout, slot)[0];
    assert_eq!(red_of(0), 0.5);
    assert_eq!(red_of(1), 0.25);
    assert_eq!(red_of(2), 0.375);
    assert_rgb(&output, (0.5 + 0.25 + 0.375) / 3.0, 1e-3);
}

#[test]
fn repeated_frame_packs_identical_bytes() {
    let device = Device::cpu_reference();
    let mut upscaler = assemble(&device, rgbd_model(1), Arc::new(ReferenceBackend));
    upscaler.load().expect("load");
    let queue = device.create_command_queue("test");
    let output = output_texture(&device);
    let same = frame(&device, 0.3);

    upscaler
        .process_with_queue(&same.color, &same.depth, None, &output, &queue)
        .expect("first");
    let first = upscaler.input_buffer().snapshot().expect("snapshot");
    upscaler
        .process_with_queue(&same.color, &same.depth, None, &output, &queue)
        .expect("second");
    let second = upscaler.input_buffer().snapshot().expect("snapshot");

    assert_eq!(first, second);
}

#[test]
fn shape_mismatch_leaves_pipeline_unloaded() {
    let device = Device::cpu_reference();
    let mut backend = ConstantBackend::new(0.5);
    backend.output_channels = 5;
    let mut upscaler = assemble(&device, rgbd_model(2), Arc::new(backend));

    let error = upscaler.load().expect_err("five output channels");
    assert!(matches!(error, LoadError::ShapeMismatch { .. }));
    assert!(!upscaler.is_ready());

    let queue = device.create_command_queue("test");
    let output = output_texture(&device);
    let next = frame(&device, 0.5);
    let error = upscaler
        .process_with_queue(&next.color, &next.depth, None, &output, &queue)
        .expect_err("not loaded");
    assert!(error.is_not_loaded());
    assert_eq!(upscaler.history().frames_written(), 0);
}

#[test]
fn inference_fault_keeps_output_and_next_frame_recovers() {
    let device = Device::cpu_reference();
    let backend = ConstantBackend::new(0.75);
    let fail = Arc::clone(&backend.fail);
    let mut upscaler = assemble(&device, rgbd_model(2), Arc::new(backend));
    upscaler.load().expect("load");
    let queue = device.create_command_queue("test");
    let next = frame(&device, 0.5);

    let output = filled(&device, OUTPUT, TextureFormat::Rgba32Float, &[0.125, 0.125, 0.125, 1.0]);
    fail.store(true, Ordering::Release);
    let mut stream = queue.create_stream("faulty");
    let ticket = upscaler
        .process(&next.color, &next.depth, None, &output, &mut stream)
        .expect("accepted");
    stream.commit().wait().expect("gpu passes themselves succeed");
    let error = ticket.wait().expect_err("inference fault");
    assert_eq!(
        error.as_process(),
        Some(&ProcessError::AcceleratorFault("injected fault".to_string()))
    );
    assert_rgb(&output, 0.125, 0.0);

    fail.store(false, Ordering::Release);
    upscaler
        .process_with_queue(&next.color, &next.depth, None, &output, &queue)
        .expect("recovered frame");
    assert_rgb(&output, 0.75, 1e-3);
    assert_eq!(upscaler.history().frames_written(), 2);
    assert_eq!(upscaler.history().next_slot(), 0);
}

#[test]
fn fault_in_sync_mode_is_returned_to_caller() {
    let device = Device::cpu_reference();
    let backend = ConstantBackend::new(0.75);
    backend.fail.store(true, Ordering::Release);
    let mut upscaler = assemble(&device, rgbd_model(2), Arc::new(backend));
    upscaler.load().expect("load");
    let queue = device.create_command_queue("test");
    let output = output_texture(&device);
    let next = frame(&device, 0.5);

    let error = upscaler
        .process_with_queue(&next.color, &next.depth, None, &output, &queue)
        .expect_err("fault surfaces");
    assert!(matches!(
        error,
        PipelineError::Process(ProcessError::AcceleratorFault(_))
    ));
}

#[test]
fn zero_network_output_decodes_to_opaque_black() {
    let device = Device::cpu_reference();
    let mut upscaler = assemble(&device, rgbd_model(2), Arc::new(ConstantBackend::new(0.0)));
    upscaler.load().expect("load");
    let queue = device.create_command_queue("test");
    let output = filled(&device, OUTPUT, TextureFormat::Rgba32Float, &[0.9]);
    let next = frame(&device, 0.5);

    upscaler
        .process_with_queue(&next.color, &next.depth, None, &output, &queue)
        .expect("frame");
    assert_rgb(&output, 0.0, 0.0);
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    /// Frame number and the red value found in its history slot.
    Inferred(u64, f32),
    Decoded(u64),
}

type Timeline = Arc<Mutex<Vec<Step>>>;

/// Reference averaging that sleeps first, so the GPU side would race ahead
/// if nothing held it back.
struct SlowReference {
    timeline: Timeline,
    frames: usize,
}

struct SlowReferenceHandle {
    inner: Box<dyn InferenceHandle>,
    timeline: Timeline,
    frames: usize,
    runs: u64,
}

impl InferenceBackend for SlowReference {
    fn name(&self) -> &str {
        "slow-reference"
    }

    fn requires_artifact(&self) -> bool {
        false
    }

    fn compile(
        &self,
        artifact: &Path,
        model: &ModelDescriptor,
    ) -> Result<Box<dyn InferenceHandle>, LoadError> {
        Ok(Box::new(SlowReferenceHandle {
            inner: ReferenceBackend.compile(artifact, model)?,
            timeline: Arc::clone(&self.timeline),
            frames: self.frames,
            runs: 0,
        }))
    }
}

impl InferenceHandle for SlowReferenceHandle {
    fn signature(&self) -> &TensorSignature {
        self.inner.signature()
    }

    fn run(
        &mut self,
        input: &AcceleratorAccess<'_>,
        output: &mut AcceleratorAccess<'_>,
    ) -> Result<(), ProcessError> {
        thread::sleep(Duration::from_millis(20));
        self.runs += 1;
        let slot = ((self.runs - 1) % self.frames as u64) as usize;
        let layout = *input.layout();
        let first = input.element(slot, 0, 0, 0);
        let packed = (0..layout.height)
            .flat_map(|y| (0..layout.width).map(move |x| (x, y)))
            .all(|(x, y)| input.element(slot, x, y, 0) == first);
        // NaN never compares equal, so a partially packed slot fails the test
        // without panicking the accelerator thread.
        let red = if packed { first } else { f32::NAN };
        self.timeline
            .lock()
            .expect("timeline")
            .push(Step::Inferred(self.runs, red));
        self.inner.run(input, output)
    }
}

/// Identity decoding followed by a pass that records when it ran.
struct RecordingDecoder {
    inner: AcceleratorOutputDecoder,
    timeline: Timeline,
    decoded: Arc<AtomicU64>,
}

impl Decoder for RecordingDecoder {
    fn attach_input(&mut self, buffer: SharedBuffer) -> Result<(), ConfigurationError> {
        self.inner.attach_input(buffer)
    }

    fn validate_target(&self, texture: &Texture) -> Result<(), ConfigurationError> {
        self.inner.validate_target(texture)
    }

    fn decode_into_texture(
        &self,
        texture: &Texture,
        stream: &mut CommandStream,
    ) -> Result<(), ConfigurationError> {
        self.inner.decode_into_texture(texture, stream)?;
        let timeline = Arc::clone(&self.timeline);
        let decoded = Arc::clone(&self.decoded);
        stream.encode_pass("test.decode.recorded", move || {
            let frame = decoded.fetch_add(1, Ordering::AcqRel) + 1;
            timeline.lock().expect("timeline").push(Step::Decoded(frame));
            Ok(())
        });
        Ok(())
    }
}

#[test]
fn queued_frames_infer_and_decode_in_order_without_waiting() {
    let device = Device::cpu_reference();
    let model = rgbd_model(3);
    let timeline: Timeline = Arc::default();
    let backend = SlowReference {
        timeline: Arc::clone(&timeline),
        frames: model.input_frame_count(),
    };
    let decoder = RecordingDecoder {
        inner: AcceleratorOutputDecoder::new(&model, DecodeColorspace::Identity),
        timeline: Arc::clone(&timeline),
        decoded: Arc::default(),
    };
    let mut upscaler = assemble_with(&device, model, Arc::new(backend), Box::new(decoder));
    upscaler.set_sync_mode(false);
    upscaler.load().expect("load");
    let queue = device.create_command_queue("test");

    let reds = [0.25, 0.5, 0.75, 1.0];
    let frames: Vec<Frame> = reds.iter().map(|&red| frame(&device, red)).collect();
    let outputs: Vec<Texture> = reds.iter().map(|_| output_texture(&device)).collect();
    for (next, output) in frames.iter().zip(&outputs) {
        upscaler
            .process_with_queue(&next.color, &next.depth, None, output, &queue)
            .expect("queued");
    }
    assert_eq!(upscaler.history().frames_written(), 4);

    queue
        .create_stream("drain")
        .commit()
        .wait()
        .expect("queue drained");

    let steps = timeline.lock().expect("timeline").clone();
    let expected: Vec<Step> = reds
        .iter()
        .zip(1u64..)
        .flat_map(|(&red, n)| [Step::Inferred(n, red), Step::Decoded(n)])
        .collect();
    assert_eq!(steps, expected);

    for (output, mean) in outputs.iter().zip([0.25 / 3.0, 0.25, 0.5, 0.75]) {
        assert_rgb(output, mean, 1e-3);
    }
}

#[test]
fn yuv_network_output_is_converted_to_rgb() {
    let device = Device::cpu_reference();
    let model = rgbd_model(2);
    let yuv = [0.5, 0.5, 0.75];
    let decoder = AcceleratorOutputDecoder::new(&model, DecodeColorspace::YuvToRgb);
    let mut upscaler = assemble_with(
        &device,
        model,
        Arc::new(ConstantBackend::per_channel(yuv)),
        Box::new(decoder),
    );
    upscaler.load().expect("load");
    let queue = device.create_command_queue("test");
    let output = output_texture(&device);
    let next = frame(&device, 0.5);

    upscaler
        .process_with_queue(&next.color, &next.depth, None, &output, &queue)
        .expect("frame");

    let expected = DecodeColorspace::YuvToRgb.to_rgb(yuv[0], yuv[1], yuv[2]);
    assert!((expected[0] - 0.8937).abs() < 1e-3, "red was {}", expected[0]);
    assert!((expected[1] - 0.3830).abs() < 1e-3, "green was {}", expected[1]);
    assert_eq!(expected[2], 0.5);
    for texel in output.read_texels().chunks_exact(4) {
        for (value, want) in texel[..3].iter().zip(expected) {
            assert!((value - want).abs() < 1e-3, "expected {want}, got {value}");
        }
        assert_eq!(texel[3], 1.0);
    }
}
