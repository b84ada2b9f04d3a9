//! Accelerator-side inference over the shared tensor buffers.
//!
//! The [`Reconstructor`] owns one compiled [`InferenceHandle`] obtained from an
//! [`InferenceBackend`]. `load` refuses any handle whose tensor signature does
//! not match the model key, so a ready reconstructor always runs exactly the
//! contract its [`ModelDescriptor`] declares.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use half::f16;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::buffer::{AcceleratorAccess, SharedBuffer};
use crate::error::{ConfigurationError, LoadError, ProcessError};
use crate::model::{ModelDescriptor, ModelKey, TENSOR_ELEMENT_SIZE};

/// Tensor names and shapes, in model-key order `[C, W, D, H, N]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TensorSignature {
    pub inputs: BTreeMap<String, Vec<i64>>,
    pub outputs: BTreeMap<String, Vec<i64>>,
}

impl TensorSignature {
    pub fn from_key(key: &ModelKey) -> Self {
        Self {
            inputs: key
                .inputs
                .iter()
                .map(|(name, spec)| (name.clone(), spec.shape.clone()))
                .collect(),
            outputs: key
                .outputs
                .iter()
                .map(|(name, spec)| (name.clone(), spec.shape.clone()))
                .collect(),
        }
    }

    /// Checks `self` (what the network has) against `key` (what it must have).
    ///
    /// Negative dimensions are symbolic and match any declared size.
    pub fn check_against(&self, key: &ModelKey) -> Result<(), LoadError> {
        let declared = Self::from_key(key);
        let expected_names: Vec<String> = declared
            .inputs
            .keys()
            .chain(declared.outputs.keys())
            .cloned()
            .collect();
        let actual_names: Vec<String> = self
            .inputs
            .keys()
            .chain(self.outputs.keys())
            .cloned()
            .collect();
        if declared.inputs.keys().ne(self.inputs.keys())
            || declared.outputs.keys().ne(self.outputs.keys())
        {
            return Err(LoadError::TensorMismatch {
                expected: expected_names,
                actual: actual_names,
            });
        }

        let pairs = declared
            .inputs
            .iter()
            .zip(self.inputs.values())
            .chain(declared.outputs.iter().zip(self.outputs.values()));
        for ((name, expected), actual) in pairs {
            let matches = expected.len() == actual.len()
                && expected
                    .iter()
                    .zip(actual)
                    .all(|(e, a)| *a < 0 || e == a);
            if !matches {
                return Err(LoadError::ShapeMismatch {
                    name: name.clone(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A compiled network bound to one model key.
pub trait InferenceHandle: Send {
    fn signature(&self) -> &TensorSignature;

    /// Runs the network from `input` into `output`. Blocks until done.
    fn run(
        &mut self,
        input: &AcceleratorAccess<'_>,
        output: &mut AcceleratorAccess<'_>,
    ) -> Result<(), ProcessError>;
}

/// Turns a model artifact into an [`InferenceHandle`].
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `compile` reads the artifact from disk.
    fn requires_artifact(&self) -> bool {
        true
    }

    fn compile(
        &self,
        artifact: &Path,
        model: &ModelDescriptor,
    ) -> Result<Box<dyn InferenceHandle>, LoadError>;
}

pub struct Reconstructor {
    model: ModelDescriptor,
    backend: Arc<dyn InferenceBackend>,
    models_dir: PathBuf,
    handle: Option<Box<dyn InferenceHandle>>,
    input: Option<SharedBuffer>,
    output: Option<SharedBuffer>,
}

impl Reconstructor {
    pub fn new(
        model: ModelDescriptor,
        backend: Arc<dyn InferenceBackend>,
        models_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            model,
            backend,
            models_dir: models_dir.into(),
            handle: None,
            input: None,
            output: None,
        }
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_ready(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.input.is_some() && self.output.is_some()
    }

    /// Compiles the network and verifies its signature against the model key.
    ///
    /// On failure no handle is retained, including one loaded earlier.
    pub fn load(&mut self) -> Result<(), LoadError> {
        self.handle = None;
        let location = self.model.model_location();
        let artifact = if self.backend.requires_artifact() {
            location.verify(&self.models_dir)?
        } else {
            location.resolve(&self.models_dir)
        };

        debug!(
            model = %artifact.display(),
            backend = self.backend.name(),
            key = %self.model.model_key(),
            "Loading inference handle"
        );

        let handle = self.backend.compile(&artifact, &self.model)?;
        if let Err(error) = handle.signature().check_against(self.model.model_key()) {
            warn!(
                model = %artifact.display(),
                error = %error,
                "Compiled network does not match model key"
            );
            return Err(error);
        }

        info!(
            model = %artifact.display(),
            backend = self.backend.name(),
            "Inference handle ready"
        );
        self.handle = Some(handle);
        Ok(())
    }

    /// Binds the buffers inference reads from and writes to.
    pub fn attach(
        &mut self,
        input: SharedBuffer,
        output: SharedBuffer,
    ) -> Result<(), ConfigurationError> {
        let expected_input = self.model.input_layout();
        if *input.layout() != expected_input {
            return Err(ConfigurationError::LayoutMismatch {
                what: "reconstructor input",
                expected: expected_input,
                actual: *input.layout(),
            });
        }
        let expected_output = self.model.output_layout();
        if *output.layout() != expected_output {
            return Err(ConfigurationError::LayoutMismatch {
                what: "reconstructor output",
                expected: expected_output,
                actual: *output.layout(),
            });
        }
        self.input = Some(input);
        self.output = Some(output);
        Ok(())
    }

    /// Runs inference over the attached buffers.
    ///
    /// The caller must have fenced all GPU writes to the input buffer.
    pub fn process(&mut self) -> Result<(), ProcessError> {
        let handle = self.handle.as_mut().ok_or(ProcessError::NotLoaded)?;
        let (input, output) = match (&self.input, &self.output) {
            (Some(input), Some(output)) => (input, output),
            _ => return Err(ProcessError::NotAttached),
        };

        let input_access = input.lock()?;
        let mut output_access = output.lock()?;
        handle.run(&input_access, &mut output_access)
    }
}

/// Shape of a tensor buffer in model-key order.
pub fn key_shape(channels: usize, width: usize, height: usize) -> Vec<i64> {
    vec![channels as i64, width as i64, 1, height as i64, 1]
}

/// Deterministic stand-in network: the per-pixel mean of the RGB channels of
/// every history slot. A fourth output channel, if declared, is 1.
#[derive(Debug, Default, Clone)]
pub struct ReferenceBackend;

impl InferenceBackend for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn requires_artifact(&self) -> bool {
        false
    }

    fn compile(
        &self,
        _artifact: &Path,
        model: &ModelDescriptor,
    ) -> Result<Box<dyn InferenceHandle>, LoadError> {
        Ok(Box::new(ReferenceHandle {
            signature: TensorSignature::from_key(model.model_key()),
        }))
    }
}

struct ReferenceHandle {
    signature: TensorSignature,
}

impl InferenceHandle for ReferenceHandle {
    fn signature(&self) -> &TensorSignature {
        &self.signature
    }

    fn run(
        &mut self,
        input: &AcceleratorAccess<'_>,
        output: &mut AcceleratorAccess<'_>,
    ) -> Result<(), ProcessError> {
        let in_layout = *input.layout();
        let out_layout = *output.layout();
        if in_layout.extent() != out_layout.extent() || in_layout.channels < 3 {
            return Err(ProcessError::ShapeMismatch {
                name: "reference".to_string(),
                expected: key_shape(out_layout.channels, out_layout.width, out_layout.height),
                actual: key_shape(
                    in_layout.channels * in_layout.slots,
                    in_layout.width,
                    in_layout.height,
                ),
            });
        }

        let src = input.as_bytes();
        let slots = in_layout.slots;
        let width = out_layout.width;
        let out_channels = out_layout.channels;
        output
            .as_bytes_mut()
            .par_chunks_mut(out_layout.row_stride)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width {
                    for c in 0..out_channels {
                        let value = if c < 3 {
                            let sum: f32 = (0..slots)
                                .map(|slot| {
                                    let offset = in_layout.offset(slot, x, y, c);
                                    f16::from_le_bytes([src[offset], src[offset + 1]]).to_f32()
                                })
                                .sum();
                            sum / slots as f32
                        } else {
                            1.0
                        };
                        let offset = x * out_layout.pixel_stride + c * TENSOR_ELEMENT_SIZE;
                        row[offset..offset + TENSOR_ELEMENT_SIZE]
                            .copy_from_slice(&f16::from_f32(value).to_le_bytes());
                    }
                }
                row[width * out_layout.pixel_stride..].fill(0);
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Device;
    use crate::model::{ModelLocation, ModelParameters};

    fn model(location: ModelLocation) -> ModelDescriptor {
        ModelDescriptor::new(ModelParameters {
            input_width: 2,
            input_height: 1,
            input_channel_count: 4,
            input_frame_count: 2,
            scale_factor: 1,
            model_key: r#"{"inputs":{"in":{"shape":[8,2,1,1,1]}},"outputs":{"out":{"shape":[3,2,1,1,1]}}}"#
                .to_string(),
            model_location: location,
        })
        .expect("descriptor")
    }

    struct FixedBackend(TensorSignature);

    impl InferenceBackend for FixedBackend {
        fn name(&self) -> &str {
            "fixed"
        }

        fn requires_artifact(&self) -> bool {
            false
        }

        fn compile(
            &self,
            _artifact: &Path,
            _model: &ModelDescriptor,
        ) -> Result<Box<dyn InferenceHandle>, LoadError> {
            Ok(Box::new(ReferenceHandle {
                signature: self.0.clone(),
            }))
        }
    }

    #[test]
    fn process_before_load_is_not_loaded() {
        let mut reconstructor = Reconstructor::new(
            model(ModelLocation::bundled("m")),
            Arc::new(ReferenceBackend),
            "models",
        );
        assert_eq!(reconstructor.process(), Err(ProcessError::NotLoaded));
    }

    #[test]
    fn process_without_buffers_is_not_attached() {
        let mut reconstructor = Reconstructor::new(
            model(ModelLocation::bundled("m")),
            Arc::new(ReferenceBackend),
            "models",
        );
        reconstructor.load().expect("reference load");
        assert_eq!(reconstructor.process(), Err(ProcessError::NotAttached));
    }

    #[test]
    fn attach_rejects_foreign_layouts() {
        let descriptor = model(ModelLocation::bundled("m"));
        let device = Device::cpu_reference();
        let mut reconstructor =
            Reconstructor::new(descriptor.clone(), Arc::new(ReferenceBackend), "models");
        let error = reconstructor
            .attach(
                device.create_shared_buffer("out", descriptor.output_layout()),
                device.create_shared_buffer("out", descriptor.output_layout()),
            )
            .expect_err("input layout wrong");
        assert!(matches!(
            error,
            ConfigurationError::LayoutMismatch {
                what: "reconstructor input",
                ..
            }
        ));
    }

    #[test]
    fn reference_network_averages_history() {
        let descriptor = model(ModelLocation::bundled("m"));
        let device = Device::cpu_reference();
        let input = device.create_shared_buffer("in", descriptor.input_layout());
        let output = device.create_shared_buffer("out", descriptor.output_layout());
        {
            let mut guard = input.lock().expect("lock input");
            guard.set_element(0, 1, 0, 0, 0.25);
            guard.set_element(1, 1, 0, 0, 0.75);
            guard.set_element(1, 0, 0, 2, 1.0);
        }

        let mut reconstructor =
            Reconstructor::new(descriptor, Arc::new(ReferenceBackend), "models");
        reconstructor.load().expect("load");
        reconstructor
            .attach(input.clone(), output.clone())
            .expect("attach");
        reconstructor.process().expect("process");

        let guard = output.lock().expect("lock output");
        assert_eq!(guard.element(0, 1, 0, 0), 0.5);
        assert_eq!(guard.element(0, 0, 0, 2), 0.5);
        assert_eq!(guard.element(0, 0, 0, 1), 0.0);
    }

    #[test]
    fn shape_mismatch_fails_load_and_keeps_no_handle() {
        let descriptor = model(ModelLocation::bundled("m"));
        let mut signature = TensorSignature::from_key(descriptor.model_key());
        signature
            .inputs
            .insert("in".to_string(), vec![10, 2, 1, 1, 1]);

        let mut reconstructor =
            Reconstructor::new(descriptor, Arc::new(FixedBackend(signature)), "models");
        let error = reconstructor.load().expect_err("shape mismatch");
        assert!(matches!(error, LoadError::ShapeMismatch { ref name, .. } if name == "in"));
        assert!(!reconstructor.is_ready());
        assert_eq!(reconstructor.process(), Err(ProcessError::NotLoaded));
    }

    #[test]
    fn tensor_name_mismatch_fails_load() {
        let descriptor = model(ModelLocation::bundled("m"));
        let mut signature = TensorSignature::from_key(descriptor.model_key());
        let shape = signature.outputs.remove("out").expect("declared output");
        signature.outputs.insert("Identity".to_string(), shape);

        let mut reconstructor =
            Reconstructor::new(descriptor, Arc::new(FixedBackend(signature)), "models");
        assert!(matches!(
            reconstructor.load(),
            Err(LoadError::TensorMismatch { .. })
        ));
    }

    #[test]
    fn symbolic_dimensions_match_any_size() {
        let descriptor = model(ModelLocation::bundled("m"));
        let mut signature = TensorSignature::from_key(descriptor.model_key());
        signature
            .inputs
            .insert("in".to_string(), vec![8, -1, 1, -1, -1]);
        assert!(signature.check_against(descriptor.model_key()).is_ok());
    }

    #[test]
    fn missing_artifact_fails_load_for_file_backends() {
        struct FileBackend;
        impl InferenceBackend for FileBackend {
            fn name(&self) -> &str {
                "file"
            }
            fn compile(
                &self,
                _artifact: &Path,
                _model: &ModelDescriptor,
            ) -> Result<Box<dyn InferenceHandle>, LoadError> {
                Err(LoadError::AcceleratorUnavailable("unreachable".into()))
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let mut reconstructor = Reconstructor::new(
            model(ModelLocation::bundled("missing")),
            Arc::new(FileBackend),
            dir.path(),
        );
        assert!(matches!(
            reconstructor.load(),
            Err(LoadError::ArtifactMissing { .. })
        ));
    }
}
