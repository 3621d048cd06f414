// Copyright (C) 2026 The gst-plugin-dnnresidual authors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Inference backends.
//!
//! Every backend provides the same four operations: load a model from a file, bind the
//! model's input and outputs, execute it and free it again.

use std::path::Path;

use crate::{BackendType, Error};

pub mod native;
#[cfg(feature = "onnx")]
pub mod onnx;

/// Shape of the single input tensor, laid out as `[1, channels, height, width]` f32.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl InputSpec {
    pub fn len(&self) -> usize {
        self.width * self.height * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Backend {
    Native,
    #[cfg(feature = "onnx")]
    TensorGraph,
}

#[derive(Debug)]
pub enum Model {
    Native(native::NativeModel),
    #[cfg(feature = "onnx")]
    TensorGraph(onnx::GraphModel),
}

impl Backend {
    /// Resolves the backend for the requested type, or `None` if it was not compiled in.
    pub fn for_type(backend_type: BackendType) -> Option<Self> {
        match backend_type {
            BackendType::Native => Some(Backend::Native),
            #[cfg(feature = "onnx")]
            BackendType::TensorGraph => Some(Backend::TensorGraph),
            #[cfg(not(feature = "onnx"))]
            BackendType::TensorGraph => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Native => "native",
            #[cfg(feature = "onnx")]
            Backend::TensorGraph => "tensor-graph",
        }
    }

    pub fn load_model(&self, path: &Path) -> Result<Model, Error> {
        let res = match self {
            Backend::Native => native::NativeModel::load(path).map(|model| {
                gst::debug!(
                    crate::residual::CAT,
                    "Loaded native model with {} layers",
                    model.layers().len()
                );
                if model.is_empty() {
                    None
                } else {
                    Some(Model::Native(model))
                }
            }),
            #[cfg(feature = "onnx")]
            Backend::TensorGraph => onnx::GraphModel::load(path).map(|model| {
                if model.is_empty() {
                    None
                } else {
                    Some(Model::TensorGraph(model))
                }
            }),
        };

        match res {
            Ok(Some(model)) => Ok(model),
            Ok(None) => Err(Error::BackendIncomplete {
                path: path.to_owned(),
            }),
            Err(err) => Err(Error::ModelLoadFailed {
                path: path.to_owned(),
                err,
            }),
        }
    }

    pub fn set_input_output(
        &self,
        model: &mut Model,
        input: &InputSpec,
        input_name: &str,
        output_names: &[&str],
    ) -> Result<(), Error> {
        let res = match (self, model) {
            (Backend::Native, Model::Native(model)) => {
                model.set_input_output(input, input_name, output_names)
            }
            #[cfg(feature = "onnx")]
            (Backend::TensorGraph, Model::TensorGraph(model)) => {
                model.set_input_output(input, input_name, output_names)
            }
            #[cfg(feature = "onnx")]
            _ => Err(anyhow::anyhow!("Model was not loaded by this backend")),
        };

        res.map_err(Error::ModelBindingFailed)
    }

    /// Runs the model over `input` and returns the first bound output.
    pub fn execute(&self, model: &mut Model, input: &[f32]) -> Result<Vec<f32>, Error> {
        let res = match (self, model) {
            (Backend::Native, Model::Native(model)) => model.execute(input),
            #[cfg(feature = "onnx")]
            (Backend::TensorGraph, Model::TensorGraph(model)) => model.execute(input),
            #[cfg(feature = "onnx")]
            _ => Err(anyhow::anyhow!("Model was not loaded by this backend")),
        };

        res.map_err(Error::InferenceFailed)
    }

    /// Releases the model, if any. Safe to call repeatedly.
    pub fn free_model(&self, model: &mut Option<Model>) {
        if let Some(model) = model.take() {
            gst::debug!(crate::residual::CAT, "Freeing {} model", self.name());
            drop(model);
        }
    }
}
