// Copyright (C) 2026 The gst-plugin-dnnresidual authors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::{fmt, path::Path};

use anyhow::{Context, bail, ensure};
use ndarray::Array4;
use ort::{session::Session, value::TensorRef};

use super::InputSpec;

struct Binding {
    input: InputSpec,
    input_name: String,
    output_name: String,
}

/// Tensor graph loaded into ONNX Runtime.
pub struct GraphModel {
    session: Session,
    binding: Option<Binding>,
}

impl fmt::Debug for GraphModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphModel")
            .field(
                "inputs",
                &self
                    .session
                    .inputs()
                    .iter()
                    .map(|i| i.name())
                    .collect::<Vec<_>>(),
            )
            .field(
                "outputs",
                &self
                    .session
                    .outputs()
                    .iter()
                    .map(|o| o.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl GraphModel {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let session = Session::builder()
            .context("Failed to create session builder")?
            .commit_from_file(path)
            .context("Failed to load graph")?;

        Ok(GraphModel {
            session,
            binding: None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.session.inputs().is_empty() || self.session.outputs().is_empty()
    }

    fn has_input(&self, name: &str) -> bool {
        self.session.inputs().iter().any(|i| i.name() == name)
    }

    fn has_output(&self, name: &str) -> bool {
        self.session.outputs().iter().any(|o| o.name() == name)
    }

    pub fn set_input_output(
        &mut self,
        input: &InputSpec,
        input_name: &str,
        output_names: &[&str],
    ) -> Result<(), anyhow::Error> {
        ensure!(
            self.has_input(input_name),
            "Graph has no input named '{input_name}'"
        );
        let [output_name] = output_names else {
            bail!(
                "Exactly one output is supported but {} were requested",
                output_names.len()
            );
        };
        ensure!(
            self.has_output(output_name),
            "Graph has no output named '{output_name}'"
        );

        self.binding = Some(Binding {
            input: *input,
            input_name: input_name.to_owned(),
            output_name: (*output_name).to_owned(),
        });

        Ok(())
    }

    pub fn execute(&mut self, input: &[f32]) -> Result<Vec<f32>, anyhow::Error> {
        let Some(ref binding) = self.binding else {
            bail!("Input and output are not set");
        };
        let spec = binding.input;

        let array = Array4::from_shape_vec(
            (1, spec.channels, spec.height, spec.width),
            input.to_vec(),
        )
        .context("Input has the wrong size")?;
        let tensor = TensorRef::from_array_view(array.view())?;

        let input_name = binding.input_name.clone();
        let output_name = binding.output_name.clone();

        let outputs = self
            .session
            .run(ort::inputs![input_name.as_str() => tensor])
            .context("Failed to run graph")?;
        let output = outputs[output_name.as_str()]
            .try_extract_array::<f32>()
            .context("Output is not a f32 tensor")?;

        Ok(output.iter().copied().collect())
    }
}
