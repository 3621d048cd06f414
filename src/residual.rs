// Copyright (C) 2026 The gst-plugin-dnnresidual authors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Host independent residual computation.
//!
//! [`ResidualContext`] owns the backend, the loaded model and one residual buffer per plane.
//! Its lifecycle is `initialize()` once, `configure()` for every negotiated stream format,
//! `compute()` for every frame and finally `shutdown()`.
//!
//! The model gets the three planes of a frame as a `[1, 3, height, width]` tensor with values
//! normalized to `[0, 1]`, chroma planes upsampled to full resolution by nearest neighbour. The
//! model output `y` of the same shape is the prediction, and the residual of each sample is
//! `input - prediction` scaled back to 8 bits and clamped to the `i8` range.

use std::{path::Path, sync::LazyLock};

use anyhow::anyhow;

use crate::{
    BackendType, Error,
    dnn::{Backend, InputSpec, Model},
};

pub static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "dnnresidual",
        gst::DebugColorFlags::empty(),
        Some("DNN residual filter"),
    )
});

pub const N_PLANES: usize = 3;
pub const MODEL_INPUT_NAME: &str = "x";
pub const MODEL_OUTPUT_NAME: &str = "y";

/// Residual storage for one plane, always at full frame resolution.
#[derive(Debug)]
pub struct PlaneInfo {
    residual: Vec<i8>,
    width: usize,
    height: usize,
}

impl PlaneInfo {
    fn new(plane: usize, width: usize, height: usize) -> Result<Self, Error> {
        let size = width * height;
        let mut residual = Vec::new();
        residual
            .try_reserve_exact(size)
            .map_err(|_| Error::AllocationFailed { plane, size })?;
        residual.resize(size, 0);

        Ok(PlaneInfo {
            residual,
            width,
            height,
        })
    }

    pub fn residual(&self) -> &[i8] {
        &self.residual
    }
}

/// Negotiated stream parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub format: gst_video::VideoFormat,
    pub width: usize,
    pub height: usize,
    pub n_planes: usize,
}

impl StreamConfig {
    pub fn from_info(info: &gst_video::VideoInfo) -> Self {
        StreamConfig {
            format: info.format(),
            width: info.width() as usize,
            height: info.height() as usize,
            n_planes: info.n_planes() as usize,
        }
    }
}

/// Read-only view of one plane of a frame.
#[derive(Debug)]
pub struct PlaneData<'a> {
    pub data: &'a [u8],
    pub stride: usize,
    pub width: usize,
    pub height: usize,
}

/// Writable view of one plane of a frame.
#[derive(Debug)]
pub struct PlaneDataMut<'a> {
    pub data: &'a mut [u8],
    pub stride: usize,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResidualStats {
    pub mean_abs: [f64; N_PLANES],
    pub peak_abs: [u8; N_PLANES],
}

#[derive(Debug, Default)]
pub struct ResidualContext {
    backend: Option<Backend>,
    model: Option<Model>,
    input: Option<InputSpec>,
    planes: Vec<PlaneInfo>,
    tensor: Vec<f32>,
}

impl ResidualContext {
    /// Resolves the backend and loads the model. Anything loaded before is released first.
    pub fn initialize(
        &mut self,
        backend_type: BackendType,
        model_path: Option<&Path>,
    ) -> Result<(), Error> {
        self.shutdown();

        let backend =
            Backend::for_type(backend_type).ok_or(Error::BackendUnavailable(backend_type))?;

        let Some(path) = model_path.filter(|p| !p.as_os_str().is_empty()) else {
            return Err(Error::MissingModelPath);
        };

        gst::debug!(
            CAT,
            "Loading model {} with {} backend",
            path.display(),
            backend.name()
        );
        let model = backend.load_model(path)?;

        self.backend = Some(backend);
        self.model = Some(model);

        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.is_some() && self.model.is_some()
    }

    /// Binds the model to the stream dimensions and allocates the residual planes.
    pub fn configure(&mut self, config: &StreamConfig) -> Result<(), Error> {
        self.release_planes();
        self.input = None;

        if config.format != gst_video::VideoFormat::I420 {
            return Err(Error::UnsupportedFormat(config.format.to_str().to_string()));
        }

        let (Some(backend), Some(model)) = (self.backend.as_ref(), self.model.as_mut()) else {
            return Err(Error::NotConfigured);
        };

        let input = InputSpec {
            width: config.width,
            height: config.height,
            channels: N_PLANES,
        };
        backend.set_input_output(model, &input, MODEL_INPUT_NAME, &[MODEL_OUTPUT_NAME])?;

        if config.n_planes != N_PLANES {
            return Err(Error::PlaneCountMismatch {
                expected: N_PLANES,
                actual: config.n_planes,
            });
        }

        let mut planes = Vec::with_capacity(N_PLANES);
        for plane in 0..N_PLANES {
            planes.push(PlaneInfo::new(plane, config.width, config.height)?);
        }

        let mut tensor = Vec::new();
        tensor
            .try_reserve_exact(input.len())
            .map_err(|_| Error::AllocationFailed {
                plane: N_PLANES,
                size: input.len() * std::mem::size_of::<f32>(),
            })?;

        self.planes = planes;
        self.tensor = tensor;
        self.input = Some(input);

        gst::debug!(
            CAT,
            "Configured for {}x{} with {} planes",
            config.width,
            config.height,
            self.planes.len()
        );

        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.input.is_some() && self.planes.len() == N_PLANES
    }

    pub fn planes(&self) -> &[PlaneInfo] {
        &self.planes
    }

    /// Runs the model over the planes of one frame and stores the residuals.
    pub fn compute(&mut self, src: &[PlaneData<'_>]) -> Result<ResidualStats, Error> {
        let Some(input) = self.input else {
            return Err(Error::NotConfigured);
        };
        let (Some(backend), Some(model)) = (self.backend.as_ref(), self.model.as_mut()) else {
            return Err(Error::NotConfigured);
        };
        if src.len() != N_PLANES {
            return Err(Error::PlaneCountMismatch {
                expected: N_PLANES,
                actual: src.len(),
            });
        }

        let width = input.width;
        let height = input.height;
        let plane_size = width * height;

        self.tensor.clear();
        for plane in src {
            for y in 0..height {
                let sy = y * plane.height / height;
                let line = &plane.data[sy * plane.stride..][..plane.width];
                self.tensor.extend(
                    (0..width).map(|x| line[x * plane.width / width] as f32 / 255.0),
                );
            }
        }

        let prediction = backend.execute(model, &self.tensor)?;
        if prediction.len() != input.len() {
            return Err(Error::InferenceFailed(anyhow!(
                "Model output has {} values but {} were expected",
                prediction.len(),
                input.len()
            )));
        }

        let mut stats = ResidualStats::default();
        for (p, plane) in self.planes.iter_mut().enumerate() {
            let actual = &self.tensor[p * plane_size..][..plane_size];
            let predicted = &prediction[p * plane_size..][..plane_size];

            let mut sum = 0u64;
            let mut peak = 0u8;
            for ((r, a), b) in plane.residual.iter_mut().zip(actual).zip(predicted) {
                *r = ((a - b) * 255.0).round().clamp(-128.0, 127.0) as i8;
                let abs = r.unsigned_abs();
                sum += abs as u64;
                peak = peak.max(abs);
            }

            stats.mean_abs[p] = sum as f64 / plane_size as f64;
            stats.peak_abs[p] = peak;
        }

        gst::trace!(CAT, "Computed residual {:?}", stats);

        Ok(stats)
    }

    /// Replaces plane `p` of a frame with the last computed residual, centered around 128.
    /// Chroma planes sample the residual at the top-left position of every block.
    pub fn visualize_plane(&self, p: usize, mut plane: PlaneDataMut<'_>) -> Result<(), Error> {
        if self.input.is_none() {
            return Err(Error::NotConfigured);
        }
        let Some(info) = self.planes.get(p) else {
            return Err(Error::PlaneCountMismatch {
                expected: N_PLANES,
                actual: p + 1,
            });
        };

        for y in 0..plane.height {
            let ry = y * info.height / plane.height;
            let residual = &info.residual[ry * info.width..][..info.width];
            let line = &mut plane.data[y * plane.stride..][..plane.width];

            for (x, out) in line.iter_mut().enumerate() {
                let r = residual[x * info.width / plane.width];
                *out = (128 + r as i16).clamp(0, 255) as u8;
            }
        }

        Ok(())
    }

    fn release_planes(&mut self) {
        self.planes.clear();
        self.tensor = Vec::new();
    }

    /// Releases planes, model and backend, in that order. Safe to call at any time.
    pub fn shutdown(&mut self) {
        self.release_planes();
        self.input = None;

        if let Some(backend) = self.backend.take() {
            backend.free_model(&mut self.model);
        }
        self.model = None;
    }
}

impl Drop for ResidualContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
