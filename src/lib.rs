// Copyright (C) 2026 The gst-plugin-dnnresidual authors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0
#![allow(unused_doc_comments)]

/**
 * SECTION:plugin-dnnresidual
 *
 * Plugin containing elements that compute per-pixel residuals of video frames against the
 * prediction of a neural network.
 */
use gst::glib;

pub mod dnn;
mod dnnresidual;
pub mod error;
pub mod residual;

pub use error::{Error, ErrorKind};

/**
 * GstDnnResidualBackend:
 *
 * Backend that executes the model. The `native` backend is always available and runs on the
 * CPU. The `tensor-graph` backend requires the `onnx` build-time feature.
 */
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, glib::Enum)]
#[repr(C)]
#[enum_type(name = "GstDnnResidualBackend")]
pub enum BackendType {
    #[default]
    #[enum_value(name = "Native: built-in convolutional executor", nick = "native")]
    Native,
    #[enum_value(name = "Tensor graph: ONNX runtime", nick = "tensor-graph")]
    TensorGraph,
}

/**
 * GstDnnResidualMode:
 *
 * What to do with the residual of every frame.
 */
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, glib::Enum)]
#[repr(C)]
#[enum_type(name = "GstDnnResidualMode")]
pub enum ResidualMode {
    #[enum_value(name = "Passthrough: forward frames without inference", nick = "passthrough")]
    Passthrough,
    #[default]
    #[enum_value(
        name = "Analyze: compute residuals, leave frames untouched",
        nick = "analyze"
    )]
    Analyze,
    #[enum_value(
        name = "Visualize: replace frames with the residual around mid-grey",
        nick = "visualize"
    )]
    Visualize,
}

fn plugin_init(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    dnnresidual::register(plugin)?;
    Ok(())
}

gst::plugin_define!(
    dnnresidual,
    env!("CARGO_PKG_DESCRIPTION"),
    plugin_init,
    concat!(env!("CARGO_PKG_VERSION"), "-", env!("COMMIT_ID")),
    "MPL",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_REPOSITORY"),
    env!("BUILD_REL_DATE")
);
