// Copyright (C) 2026 The gst-plugin-dnnresidual authors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

/**
 * SECTION:element-dnnresidual
 *
 * Runs a neural network over every I420 frame and computes the residual between the frame and
 * the network's prediction of it.
 *
 * The model gets the Y, U and V planes as a `[1, 3, height, width]` float tensor named `x` with
 * values in `[0, 1]`, chroma upsampled to full resolution, and has to produce a tensor `y` of
 * the same shape. The residual is kept per plane as signed 8 bit values.
 *
 * In `analyze` mode frames are forwarded unchanged, optionally with a `dnnresidual` element
 * message per frame carrying the mean and peak absolute residual of every plane. In `visualize`
 * mode the frame is replaced by the residual centered around 128. `passthrough` skips inference.
 *
 * |[
 * gst-launch-1.0 videotestsrc ! videoconvert ! dnnresidual model=model.dnnr mode=visualize ! videoconvert ! autovideosink
 * ]|
 */
use gst::{glib, subclass::prelude::*};
use gst_base::{
    prelude::*,
    subclass::base_transform::{InputBuffer, PrepareOutputBufferSuccess},
};
use gst_video::{VideoFormat, prelude::*, subclass::prelude::*};

use std::{
    path::PathBuf,
    sync::{LazyLock, Mutex},
};

use crate::{
    BackendType, ResidualMode,
    residual::{
        CAT, N_PLANES, PlaneData, PlaneDataMut, ResidualContext, ResidualStats, StreamConfig,
    },
};

const DEFAULT_POST_MESSAGES: bool = false;

#[derive(Debug, Clone)]
struct Settings {
    backend_type: BackendType,
    model: Option<PathBuf>,
    mode: ResidualMode,
    post_messages: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            backend_type: BackendType::default(),
            model: None,
            mode: ResidualMode::default(),
            post_messages: DEFAULT_POST_MESSAGES,
        }
    }
}

struct State {
    ctx: ResidualContext,
    info: Option<gst_video::VideoInfo>,
    frame_count: u64,
}

#[derive(Default)]
pub struct DnnResidual {
    settings: Mutex<Settings>,
    state: Mutex<Option<State>>,
}

impl DnnResidual {
    fn compute_residual<T>(
        &self,
        ctx: &mut ResidualContext,
        frame: &gst_video::VideoFrameRef<T>,
    ) -> Result<ResidualStats, gst::FlowError> {
        let planes = (0..N_PLANES as u32)
            .map(|p| {
                frame.plane_data(p).map(|data| PlaneData {
                    data,
                    stride: frame.plane_stride()[p as usize] as usize,
                    width: frame.comp_width(p) as usize,
                    height: frame.comp_height(p) as usize,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                gst::error!(CAT, imp = self, "Failed to access plane: {err}");
                gst::FlowError::Error
            })?;

        ctx.compute(&planes).map_err(|err| {
            gst::element_imp_error!(self, gst::StreamError::Failed, ["{}", err]);
            gst::FlowError::Error
        })
    }

    fn run_inference(
        &self,
        state: &mut State,
        buffer: &mut gst::BufferRef,
        mode: ResidualMode,
    ) -> Result<ResidualStats, gst::FlowError> {
        let Some(ref info) = state.info else {
            gst::error!(CAT, imp = self, "No caps");
            return Err(gst::FlowError::NotNegotiated);
        };

        if mode != ResidualMode::Visualize {
            let Ok(frame) = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, info) else {
                gst::element_imp_error!(
                    self,
                    gst::CoreError::Failed,
                    ["Failed to map video frame"]
                );
                return Err(gst::FlowError::Error);
            };

            return self.compute_residual(&mut state.ctx, &frame);
        }

        let Ok(mut frame) = gst_video::VideoFrameRef::from_buffer_ref_writable(buffer, info)
        else {
            gst::element_imp_error!(
                self,
                gst::CoreError::Failed,
                ["Failed to map video frame"]
            );
            return Err(gst::FlowError::Error);
        };

        let stats = self.compute_residual(&mut state.ctx, &frame)?;

        for p in 0..N_PLANES {
            let stride = frame.plane_stride()[p] as usize;
            let width = frame.comp_width(p as u32) as usize;
            let height = frame.comp_height(p as u32) as usize;

            let data = frame.plane_data_mut(p as u32).map_err(|err| {
                gst::error!(CAT, imp = self, "Failed to access plane: {err}");
                gst::FlowError::Error
            })?;

            let plane = PlaneDataMut {
                data,
                stride,
                width,
                height,
            };
            state.ctx.visualize_plane(p, plane).map_err(|err| {
                gst::element_imp_error!(self, gst::StreamError::Failed, ["{}", err]);
                gst::FlowError::Error
            })?;
        }

        Ok(stats)
    }

    fn post_stats(&self, frame: u64, pts: Option<gst::ClockTime>, stats: &ResidualStats) {
        let segment = self.obj().segment().downcast::<gst::ClockTime>().ok();
        let running_time = segment.as_ref().and_then(|s| s.to_running_time(pts));

        let s = gst::Structure::builder("dnnresidual")
            .field("frame", frame)
            .field("timestamp", pts)
            .field("running-time", running_time)
            .field(
                "mean-abs",
                gst::Array::from_values(stats.mean_abs.iter().map(|v| v.to_send_value())),
            )
            .field(
                "peak-abs",
                gst::Array::from_values(
                    stats.peak_abs.iter().map(|v| (*v as u32).to_send_value()),
                ),
            )
            .build();

        gst::debug!(CAT, imp = self, "Posting message {}", s);

        let msg = gst::message::Element::builder(s).src(&*self.obj()).build();
        let _ = self.obj().post_message(msg);
    }
}

#[glib::object_subclass]
impl ObjectSubclass for DnnResidual {
    const NAME: &'static str = "GstDnnResidual";
    type Type = super::DnnResidual;
    type ParentType = gst_base::BaseTransform;
}

impl ObjectImpl for DnnResidual {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: LazyLock<Vec<glib::ParamSpec>> = LazyLock::new(|| {
            vec![
                glib::ParamSpecEnum::builder("dnn-backend")
                    .nick("DNN Backend")
                    .blurb("DNN backend used for model execution")
                    .default_value(Settings::default().backend_type)
                    .mutable_ready()
                    .build(),
                glib::ParamSpecString::builder("model")
                    .nick("Model")
                    .blurb("Path to model file specifying network architecture and its parameters")
                    .mutable_ready()
                    .build(),
                glib::ParamSpecEnum::builder("mode")
                    .nick("Mode")
                    .blurb("What to do with the residual of every frame")
                    .default_value(Settings::default().mode)
                    .mutable_playing()
                    .build(),
                glib::ParamSpecBoolean::builder("post-messages")
                    .nick("Post Messages")
                    .blurb("Post an element message with residual statistics for every frame")
                    .default_value(DEFAULT_POST_MESSAGES)
                    .mutable_playing()
                    .build(),
            ]
        });

        PROPERTIES.as_ref()
    }

    fn set_property(&self, _id: usize, value: &glib::Value, pspec: &glib::ParamSpec) {
        let mut settings = self.settings.lock().unwrap();
        match pspec.name() {
            "dnn-backend" => {
                let backend_type = value.get().expect("type checked upstream");
                gst::info!(
                    CAT,
                    imp = self,
                    "Changing dnn-backend from {:?} to {:?}",
                    settings.backend_type,
                    backend_type
                );
                settings.backend_type = backend_type;
            }
            "model" => {
                let model = value
                    .get::<Option<String>>()
                    .expect("type checked upstream")
                    .map(PathBuf::from);
                gst::info!(
                    CAT,
                    imp = self,
                    "Changing model from {:?} to {:?}",
                    settings.model,
                    model
                );
                settings.model = model;
            }
            "mode" => {
                let mode = value.get().expect("type checked upstream");
                gst::info!(
                    CAT,
                    imp = self,
                    "Changing mode from {:?} to {:?}",
                    settings.mode,
                    mode
                );
                settings.mode = mode;
            }
            "post-messages" => {
                settings.post_messages = value.get().expect("type checked upstream");
            }
            _ => unimplemented!(),
        }
    }

    fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        let settings = self.settings.lock().unwrap();
        match pspec.name() {
            "dnn-backend" => settings.backend_type.to_value(),
            "model" => settings
                .model
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .to_value(),
            "mode" => settings.mode.to_value(),
            "post-messages" => settings.post_messages.to_value(),
            _ => unimplemented!(),
        }
    }
}

impl GstObjectImpl for DnnResidual {}

impl ElementImpl for DnnResidual {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: LazyLock<gst::subclass::ElementMetadata> = LazyLock::new(|| {
            gst::subclass::ElementMetadata::new(
                "DNN Residual",
                "Filter/Analyzer/Video",
                "Computes the residual between video frames and a neural network's prediction",
                "The gst-plugin-dnnresidual authors",
            )
        });

        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: LazyLock<Vec<gst::PadTemplate>> = LazyLock::new(|| {
            let caps = gst_video::VideoCapsBuilder::new()
                .format(VideoFormat::I420)
                .build();

            let src_pad_template = gst::PadTemplate::new(
                "src",
                gst::PadDirection::Src,
                gst::PadPresence::Always,
                &caps,
            )
            .unwrap();

            let sink_pad_template = gst::PadTemplate::new(
                "sink",
                gst::PadDirection::Sink,
                gst::PadPresence::Always,
                &caps,
            )
            .unwrap();

            vec![src_pad_template, sink_pad_template]
        });

        PAD_TEMPLATES.as_ref()
    }
}

impl BaseTransformImpl for DnnResidual {
    const MODE: gst_base::subclass::BaseTransformMode =
        gst_base::subclass::BaseTransformMode::AlwaysInPlace;
    const PASSTHROUGH_ON_SAME_CAPS: bool = false;
    const TRANSFORM_IP_ON_PASSTHROUGH: bool = false;

    fn start(&self) -> Result<(), gst::ErrorMessage> {
        let settings = self.settings.lock().unwrap().clone();

        let mut ctx = ResidualContext::default();
        if let Err(err) = ctx.initialize(settings.backend_type, settings.model.as_deref()) {
            gst::error!(CAT, imp = self, "Failed to initialize: {err}");
            return Err(err.to_error_message());
        }

        *self.state.lock().unwrap() = Some(State {
            ctx,
            info: None,
            frame_count: 0,
        });

        gst::info!(CAT, imp = self, "Started");

        Ok(())
    }

    fn stop(&self) -> Result<(), gst::ErrorMessage> {
        if let Some(mut state) = self.state.lock().unwrap().take() {
            state.ctx.shutdown();
        }

        gst::info!(CAT, imp = self, "Stopped");

        Ok(())
    }

    fn set_caps(&self, incaps: &gst::Caps, outcaps: &gst::Caps) -> Result<(), gst::LoggableError> {
        let Ok(info) = gst_video::VideoInfo::from_caps(incaps) else {
            return Err(gst::loggable_error!(CAT, "Invalid caps {incaps:?}"));
        };

        let mut state_guard = self.state.lock().unwrap();
        let Some(state) = &mut *state_guard else {
            return Err(gst::loggable_error!(CAT, "Invalid state"));
        };

        state.info = None;
        if let Err(err) = state.ctx.configure(&StreamConfig::from_info(&info)) {
            return Err(gst::loggable_error!(CAT, "Failed to configure: {err}"));
        }
        state.info = Some(info);

        gst::debug!(
            CAT,
            imp = self,
            "Configured for caps {} to {}",
            incaps,
            outcaps
        );

        drop(state_guard);

        self.parent_set_caps(incaps, outcaps)
    }

    fn prepare_output_buffer(
        &self,
        inbuf: InputBuffer,
    ) -> Result<PrepareOutputBufferSuccess, gst::FlowError> {
        match inbuf {
            InputBuffer::Writable(outbuf) => {
                gst::log!(
                    CAT,
                    imp = self,
                    "Processing writable input buffer of size {} in place",
                    outbuf.size()
                );

                Ok(PrepareOutputBufferSuccess::InputBuffer)
            }
            InputBuffer::Readable(buf) => {
                gst::log!(
                    CAT,
                    imp = self,
                    "Copying readable input buffer of size {}",
                    buf.size()
                );

                let outbuf = buf.copy_deep().map_err(|err| {
                    gst::element_imp_error!(
                        self,
                        gst::CoreError::Failed,
                        ["Failed to allocate output buffer: {}", err]
                    );
                    gst::FlowError::Error
                })?;

                Ok(PrepareOutputBufferSuccess::Buffer(outbuf))
            }
        }
    }

    fn transform_ip(
        &self,
        buffer: &mut gst::BufferRef,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        let (mode, post_messages) = {
            let settings = self.settings.lock().unwrap();
            (settings.mode, settings.post_messages)
        };

        let mut state_guard = self.state.lock().unwrap();
        let Some(state) = &mut *state_guard else {
            gst::debug!(CAT, imp = self, "Wrong state");
            return Err(gst::FlowError::Flushing);
        };

        let Some((width, height)) = state.info.as_ref().map(|info| (info.width(), info.height()))
        else {
            gst::error!(CAT, imp = self, "No caps");
            return Err(gst::FlowError::NotNegotiated);
        };

        let n = state.frame_count;
        state.frame_count += 1;

        gst::info!(
            CAT,
            imp = self,
            "n:{:4} pos:{:9} s:{}x{}",
            n,
            buffer.offset() as i64,
            width,
            height
        );

        if mode == ResidualMode::Passthrough {
            return Ok(gst::FlowSuccess::Ok);
        }

        let stats = self.run_inference(state, buffer, mode)?;
        drop(state_guard);

        if post_messages {
            self.post_stats(n, buffer.pts(), &stats);
        }

        Ok(gst::FlowSuccess::Ok)
    }
}
