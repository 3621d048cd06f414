// Copyright (C) 2026 The gst-plugin-dnnresidual authors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Built-in CPU executor for small convolutional models.
//!
//! Models are stored as a flat little-endian file:
//!
//! ```text
//! magic    "DNNR"
//! version  u32 (1)
//! n_layers u32
//! layer*   kind u32 (1 = conv2d), followed by the layer parameters
//! ```
//!
//! A conv2d layer is `activation, padding, dilation, in_channels, out_channels, kernel_size`
//! (all u32), then `out * k * k * in` f32 weights in `[out][ky][kx][in]` order and `out` f32
//! biases. All convolutions keep the spatial size of their input.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
};

use anyhow::{Context, bail, ensure};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::InputSpec;

const MAGIC: &[u8; 4] = b"DNNR";
const VERSION: u32 = 1;
const LAYER_CONV2D: u32 = 1;

const LEAKY_RELU_SLOPE: f32 = 0.2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Activation {
    None,
    Relu,
    Tanh,
    Sigmoid,
    LeakyRelu,
}

impl Activation {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Activation::None),
            1 => Some(Activation::Relu),
            2 => Some(Activation::Tanh),
            3 => Some(Activation::Sigmoid),
            4 => Some(Activation::LeakyRelu),
            _ => None,
        }
    }

    fn to_u32(self) -> u32 {
        match self {
            Activation::None => 0,
            Activation::Relu => 1,
            Activation::Tanh => 2,
            Activation::Sigmoid => 3,
            Activation::LeakyRelu => 4,
        }
    }

    #[inline]
    fn apply(self, v: f32) -> f32 {
        match self {
            Activation::None => v,
            Activation::Relu => v.max(0.0),
            Activation::Tanh => v.tanh(),
            Activation::Sigmoid => 1.0 / (1.0 + (-v).exp()),
            Activation::LeakyRelu => {
                if v < 0.0 {
                    v * LEAKY_RELU_SLOPE
                } else {
                    v
                }
            }
        }
    }
}

/// How samples outside of the frame are filled in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Padding {
    Zeros,
    ClampToEdge,
}

impl Padding {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Padding::Zeros),
            1 => Some(Padding::ClampToEdge),
            _ => None,
        }
    }

    fn to_u32(self) -> u32 {
        match self {
            Padding::Zeros => 0,
            Padding::ClampToEdge => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conv2d {
    pub activation: Activation,
    pub padding: Padding,
    pub dilation: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
}

impl Conv2d {
    fn validate(&self) -> Result<(), anyhow::Error> {
        ensure!(self.dilation >= 1, "Invalid dilation {}", self.dilation);
        ensure!(
            self.kernel_size % 2 == 1,
            "Kernel size {} is not odd",
            self.kernel_size
        );
        ensure!(
            self.in_channels > 0 && self.out_channels > 0,
            "Invalid channel configuration {} -> {}",
            self.in_channels,
            self.out_channels
        );
        ensure!(
            self.weights.len()
                == self.out_channels * self.kernel_size * self.kernel_size * self.in_channels,
            "Expected {} weights but have {}",
            self.out_channels * self.kernel_size * self.kernel_size * self.in_channels,
            self.weights.len()
        );
        ensure!(
            self.biases.len() == self.out_channels,
            "Expected {} biases but have {}",
            self.out_channels,
            self.biases.len()
        );

        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> Result<Self, io::Error> {
        let activation = r.read_u32::<LittleEndian>()?;
        let padding = r.read_u32::<LittleEndian>()?;
        let dilation = r.read_u32::<LittleEndian>()? as usize;
        let in_channels = r.read_u32::<LittleEndian>()? as usize;
        let out_channels = r.read_u32::<LittleEndian>()? as usize;
        let kernel_size = r.read_u32::<LittleEndian>()? as usize;

        let activation = Activation::from_u32(activation).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown activation {activation}"),
            )
        })?;
        let padding = Padding::from_u32(padding).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown padding {padding}"),
            )
        })?;

        let n_weights = out_channels
            .checked_mul(kernel_size)
            .and_then(|v| v.checked_mul(kernel_size))
            .and_then(|v| v.checked_mul(in_channels))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Too many weights"))?;

        let weights = read_f32s(r, n_weights)?;
        let biases = read_f32s(r, out_channels)?;

        Ok(Conv2d {
            activation,
            padding,
            dilation,
            in_channels,
            out_channels,
            kernel_size,
            weights,
            biases,
        })
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<(), io::Error> {
        w.write_u32::<LittleEndian>(self.activation.to_u32())?;
        w.write_u32::<LittleEndian>(self.padding.to_u32())?;
        w.write_u32::<LittleEndian>(self.dilation as u32)?;
        w.write_u32::<LittleEndian>(self.in_channels as u32)?;
        w.write_u32::<LittleEndian>(self.out_channels as u32)?;
        w.write_u32::<LittleEndian>(self.kernel_size as u32)?;
        for v in self.weights.iter().chain(self.biases.iter()) {
            w.write_f32::<LittleEndian>(*v)?;
        }

        Ok(())
    }

    /// Runs the convolution over a `[in_channels, height, width]` input and writes a
    /// `[out_channels, height, width]` output.
    fn forward(&self, input: &[f32], width: usize, height: usize, output: &mut [f32]) {
        let plane = width * height;
        let k = self.kernel_size;
        let radius = (k / 2) as isize;
        let dilation = self.dilation as isize;

        debug_assert_eq!(input.len(), self.in_channels * plane);
        debug_assert_eq!(output.len(), self.out_channels * plane);

        for (oc, out_plane) in output.chunks_exact_mut(plane).enumerate() {
            let bias = self.biases[oc];

            for y in 0..height {
                for x in 0..width {
                    let mut sum = bias;

                    for ky in 0..k {
                        let sy = y as isize + (ky as isize - radius) * dilation;
                        let Some(sy) = self.resolve(sy, height) else {
                            continue;
                        };

                        for kx in 0..k {
                            let sx = x as isize + (kx as isize - radius) * dilation;
                            let Some(sx) = self.resolve(sx, width) else {
                                continue;
                            };

                            let w_off = ((oc * k + ky) * k + kx) * self.in_channels;
                            let weights = &self.weights[w_off..][..self.in_channels];
                            for (ic, weight) in weights.iter().enumerate() {
                                sum += weight * input[ic * plane + sy * width + sx];
                            }
                        }
                    }

                    out_plane[y * width + x] = self.activation.apply(sum);
                }
            }
        }
    }

    #[inline]
    fn resolve(&self, pos: isize, size: usize) -> Option<usize> {
        if pos >= 0 && (pos as usize) < size {
            return Some(pos as usize);
        }

        match self.padding {
            Padding::Zeros => None,
            Padding::ClampToEdge => Some(pos.clamp(0, size as isize - 1) as usize),
        }
    }
}

const READ_CHUNK: usize = 4096;

/// Reads `count` f32 values. Memory grows with the data actually read, so a header announcing
/// more values than the file contains fails without a large up-front allocation.
fn read_f32s<R: Read>(r: &mut R, count: usize) -> Result<Vec<f32>, io::Error> {
    let mut values = Vec::with_capacity(count.min(READ_CHUNK));
    let mut chunk = [0.0f32; READ_CHUNK];

    let mut remaining = count;
    while remaining > 0 {
        let n = remaining.min(READ_CHUNK);
        r.read_f32_into::<LittleEndian>(&mut chunk[..n])?;
        values
            .try_reserve(n)
            .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "Too many values"))?;
        values.extend_from_slice(&chunk[..n]);
        remaining -= n;
    }

    Ok(values)
}

#[derive(Debug, Clone)]
struct Binding {
    input: InputSpec,
    input_name: String,
    output_name: String,
}

#[derive(Debug, Clone)]
pub struct NativeModel {
    layers: Vec<Conv2d>,
    binding: Option<Binding>,
}

impl NativeModel {
    pub fn new(layers: Vec<Conv2d>) -> Result<Self, anyhow::Error> {
        for (idx, layer) in layers.iter().enumerate() {
            layer
                .validate()
                .with_context(|| format!("Invalid layer {idx}"))?;
        }

        for (idx, pair) in layers.windows(2).enumerate() {
            ensure!(
                pair[0].out_channels == pair[1].in_channels,
                "Layer {} produces {} channels but layer {} consumes {}",
                idx,
                pair[0].out_channels,
                idx + 1,
                pair[1].in_channels
            );
        }

        Ok(NativeModel {
            layers,
            binding: None,
        })
    }

    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let file = File::open(path).context("Failed to open model file")?;
        Self::read(&mut BufReader::new(file))
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self, anyhow::Error> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).context("Failed to read header")?;
        ensure!(&magic == MAGIC, "Not a native model file");

        let version = r.read_u32::<LittleEndian>().context("Failed to read header")?;
        ensure!(version == VERSION, "Unsupported model version {version}");

        let n_layers = r
            .read_u32::<LittleEndian>()
            .context("Failed to read header")?;

        let mut layers = Vec::new();
        for idx in 0..n_layers {
            let kind = r
                .read_u32::<LittleEndian>()
                .with_context(|| format!("Failed to read layer {idx}"))?;

            match kind {
                LAYER_CONV2D => {
                    let layer =
                        Conv2d::read(r).with_context(|| format!("Failed to read layer {idx}"))?;
                    layers.push(layer);
                }
                _ => bail!("Unknown layer type {kind} for layer {idx}"),
            }
        }

        Self::new(layers)
    }

    pub fn save(&self, path: &Path) -> Result<(), anyhow::Error> {
        let file = File::create(path).context("Failed to create model file")?;
        let mut w = BufWriter::new(file);
        self.write(&mut w)?;
        w.flush()?;

        Ok(())
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), anyhow::Error> {
        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(VERSION)?;
        w.write_u32::<LittleEndian>(self.layers.len() as u32)?;
        for layer in &self.layers {
            w.write_u32::<LittleEndian>(LAYER_CONV2D)?;
            layer.write(w)?;
        }

        Ok(())
    }

    pub fn layers(&self) -> &[Conv2d] {
        &self.layers
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn input_channels(&self) -> Option<usize> {
        self.layers.first().map(|l| l.in_channels)
    }

    pub fn output_channels(&self) -> Option<usize> {
        self.layers.last().map(|l| l.out_channels)
    }

    pub fn set_input_output(
        &mut self,
        input: &InputSpec,
        input_name: &str,
        output_names: &[&str],
    ) -> Result<(), anyhow::Error> {
        let Some(in_channels) = self.input_channels() else {
            bail!("Model has no layers");
        };
        ensure!(
            in_channels == input.channels,
            "Model expects {in_channels} input channels but {} were requested",
            input.channels
        );
        let out_channels = self.output_channels().unwrap_or(0);
        ensure!(
            out_channels == input.channels,
            "Model produces {out_channels} output channels but {} are required",
            input.channels
        );
        ensure!(
            input.width > 0 && input.height > 0,
            "Invalid input size {}x{}",
            input.width,
            input.height
        );
        let [output_name] = output_names else {
            bail!(
                "Native models have exactly one output but {} were requested",
                output_names.len()
            );
        };

        self.binding = Some(Binding {
            input: *input,
            input_name: input_name.to_owned(),
            output_name: (*output_name).to_owned(),
        });

        Ok(())
    }

    /// Runs all layers over a `[channels, height, width]` input and returns the output of the
    /// last layer.
    pub fn execute(&self, input: &[f32]) -> Result<Vec<f32>, anyhow::Error> {
        let Some(ref binding) = self.binding else {
            bail!("Input and output are not set");
        };
        let spec = &binding.input;
        ensure!(
            input.len() == spec.len(),
            "Input '{}' has {} values but {} were expected",
            binding.input_name,
            input.len(),
            spec.len()
        );

        let plane = spec.width * spec.height;
        let mut current = input.to_vec();
        for layer in &self.layers {
            let mut next = vec![0.0f32; layer.out_channels * plane];
            layer.forward(&current, spec.width, spec.height, &mut next);
            current = next;
        }
        ensure!(
            current.len() == spec.len(),
            "Output '{}' has {} values but {} were expected",
            binding.output_name,
            current.len(),
            spec.len()
        );

        Ok(current)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 1x1 convolution that copies its input.
    pub(crate) fn identity_layer(channels: usize) -> Conv2d {
        let mut weights = vec![0.0; channels * channels];
        for c in 0..channels {
            weights[c * channels + c] = 1.0;
        }

        Conv2d {
            activation: Activation::None,
            padding: Padding::Zeros,
            dilation: 1,
            in_channels: channels,
            out_channels: channels,
            kernel_size: 1,
            weights,
            biases: vec![0.0; channels],
        }
    }

    fn box_blur_layer() -> Conv2d {
        Conv2d {
            activation: Activation::None,
            padding: Padding::ClampToEdge,
            dilation: 1,
            in_channels: 1,
            out_channels: 1,
            kernel_size: 3,
            weights: vec![1.0 / 9.0; 9],
            biases: vec![0.0],
        }
    }

    fn spec(width: usize, height: usize, channels: usize) -> InputSpec {
        InputSpec {
            width,
            height,
            channels,
        }
    }

    #[test]
    fn test_identity() {
        let mut model = NativeModel::new(vec![identity_layer(3)]).unwrap();
        model
            .set_input_output(&spec(4, 2, 3), "x", &["y"])
            .unwrap();

        let input = (0..24).map(|v| v as f32 / 24.0).collect::<Vec<_>>();
        let output = model.execute(&input).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_box_blur_clamped() {
        let mut model = NativeModel::new(vec![box_blur_layer()]).unwrap();
        model
            .set_input_output(&spec(3, 3, 1), "x", &["y"])
            .unwrap();

        // A constant image stays constant with clamp-to-edge padding
        let output = model.execute(&[0.5; 9]).unwrap();
        for v in output {
            assert!((v - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_box_blur_zero_padding() {
        let mut layer = box_blur_layer();
        layer.padding = Padding::Zeros;
        let mut model = NativeModel::new(vec![layer]).unwrap();
        model
            .set_input_output(&spec(3, 3, 1), "x", &["y"])
            .unwrap();

        let output = model.execute(&[0.9; 9]).unwrap();
        // Corner sees 4 of 9 samples, centre sees all of them
        assert!((output[0] - 0.4).abs() < 1e-6);
        assert!((output[4] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_activations() {
        assert_eq!(Activation::Relu.apply(-1.0), 0.0);
        assert_eq!(Activation::LeakyRelu.apply(-1.0), -0.2);
        assert_eq!(Activation::Sigmoid.apply(0.0), 0.5);
        assert_eq!(Activation::Tanh.apply(0.0), 0.0);
    }

    #[test]
    fn test_write_read() {
        let model = NativeModel::new(vec![identity_layer(3), identity_layer(3)]).unwrap();
        let mut data = Vec::new();
        model.write(&mut data).unwrap();

        let read = NativeModel::read(&mut data.as_slice()).unwrap();
        assert_eq!(read.layers().len(), 2);
        assert_eq!(read.layers()[1].weights, model.layers()[1].weights);
    }

    #[test]
    fn test_reject_bad_magic() {
        let data = b"ONNX\x01\x00\x00\x00\x00\x00\x00\x00";
        assert!(NativeModel::read(&mut &data[..]).is_err());
    }

    #[test]
    fn test_reject_truncated() {
        let model = NativeModel::new(vec![identity_layer(3)]).unwrap();
        let mut data = Vec::new();
        model.write(&mut data).unwrap();
        data.truncate(data.len() - 2);

        assert!(NativeModel::read(&mut data.as_slice()).is_err());
    }

    #[test]
    fn test_reject_channel_mismatch() {
        let err = NativeModel::new(vec![identity_layer(3), identity_layer(1)]).unwrap_err();
        assert!(err.to_string().contains("produces 3 channels"));
    }

    fn header(version: u32, n_layers: u32) -> Vec<u8> {
        let mut data = MAGIC.to_vec();
        data.write_u32::<LittleEndian>(version).unwrap();
        data.write_u32::<LittleEndian>(n_layers).unwrap();
        data
    }

    fn conv2d_header(data: &mut Vec<u8>, params: [u32; 6]) {
        data.write_u32::<LittleEndian>(LAYER_CONV2D).unwrap();
        for v in params {
            data.write_u32::<LittleEndian>(v).unwrap();
        }
    }

    #[test]
    fn test_reject_unknown_version() {
        let model = NativeModel::new(vec![identity_layer(3)]).unwrap();
        let mut data = Vec::new();
        model.write(&mut data).unwrap();
        data[4..8].copy_from_slice(&2u32.to_le_bytes());

        let err = NativeModel::read(&mut data.as_slice()).unwrap_err();
        assert!(err.to_string().contains("Unsupported model version 2"));
    }

    #[test]
    fn test_reject_unknown_layer_kind() {
        let mut data = header(VERSION, 1);
        data.write_u32::<LittleEndian>(7).unwrap();

        let err = NativeModel::read(&mut data.as_slice()).unwrap_err();
        assert!(err.to_string().contains("Unknown layer type 7"));
    }

    #[test]
    fn test_reject_unknown_activation_and_padding() {
        let mut data = header(VERSION, 1);
        conv2d_header(&mut data, [9, 0, 1, 1, 1, 1]);
        assert!(NativeModel::read(&mut data.as_slice()).is_err());

        let mut data = header(VERSION, 1);
        conv2d_header(&mut data, [0, 5, 1, 1, 1, 1]);
        assert!(NativeModel::read(&mut data.as_slice()).is_err());
    }

    #[test]
    fn test_reject_oversized_layer_header() {
        // Announces 20001 * 20001 weights without providing any of them
        let mut data = header(VERSION, 1);
        conv2d_header(&mut data, [0, 0, 1, 1, 1, 20001]);
        assert_eq!(data.len(), 40);

        let err = NativeModel::read(&mut data.as_slice()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read layer 0"));
    }

    #[test]
    fn test_read_f32s_across_chunks() {
        let count = READ_CHUNK * 2 + 3;
        let mut data = Vec::new();
        for i in 0..count {
            data.write_f32::<LittleEndian>(i as f32).unwrap();
        }

        let values = read_f32s(&mut data.as_slice(), count).unwrap();
        assert_eq!(values.len(), count);
        assert_eq!(values[READ_CHUNK + 1], (READ_CHUNK + 1) as f32);
        assert_eq!(values[count - 1], (count - 1) as f32);

        assert!(read_f32s(&mut &data[..data.len() - 1], count).is_err());
    }

    #[test]
    fn test_binding_rejects_output_channels() {
        let mut layer = identity_layer(3);
        layer.out_channels = 1;
        layer.weights.truncate(3);
        layer.biases.truncate(1);
        let mut model = NativeModel::new(vec![layer]).unwrap();

        let err = model
            .set_input_output(&spec(4, 4, 3), "x", &["y"])
            .unwrap_err();
        assert!(err.to_string().contains("produces 1 output channels"));
        assert!(model.execute(&[0.0; 48]).is_err());
    }

    #[test]
    fn test_binding_checks() {
        let mut model = NativeModel::new(vec![identity_layer(1)]).unwrap();
        assert!(model.set_input_output(&spec(4, 4, 3), "x", &["y"]).is_err());

        let mut model = NativeModel::new(vec![identity_layer(3)]).unwrap();
        assert!(
            model
                .set_input_output(&spec(4, 4, 3), "x", &["y", "z"])
                .is_err()
        );
        assert!(model.execute(&[0.0; 48]).is_err());
    }
}
