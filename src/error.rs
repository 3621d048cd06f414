// Copyright (C) 2026 The gst-plugin-dnnresidual authors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use crate::BackendType;

/// Coarse classification of [`Error`], used to pick the GStreamer error domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Backend,
    Resource,
    Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Model file for network is not specified")]
    MissingModelPath,

    #[error("Backend {0:?} is not available in this build")]
    BackendUnavailable(BackendType),

    #[error("Model {} has nothing to execute", .path.display())]
    BackendIncomplete { path: PathBuf },

    #[error("Could not load model {}: {:#}", .path.display(), .err)]
    ModelLoadFailed { path: PathBuf, err: anyhow::Error },

    #[error("Could not set input and output for the model: {0:#}")]
    ModelBindingFailed(anyhow::Error),

    #[error("Inference failed: {0:#}")]
    InferenceFailed(anyhow::Error),

    #[error("Could not allocate {size} bytes for plane {plane}")]
    AllocationFailed { plane: usize, size: usize },

    #[error("Unsupported video format {0}")]
    UnsupportedFormat(String),

    #[error("Incorrect number of planes. It should be {expected} but got {actual}")]
    PlaneCountMismatch { expected: usize, actual: usize },

    #[error("Stream is not configured")]
    NotConfigured,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingModelPath => ErrorKind::Configuration,
            Error::BackendUnavailable(_)
            | Error::BackendIncomplete { .. }
            | Error::ModelLoadFailed { .. }
            | Error::ModelBindingFailed(_)
            | Error::InferenceFailed(_) => ErrorKind::Backend,
            Error::AllocationFailed { .. } => ErrorKind::Resource,
            Error::UnsupportedFormat(_)
            | Error::PlaneCountMismatch { .. }
            | Error::NotConfigured => ErrorKind::Format,
        }
    }

    /// Converts into an error message that can be returned from `start()`/`stop()` or posted
    /// on the bus.
    pub fn to_error_message(&self) -> gst::ErrorMessage {
        match self.kind() {
            ErrorKind::Configuration => {
                gst::error_msg!(gst::LibraryError::Settings, ["{}", self])
            }
            ErrorKind::Backend => gst::error_msg!(gst::LibraryError::Init, ["{}", self]),
            ErrorKind::Resource => gst::error_msg!(gst::ResourceError::NoSpaceLeft, ["{}", self]),
            ErrorKind::Format => gst::error_msg!(gst::CoreError::Negotiation, ["{}", self]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(Error::MissingModelPath.kind(), ErrorKind::Configuration);
        assert_eq!(
            Error::BackendUnavailable(BackendType::TensorGraph).kind(),
            ErrorKind::Backend
        );
        assert_eq!(
            Error::AllocationFailed { plane: 0, size: 1 }.kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            Error::PlaneCountMismatch {
                expected: 3,
                actual: 1
            }
            .kind(),
            ErrorKind::Format
        );
    }

    #[test]
    fn test_display() {
        let err = Error::PlaneCountMismatch {
            expected: 3,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "Incorrect number of planes. It should be 3 but got 2"
        );
    }
}
