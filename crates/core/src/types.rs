//! Core data model for a single pipeline run.
//!
//! [`ProjectContext`] and [`LayerSelection`] are snapshots of host
//! application state taken at the start of a run. They are owned by
//! that run and discarded when it finishes -- the underlying host state
//! may change between runs, so nothing here is ever cached across runs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Snapshot of the host project taken when a run begins.
///
/// `root_path` is the directory containing the saved host document.
/// A document that has never been saved has no root path and cannot be
/// processed (artifact exchange happens under the project root).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub root_path: PathBuf,
    pub composition_name: String,
    /// Frame under the playhead, rounded to the nearest whole frame.
    pub frame_index: u32,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
}

/// The source content layer and the mask region chosen within it.
///
/// Indices are 1-based, matching the host application's layer and mask
/// numbering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSelection {
    pub layer_index: u32,
    pub layer_name: String,
    pub mask_index: u32,
    pub mask_name: String,
    /// Total masks on the layer (all of them participate in export).
    pub mask_count: u32,
}

/// Filesystem paths produced by the host-side export.
///
/// The orchestration core does not create these files; their
/// existence and completeness is eventually-consistent and readers
/// must go through the race-tolerant artifact loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportArtifacts {
    pub image_path: PathBuf,
    pub mask_path: PathBuf,
    pub frame_index: u32,
}

/// Numeric knobs for an inference request.
///
/// Defaults match the service defaults; [`validate`](Self::validate)
/// enforces the documented bounds before a request is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InpaintParams {
    /// Denoising strength, `0.0..=1.0`.
    pub strength: f64,
    /// Classifier-free guidance scale, `>= 0`.
    pub guidance: f64,
    /// Diffusion step count, `> 0`.
    pub steps: u32,
    /// Controlnet conditioning scale, `0.0..=1.0`.
    pub controlnet_scale: f64,
    /// Mask feather radius in pixels.
    pub feather: u32,
    /// Mask expansion in pixels.
    pub expand: u32,
    /// Fixed seed for reproducible output. `None` lets the service pick.
    pub seed: Option<u64>,
    /// Overrides the service's default negative prompt when set.
    pub negative_prompt: Option<String>,
}

impl Default for InpaintParams {
    fn default() -> Self {
        Self {
            strength: 0.85,
            guidance: 7.5,
            steps: 30,
            controlnet_scale: 0.5,
            feather: 0,
            expand: 0,
            seed: None,
            negative_prompt: None,
        }
    }
}

impl InpaintParams {
    /// Check every knob against its documented bound.
    ///
    /// Reports the first violation by knob name; the service re-validates
    /// on its side, this exists so a bad value fails before any host-side
    /// export work is done.
    pub fn validate(&self) -> Result<(), InvalidParams> {
        if !(0.0..=1.0).contains(&self.strength) || !self.strength.is_finite() {
            return Err(InvalidParams::new("strength", self.strength, "0.0..=1.0"));
        }
        if self.guidance < 0.0 || !self.guidance.is_finite() {
            return Err(InvalidParams::new("guidance", self.guidance, ">= 0"));
        }
        if self.steps == 0 {
            return Err(InvalidParams::new("steps", self.steps as f64, "> 0"));
        }
        if !(0.0..=1.0).contains(&self.controlnet_scale) || !self.controlnet_scale.is_finite() {
            return Err(InvalidParams::new(
                "controlnet_scale",
                self.controlnet_scale,
                "0.0..=1.0",
            ));
        }
        Ok(())
    }
}

/// A parameter fell outside its documented bound.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("parameter '{name}' out of range: {value} (expected {expected})")]
pub struct InvalidParams {
    pub name: &'static str,
    pub value: f64,
    pub expected: &'static str,
}

impl InvalidParams {
    fn new(name: &'static str, value: f64, expected: &'static str) -> Self {
        Self {
            name,
            value,
            expected,
        }
    }
}

/// Outcome of a remote inference call, decoded back to raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResult {
    pub result_bytes: Vec<u8>,
    /// The service served a previously computed artifact for an
    /// equivalent request. Surfaced distinctly in logs and events but
    /// handled identically downstream.
    pub cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_are_valid() {
        assert!(InpaintParams::default().validate().is_ok());
    }

    #[test]
    fn strength_out_of_range() {
        let params = InpaintParams {
            strength: 1.5,
            ..Default::default()
        };
        let err = params.validate().unwrap_err();
        assert_eq!(err.name, "strength");
    }

    #[test]
    fn negative_guidance_rejected() {
        let params = InpaintParams {
            guidance: -0.1,
            ..Default::default()
        };
        assert_eq!(params.validate().unwrap_err().name, "guidance");
    }

    #[test]
    fn zero_steps_rejected() {
        let params = InpaintParams {
            steps: 0,
            ..Default::default()
        };
        assert_eq!(params.validate().unwrap_err().name, "steps");
    }

    #[test]
    fn nan_strength_rejected() {
        let params = InpaintParams {
            strength: f64::NAN,
            ..Default::default()
        };
        assert_eq!(params.validate().unwrap_err().name, "strength");
    }
}
