//! Command builders and typed wrappers for the host command surface.
//!
//! Command text is a named host function with positional literal
//! arguments. Path arguments always use forward slashes regardless of
//! the platform convention, and interior quotes are escaped.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use retouch_core::{ExportArtifacts, LayerSelection};

use crate::channel::{BridgeChannel, BridgeError};

/// Project snapshot as reported by the host.
///
/// `project_path` is `None` when the host document has never been
/// saved; converting into a [`retouch_core::ProjectContext`] requires a
/// saved document.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectInfo {
    #[serde(rename = "projectPath")]
    pub project_path: Option<String>,
    #[serde(rename = "compName")]
    pub comp_name: String,
    #[serde(rename = "compWidth")]
    pub comp_width: u32,
    #[serde(rename = "compHeight")]
    pub comp_height: u32,
    #[serde(rename = "frameRate")]
    pub frame_rate: f64,
    #[serde(rename = "currentFrame")]
    pub current_frame: u32,
}

impl ProjectInfo {
    /// Build the per-run context. `None` when the document is unsaved.
    pub fn into_context(self) -> Option<retouch_core::ProjectContext> {
        let root = self.project_path?;
        Some(retouch_core::ProjectContext {
            root_path: root.into(),
            composition_name: self.comp_name,
            frame_index: self.current_frame,
            frame_rate: self.frame_rate,
            width: self.comp_width,
            height: self.comp_height,
        })
    }
}

/// Result of importing the inference output as a new host layer.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportedLayer {
    #[serde(rename = "layerName")]
    pub layer_name: String,
    #[serde(rename = "layerIndex")]
    pub layer_index: u32,
}

#[derive(Debug, Deserialize)]
struct SelectionPayload {
    name: String,
    index: u32,
    #[serde(rename = "numMasks")]
    num_masks: u32,
    #[serde(rename = "selectedMaskIndex")]
    selected_mask_index: u32,
    #[serde(rename = "selectedMaskName")]
    selected_mask_name: String,
}

#[derive(Debug, Deserialize)]
struct ExportPayload {
    #[serde(rename = "imagePath")]
    image_path: String,
    #[serde(rename = "maskPath")]
    mask_path: String,
    frame: u32,
}

impl BridgeChannel {
    /// `getProjectInfo()` -- snapshot of the active composition.
    pub async fn project_info(&self) -> Result<ProjectInfo, BridgeError> {
        let command = "getProjectInfo()";
        decode(command, self.call(command).await?)
    }

    /// `getSelectedLayerWithMask()` -- the selected source layer and
    /// the mask chosen on it.
    pub async fn selected_layer_with_mask(&self) -> Result<LayerSelection, BridgeError> {
        let command = "getSelectedLayerWithMask()";
        let payload: SelectionPayload = decode(command, self.call(command).await?)?;
        Ok(LayerSelection {
            layer_index: payload.index,
            layer_name: payload.name,
            mask_index: payload.selected_mask_index,
            mask_name: payload.selected_mask_name,
            mask_count: payload.num_masks,
        })
    }

    /// `exportForInpaint(layerIndex, maskIndex, "outputFolder")` --
    /// asks the host to render the frame and the combined mask to PNG
    /// files under `output_folder`.
    pub async fn export_for_inpaint(
        &self,
        layer_index: u32,
        mask_index: u32,
        output_folder: &Path,
    ) -> Result<ExportArtifacts, BridgeError> {
        let command = format!(
            "exportForInpaint({}, {}, \"{}\")",
            layer_index,
            mask_index,
            script_path(output_folder),
        );
        let payload: ExportPayload = decode(&command, self.call(&command).await?)?;
        Ok(ExportArtifacts {
            image_path: payload.image_path.into(),
            mask_path: payload.mask_path.into(),
            frame_index: payload.frame,
        })
    }

    /// `importResultAsLayer("path", anchorLayerIndex, "name")` --
    /// imports the saved result and positions it relative to the
    /// anchor layer.
    pub async fn import_result_as_layer(
        &self,
        path: &Path,
        anchor_layer_index: u32,
        name: &str,
    ) -> Result<ImportedLayer, BridgeError> {
        let command = format!(
            "importResultAsLayer(\"{}\", {}, \"{}\")",
            script_path(path),
            anchor_layer_index,
            escape_quotes(name),
        );
        decode(&command, self.call(&command).await?)
    }

    /// `testJSXLoaded()` -- diagnostic probe. The raw value is returned
    /// as-is; a bare scalar is a legitimate result here.
    pub async fn probe(&self) -> Result<Value, BridgeError> {
        self.call("testJSXLoaded()").await
    }
}

/// Render a path as a host script literal: forward slashes always,
/// interior quotes escaped.
fn script_path(path: &Path) -> String {
    escape_quotes(&path.to_string_lossy().replace('\\', "/"))
}

fn escape_quotes(text: &str) -> String {
    text.replace('"', "\\\"")
}

/// Decode the payload of a data-bearing command.
///
/// An opaque scalar here means the host function did not run as a
/// function call at all (see `classify`); it is never silent success.
fn decode<T: DeserializeOwned>(command: &str, value: Value) -> Result<T, BridgeError> {
    if let Value::String(raw) = &value {
        return Err(BridgeError::UnexpectedPayload {
            command: command.to_string(),
            detail: format!("non-JSON result: {raw:?}"),
        });
    }
    serde_json::from_value(value).map_err(|e| BridgeError::UnexpectedPayload {
        command: command.to_string(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Host fake replying from a canned script -> result table and
    /// recording every command it receives.
    struct CannedHost {
        replies: Vec<(&'static str, String)>,
        seen: Mutex<Vec<String>>,
    }

    impl CannedHost {
        fn new(replies: Vec<(&'static str, String)>) -> Self {
            Self {
                replies,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl crate::ScriptHost for CannedHost {
        async fn eval(&self, script: &str) -> String {
            self.seen.lock().unwrap().push(script.to_string());
            self.replies
                .iter()
                .find(|(prefix, _)| script.starts_with(prefix))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_else(|| "EvalScript error.".to_string())
        }
    }

    fn channel(replies: Vec<(&'static str, String)>) -> (BridgeChannel, Arc<CannedHost>) {
        let host = Arc::new(CannedHost::new(replies));
        (BridgeChannel::new(host.clone()), host)
    }

    #[tokio::test]
    async fn project_info_decodes_host_payload() {
        let (bridge, _) = channel(vec![(
            "getProjectInfo",
            r#"{"projectPath":"/work/demo","compName":"Main","compWidth":1920,"compHeight":1080,"currentTime":1.0,"frameRate":24.0,"currentFrame":24}"#.to_string(),
        )]);
        let info = bridge.project_info().await.unwrap();
        assert_eq!(info.comp_name, "Main");
        let ctx = info.into_context().unwrap();
        assert_eq!(ctx.frame_index, 24);
        assert_eq!(ctx.root_path, std::path::PathBuf::from("/work/demo"));
    }

    #[tokio::test]
    async fn unsaved_project_has_no_context() {
        let (bridge, _) = channel(vec![(
            "getProjectInfo",
            r#"{"projectPath":null,"compName":"Main","compWidth":10,"compHeight":10,"frameRate":24.0,"currentFrame":0}"#.to_string(),
        )]);
        let info = bridge.project_info().await.unwrap();
        assert!(info.into_context().is_none());
    }

    #[tokio::test]
    async fn selection_maps_to_core_type() {
        let (bridge, _) = channel(vec![(
            "getSelectedLayerWithMask",
            r#"{"name":"Plate","index":2,"width":1920,"height":1080,"numMasks":3,"selectedMaskIndex":1,"selectedMaskName":"Mask 1"}"#.to_string(),
        )]);
        let sel = bridge.selected_layer_with_mask().await.unwrap();
        assert_eq!(sel.layer_index, 2);
        assert_eq!(sel.mask_index, 1);
        assert_eq!(sel.mask_count, 3);
        assert_eq!(sel.mask_name, "Mask 1");
    }

    #[tokio::test]
    async fn export_command_uses_forward_slashes() {
        let (bridge, host) = channel(vec![(
            "exportForInpaint",
            r#"{"success":true,"imagePath":"/p/_AI_CACHE/a_image.png","maskPath":"/p/_AI_CACHE/a_mask.png","frame":7,"compName":"a"}"#.to_string(),
        )]);
        let artifacts = bridge
            .export_for_inpaint(2, 1, Path::new(r"C:\work\demo\_AI_CACHE"))
            .await
            .unwrap();
        assert_eq!(artifacts.frame_index, 7);

        let seen = host.seen.lock().unwrap();
        assert_eq!(
            seen[0],
            "exportForInpaint(2, 1, \"C:/work/demo/_AI_CACHE\")",
        );
    }

    #[tokio::test]
    async fn import_escapes_layer_name_quotes() {
        let (bridge, host) = channel(vec![(
            "importResultAsLayer",
            r#"{"success":true,"layerName":"Inpaint Result","layerIndex":1}"#.to_string(),
        )]);
        bridge
            .import_result_as_layer(Path::new("/p/_AI_OUT/r.png"), 2, "the \"fix\"")
            .await
            .unwrap();

        let seen = host.seen.lock().unwrap();
        assert_eq!(
            seen[0],
            "importResultAsLayer(\"/p/_AI_OUT/r.png\", 2, \"the \\\"fix\\\"\")",
        );
    }

    #[tokio::test]
    async fn remote_error_surfaces_verbatim() {
        let (bridge, _) = channel(vec![(
            "getSelectedLayerWithMask",
            r#"{"error":"No layer selected"}"#.to_string(),
        )]);
        let err = bridge.selected_layer_with_mask().await.unwrap_err();
        assert_eq!(err, BridgeError::Remote("No layer selected".to_string()));
    }

    #[tokio::test]
    async fn data_bearing_command_rejects_opaque_payload() {
        let (bridge, _) = channel(vec![("getProjectInfo", "ok".to_string())]);
        assert_matches!(
            bridge.project_info().await,
            Err(BridgeError::UnexpectedPayload { .. })
        );
    }

    #[tokio::test]
    async fn probe_accepts_opaque_payload() {
        let (bridge, _) = channel(vec![("testJSXLoaded", "ready".to_string())]);
        assert_eq!(bridge.probe().await.unwrap(), Value::String("ready".into()));
    }

    #[tokio::test]
    async fn engine_failure_for_unknown_command() {
        let (bridge, _) = channel(vec![]);
        assert_matches!(bridge.probe().await, Err(BridgeError::EngineFailure));
    }
}
