//! Helpers for the `/history/{prompt_id}` response.

use crate::api::ArtifactRef;

/// Collect the finished output-image descriptors for a prompt from a
/// history response.
///
/// The history maps `prompt_id -> {"outputs": {node_id: {"images":
/// [{filename, subfolder, type}, ...]}}}`; only entries with
/// `type == "output"` are real artifacts (the rest are previews and
/// temporaries).
pub fn output_artifacts(history: &serde_json::Value, prompt_id: &str) -> Vec<ArtifactRef> {
    let mut artifacts = Vec::new();

    let Some(outputs) = history
        .get(prompt_id)
        .and_then(|entry| entry.get("outputs"))
        .and_then(|outputs| outputs.as_object())
    else {
        return artifacts;
    };

    for node_output in outputs.values() {
        let Some(images) = node_output.get("images").and_then(|i| i.as_array()) else {
            continue;
        };
        for image in images {
            if image.get("type").and_then(|t| t.as_str()) != Some("output") {
                continue;
            }
            match serde_json::from_value::<ArtifactRef>(image.clone()) {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed image entry in history");
                }
            }
        }
    }

    artifacts
}
