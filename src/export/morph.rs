use log::debug;

use super::serializer::sanitize_id;
use super::types::ColladaMorphController;
use crate::error::ExportError;
use crate::scene::{NodeId, SceneGraph};

/// Resolve one morph deformer into a canonical controller record.
///
/// Target geometry is owned by the geometry exporter; only the id
/// references and blend weights travel through here. Non-finite weights
/// are clamped to zero rather than propagated.
pub(crate) fn export_morph_controller(
    scene: &SceneGraph,
    morph_node: NodeId,
    controller_id: String,
    source_id: String,
) -> Result<ColladaMorphController, ExportError> {
    let deformer =
        scene
            .morph_deformer(morph_node)
            .ok_or_else(|| ExportError::UnresolvedTarget {
                controller: scene.name_of(morph_node),
                reason: "controller node is not a morph deformer".to_string(),
            })?;

    let targets = deformer
        .targets
        .iter()
        .map(|target| {
            let weight = if target.weight.is_finite() {
                target.weight
            } else {
                debug!(
                    "morph target '{}' carries a non-finite weight, clamped to zero",
                    target.geometry_id
                );
                0.0
            };
            (sanitize_id(&target.geometry_id), weight)
        })
        .collect();

    Ok(ColladaMorphController {
        controller_id,
        source_id,
        method: deformer.method,
        targets,
    })
}
