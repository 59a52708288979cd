use super::types::{ExportIssue, Severity};
use crate::scene::{NodeKind, SceneGraph, SkinWeights};

/// Pre-export scan of every deformer in the scene. Problems found here are
/// contained: the session continues and the affected controller is either
/// skipped (dangling links) or exported in its degenerate-but-valid form.
pub(crate) fn validate_scene(scene: &SceneGraph) -> Vec<ExportIssue> {
    let mut issues = Vec::new();

    for id in scene.node_ids() {
        let Some(node) = scene.node(id) else {
            continue;
        };
        match &node.kind {
            NodeKind::SkinDeformer(deformer) => {
                for &shape in &deformer.output_shapes {
                    if scene.mesh(shape).is_none() {
                        issues.push(ExportIssue::new(
                            Severity::Warning,
                            "DANGLING_OUTPUT_SHAPE",
                            format!(
                                "skin deformer '{}' drives shape {shape} which is missing or not a mesh",
                                node.name
                            ),
                        ));
                    }
                }
                for &influence in &deformer.influences {
                    if scene.node(influence).is_none() {
                        issues.push(ExportIssue::new(
                            Severity::Warning,
                            "MISSING_INFLUENCE",
                            format!(
                                "skin deformer '{}' references deleted influence {influence}",
                                node.name
                            ),
                        ));
                    } else if scene.joint(influence).is_none() {
                        issues.push(ExportIssue::new(
                            Severity::Info,
                            "NON_JOINT_INFLUENCE",
                            format!(
                                "skin deformer '{}' influence '{}' is not a joint",
                                node.name,
                                scene.name_of(influence)
                            ),
                        ));
                    }
                }
                if deformer.influences.is_empty() {
                    issues.push(ExportIssue::new(
                        Severity::Info,
                        "DEGENERATE_SKIN",
                        format!(
                            "skin deformer '{}' has no influences and exports as an empty controller",
                            node.name
                        ),
                    ));
                }
                if let SkinWeights::Cluster(tables) = &deformer.weights {
                    for (cluster_index, table) in tables.iter().enumerate() {
                        let Some(&shape) = deformer.output_shapes.get(cluster_index) else {
                            continue;
                        };
                        let Some(mesh) = scene.mesh(shape) else {
                            continue;
                        };
                        if table.vertex_weights.len() > mesh.vertex_count {
                            issues.push(ExportIssue::new(
                                Severity::Warning,
                                "WEIGHT_TABLE_SIZE_MISMATCH",
                                format!(
                                    "skin deformer '{}' weight table covers {} vertices but shape '{}' has {}",
                                    node.name,
                                    table.vertex_weights.len(),
                                    mesh.geometry_id,
                                    mesh.vertex_count
                                ),
                            ));
                        }
                    }
                }
            }
            NodeKind::MorphDeformer(deformer) => {
                if deformer.targets.is_empty() {
                    issues.push(ExportIssue::new(
                        Severity::Info,
                        "DEGENERATE_MORPH",
                        format!(
                            "morph deformer '{}' has no targets and exports as an empty controller",
                            node.name
                        ),
                    ));
                }
            }
            _ => {}
        }
    }

    issues
}
