use std::collections::HashMap;

use log::debug;
use nalgebra::Matrix4;

use super::serializer::sanitize_id;
use super::types::{ColladaSkinController, ExportOptions, VertexInfluence, WEIGHT_TOLERANCE};
use crate::error::ExportError;
use crate::scene::{NodeId, SceneGraph, SkinDeformer, SkinWeights};

// ─── Extraction entry point ───────────────────────────────────────────────────

/// Resolve one skin deformer and one of its driven shapes into a canonical
/// controller record.
///
/// `source_id` is the geometry (or upstream controller) the skin reads
/// from; `controller_id` must already be unique within the session.
pub(crate) fn export_skin_controller(
    scene: &SceneGraph,
    parent_map: &HashMap<NodeId, NodeId>,
    controller_node: NodeId,
    output_shape: NodeId,
    controller_id: String,
    source_id: String,
    options: &ExportOptions,
) -> Result<ColladaSkinController, ExportError> {
    let controller_name = scene.name_of(controller_node);
    let deformer =
        scene
            .skin_deformer(controller_node)
            .ok_or_else(|| ExportError::UnresolvedTarget {
                controller: controller_name.clone(),
                reason: "controller node is not a skin deformer".to_string(),
            })?;

    let mesh = scene
        .mesh(output_shape)
        .ok_or_else(|| ExportError::UnresolvedTarget {
            controller: controller_name.clone(),
            reason: format!(
                "output shape '{}' could not be resolved",
                scene.name_of(output_shape)
            ),
        })?;

    let cluster_index = retrieve_instance_index(deformer, output_shape).ok_or_else(|| {
        ExportError::UnresolvedTarget {
            controller: controller_name.clone(),
            reason: format!(
                "deformer does not drive shape '{}'",
                scene.name_of(output_shape)
            ),
        }
    })?;

    let bind_shape_transform = bind_shape_transform(scene, deformer, output_shape);
    let (joints, bind_poses) = gather_joints(scene, deformer);

    let mut vertex_influences =
        collect_vertex_weights(deformer, cluster_index, mesh.vertex_count, joints.len());
    if let Some(cap) = options.max_influences_per_vertex {
        for influences in &mut vertex_influences {
            cap_influences(influences, cap);
        }
    }

    Ok(ColladaSkinController {
        controller_id,
        source_id,
        target_id: mesh.geometry_id.clone(),
        skeleton_root: resolve_skeleton_root(scene, parent_map, deformer),
        joints,
        bind_poses,
        bind_shape_transform,
        vertex_influences,
    })
}

// ─── Instance resolution ──────────────────────────────────────────────────────

/// Cluster index of the driven shape within a multi-output deformer.
fn retrieve_instance_index(deformer: &SkinDeformer, output_shape: NodeId) -> Option<usize> {
    deformer
        .output_shapes
        .iter()
        .position(|&shape| shape == output_shape)
}

// ─── Bind shape ───────────────────────────────────────────────────────────────

/// Explicit pre-bind transform, or, for joint-cluster pipelines that lack
/// one, the accumulated transform of the driven shape.
fn bind_shape_transform(
    scene: &SceneGraph,
    deformer: &SkinDeformer,
    output_shape: NodeId,
) -> Matrix4<f32> {
    match deformer.bind_shape_matrix {
        Some(matrix) => matrix,
        None => scene
            .node(output_shape)
            .map(|node| node.world_transform)
            .unwrap_or_else(Matrix4::identity),
    }
}

// ─── Joint gathering ──────────────────────────────────────────────────────────

/// Influence names and bind poses in the deformer's reported order. The
/// order is the canonical joint-index space; a missing or non-joint
/// influence keeps its slot (with an inverse-world fallback pose) so that
/// weight indices stay valid.
fn gather_joints(scene: &SceneGraph, deformer: &SkinDeformer) -> (Vec<String>, Vec<Matrix4<f32>>) {
    let mut joints = Vec::with_capacity(deformer.influences.len());
    let mut bind_poses = Vec::with_capacity(deformer.influences.len());

    for &influence in &deformer.influences {
        joints.push(sanitize_id(&scene.name_of(influence)));
        let bind_pose = match scene.joint(influence) {
            Some(joint) => joint.world_inverse_bind,
            None => {
                debug!(
                    "influence '{}' is not a joint, using inverse world transform",
                    scene.name_of(influence)
                );
                scene
                    .node(influence)
                    .and_then(|node| node.world_transform.try_inverse())
                    .unwrap_or_else(Matrix4::identity)
            }
        };
        bind_poses.push(bind_pose);
    }

    (joints, bind_poses)
}

/// Topmost joint above the first influence; the skeleton root handed to the
/// instance-binding phase.
fn resolve_skeleton_root(
    scene: &SceneGraph,
    parent_map: &HashMap<NodeId, NodeId>,
    deformer: &SkinDeformer,
) -> Option<String> {
    let first = deformer.influences.first().copied()?;
    if scene.joint(first).is_none() {
        return None;
    }
    let mut root = first;
    while let Some(&parent) = parent_map.get(&root) {
        if scene.joint(parent).is_none() {
            break;
        }
        root = parent;
    }
    Some(sanitize_id(&scene.name_of(root)))
}

// ─── Weight collection ────────────────────────────────────────────────────────

/// Reconcile either weight-storage kind into one per-vertex pair-list
/// shape. Pairs below tolerance, negative, non-finite, or referencing a
/// slot outside the influence list are dropped here and never propagate.
fn collect_vertex_weights(
    deformer: &SkinDeformer,
    cluster_index: usize,
    vertex_count: usize,
    num_influences: usize,
) -> Vec<Vec<VertexInfluence>> {
    let mut out = vec![Vec::new(); vertex_count];

    match &deformer.weights {
        SkinWeights::Cluster(tables) => {
            let Some(table) = tables.get(cluster_index) else {
                return out;
            };
            if table.vertex_weights.len() > vertex_count {
                debug!(
                    "weight table covers {} vertices but shape has {}, extra rows dropped",
                    table.vertex_weights.len(),
                    vertex_count
                );
            }
            for (vertex, pairs) in table.vertex_weights.iter().take(vertex_count).enumerate() {
                for &(joint_index, weight) in pairs {
                    push_influence(&mut out[vertex], joint_index, weight, num_influences);
                }
            }
        }
        SkinWeights::JointClusters(filters) => {
            for (joint_index, filter) in filters.iter().enumerate() {
                let Some(membership) = filter.memberships.get(cluster_index) else {
                    continue;
                };
                for (&vertex, &weight) in membership.vertices.iter().zip(&membership.weights) {
                    if vertex >= vertex_count {
                        debug!("cluster member {vertex} outside shape, dropped");
                        continue;
                    }
                    push_influence(&mut out[vertex], joint_index, weight, num_influences);
                }
            }
        }
    }

    out
}

fn push_influence(
    influences: &mut Vec<VertexInfluence>,
    joint_index: usize,
    weight: f32,
    num_influences: usize,
) {
    if joint_index >= num_influences {
        debug!("weight pair references joint slot {joint_index} outside the joint list, dropped");
        return;
    }
    if !weight.is_finite() || weight < WEIGHT_TOLERANCE {
        return;
    }
    influences.push(VertexInfluence { joint_index, weight });
}

/// Keep the `cap` heaviest influences and scale the kept weights back to
/// the pre-cap sum, so the vertex's overall deformation amount survives
/// the truncation.
fn cap_influences(influences: &mut Vec<VertexInfluence>, cap: usize) {
    if influences.len() <= cap {
        return;
    }
    influences.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let total: f32 = influences.iter().map(|influence| influence.weight).sum();
    influences.truncate(cap);
    let kept: f32 = influences.iter().map(|influence| influence.weight).sum();
    if kept > f32::EPSILON {
        let scale = total / kept;
        for influence in influences.iter_mut() {
            influence.weight *= scale;
        }
    }
}
