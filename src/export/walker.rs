use std::collections::HashSet;

use log::debug;

use super::types::{
    ControllerMeshItem, ControllerMeshStack, ControllerStack, ControllerStackItem,
};
use crate::error::ExportError;
use crate::scene::{NODE_STATE_PASS_THROUGH, NodeClass, NodeId, SceneGraph};

// ─── Upstream walk ────────────────────────────────────────────────────────────

/// Iterate upstream from a mesh's geometry input, collecting every deformer
/// that affects it.
///
/// Skin deformers open a new stack item; consecutive morph deformers
/// coalesce into the current item. Intermediate meshes met along the chain
/// are forced visible and non-intermediate so their tessellation can be
/// queried, with their original flags recorded in `mesh_stack`. Every
/// deformer's evaluation state is captured into the item before the walk
/// bypasses it.
///
/// Returns `false` when the geometry input has no incoming connection or no
/// controller is found; the stacks are then left unmodified apart from any
/// surfaced meshes. The caller must pair this call with the restore
/// routines on every exit path; `with_controller_stack` does that pairing.
pub(crate) fn find_affected_nodes(
    scene: &mut SceneGraph,
    mesh: NodeId,
    stack: &mut ControllerStack,
    mesh_stack: &mut ControllerMeshStack,
) -> Result<bool, ExportError> {
    let mut visited = HashSet::new();
    visited.insert(mesh);

    let mut current = scene.upstream_of(mesh);
    while let Some(node_id) = current {
        if !visited.insert(node_id) {
            return Err(ExportError::CyclicDeformerChain {
                node_index: node_id.0,
                node_name: scene.name_of(node_id),
            });
        }

        match scene.classify(node_id) {
            NodeClass::Skin => {
                let state = bypass_deformer(scene, node_id);
                match stack.last_mut() {
                    // A run of morphs directly below this skin shares the
                    // item; the skin completes it.
                    Some(top) if !top.is_skin => {
                        top.is_skin = true;
                        top.skin_controller_node = Some(node_id);
                        top.node_states.push(state);
                    }
                    _ => stack.push(ControllerStackItem {
                        is_skin: true,
                        skin_controller_node: Some(node_id),
                        morph_controller_nodes: Vec::new(),
                        node_states: vec![state],
                    }),
                }
                current = scene.upstream_of(node_id);
            }
            NodeClass::Morph => {
                let state = bypass_deformer(scene, node_id);
                match stack.last_mut() {
                    Some(top) if !top.is_skin => {
                        top.morph_controller_nodes.push(node_id);
                        top.node_states.push(state);
                    }
                    _ => stack.push(ControllerStackItem {
                        is_skin: false,
                        skin_controller_node: None,
                        morph_controller_nodes: vec![node_id],
                        node_states: vec![state],
                    }),
                }
                current = scene.upstream_of(node_id);
            }
            NodeClass::Mesh => {
                surface_mesh(scene, node_id, mesh_stack);
                current = scene.upstream_of(node_id);
            }
            // Unknown node kind terminates the chain like an origin mesh.
            NodeClass::Origin => break,
        }
    }

    Ok(!stack.is_empty())
}

/// Capture a deformer's evaluation state and switch it to pass-through so
/// surfaced meshes report undeformed geometry.
fn bypass_deformer(scene: &mut SceneGraph, node_id: NodeId) -> i32 {
    match scene.node_mut(node_id) {
        Some(node) => {
            let state = node.node_state;
            node.node_state = NODE_STATE_PASS_THROUGH;
            state
        }
        None => NODE_STATE_PASS_THROUGH,
    }
}

/// Force a chain mesh visible and non-intermediate, recording its original
/// flags exactly once.
fn surface_mesh(scene: &mut SceneGraph, node_id: NodeId, mesh_stack: &mut ControllerMeshStack) {
    let Some(node) = scene.node_mut(node_id) else {
        return;
    };
    if !node.intermediate && node.visible {
        return;
    }
    mesh_stack.push(ControllerMeshItem {
        mesh: node_id,
        is_intermediate: node.intermediate,
        is_visible: node.visible,
    });
    node.intermediate = false;
    node.visible = true;
}

// ─── Restore pass ─────────────────────────────────────────────────────────────

/// Write every captured evaluation state back to its deformer. Best-effort:
/// a node deleted mid-session is skipped.
pub(crate) fn reset_controller_node_states(scene: &mut SceneGraph, stack: &ControllerStack) {
    for item in stack {
        let nodes = item
            .morph_controller_nodes
            .iter()
            .copied()
            .chain(item.skin_controller_node);
        for (node_id, state) in nodes.zip(item.node_states.iter().copied()) {
            match scene.node_mut(node_id) {
                Some(node) => node.node_state = state,
                None => debug!("state restore skipped, node {node_id} no longer exists"),
            }
        }
    }
}

/// Reinstate the original visibility/intermediate flags of every surfaced
/// mesh. Best-effort like `reset_controller_node_states`.
pub(crate) fn reset_mesh_parameters(scene: &mut SceneGraph, mesh_stack: &ControllerMeshStack) {
    for item in mesh_stack {
        match scene.node_mut(item.mesh) {
            Some(node) => {
                node.intermediate = item.is_intermediate;
                node.visible = item.is_visible;
            }
            None => debug!("mesh restore skipped, node {} no longer exists", item.mesh),
        }
    }
}

// ─── Scoped walk/restore pairing ──────────────────────────────────────────────

/// Run the upstream walk, hand the discovered stack to `f`, and restore all
/// toggled node state afterwards: on normal completion, on the
/// no-controller early return, and on the error path alike. The walk and
/// the restore form one critical section; nothing else may observe the
/// scene in between.
pub(crate) fn with_controller_stack<T>(
    scene: &mut SceneGraph,
    mesh: NodeId,
    f: impl FnOnce(&mut SceneGraph, &ControllerStack) -> Result<T, ExportError>,
) -> Result<Option<T>, ExportError> {
    let mut stack = ControllerStack::new();
    let mut mesh_stack = ControllerMeshStack::new();

    let result = match find_affected_nodes(scene, mesh, &mut stack, &mut mesh_stack) {
        Ok(true) => f(scene, &stack).map(Some),
        Ok(false) => Ok(None),
        Err(err) => Err(err),
    };

    reset_controller_node_states(scene, &stack);
    reset_mesh_parameters(scene, &mesh_stack);

    result
}

/// Follow the geometry-input chain to the connection-free origin mesh.
/// Pure read; returns `None` for dangling chains that never reach a mesh.
pub(crate) fn resolve_base_shape(scene: &SceneGraph, mesh: NodeId) -> Option<NodeId> {
    let mut visited = HashSet::new();
    let mut base = None;
    let mut current = Some(mesh);
    while let Some(node_id) = current {
        if !visited.insert(node_id) {
            return None;
        }
        if scene.mesh(node_id).is_some() {
            base = Some(node_id);
        }
        current = scene.upstream_of(node_id);
    }
    base.filter(|&id| id != mesh || scene.upstream_of(mesh).is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{
        MeshShape, MorphDeformer, MorphMethod, NODE_STATE_NORMAL, SceneNode, SkinDeformer,
        SkinWeights,
    };

    fn mesh_node(name: &str, input: Option<NodeId>) -> SceneNode {
        SceneNode::mesh(
            name,
            MeshShape {
                geometry_id: format!("{name}-geom"),
                vertex_count: 4,
                geometry_input: input,
            },
        )
    }

    fn skin_node(name: &str, input: Option<NodeId>) -> SceneNode {
        SceneNode::skin_deformer(
            name,
            SkinDeformer {
                input,
                output_shapes: Vec::new(),
                influences: Vec::new(),
                bind_shape_matrix: None,
                weights: SkinWeights::Cluster(Vec::new()),
            },
        )
    }

    fn morph_node(name: &str, input: Option<NodeId>) -> SceneNode {
        SceneNode::morph_deformer(
            name,
            MorphDeformer {
                input,
                targets: Vec::new(),
                method: MorphMethod::Normalized,
            },
        )
    }

    #[test]
    fn given_origin_mesh_when_walking_then_no_affected_nodes_are_found() {
        let mut scene = SceneGraph::new();
        let mesh = scene.add_node(mesh_node("shape", None));

        let mut stack = ControllerStack::new();
        let mut mesh_stack = ControllerMeshStack::new();
        let found =
            find_affected_nodes(&mut scene, mesh, &mut stack, &mut mesh_stack).expect("walk");

        assert!(!found);
        assert!(stack.is_empty());
        assert!(mesh_stack.is_empty());
    }

    #[test]
    fn given_stacked_morphs_above_skin_when_walking_then_they_coalesce_into_one_item() {
        // shape <- morph2 <- morph1 <- skin <- origin
        let mut scene = SceneGraph::new();
        let origin = scene.add_node(mesh_node("origShape", None).as_intermediate());
        let skin = scene.add_node(skin_node("skinCluster1", Some(origin)));
        let morph1 = scene.add_node(morph_node("blendShape1", Some(skin)));
        let morph2 = scene.add_node(morph_node("blendShape2", Some(morph1)));
        let mesh = scene.add_node(mesh_node("shape", Some(morph2)));

        let mut stack = ControllerStack::new();
        let mut mesh_stack = ControllerMeshStack::new();
        let found =
            find_affected_nodes(&mut scene, mesh, &mut stack, &mut mesh_stack).expect("walk");

        assert!(found);
        assert_eq!(stack.len(), 1);
        let item = &stack[0];
        assert!(item.is_skin);
        assert_eq!(item.skin_controller_node, Some(skin));
        assert_eq!(item.morph_controller_nodes, vec![morph2, morph1]);
        assert_eq!(item.node_states.len(), 3);

        // All three deformers are bypassed while the stack is open.
        for &node in [morph2, morph1, skin].iter() {
            assert_eq!(
                scene.node(node).expect("deformer").node_state,
                NODE_STATE_PASS_THROUGH
            );
        }
        // The hidden origin shape was surfaced and recorded once.
        assert_eq!(mesh_stack.len(), 1);
        assert_eq!(mesh_stack[0].mesh, origin);
        assert!(scene.node(origin).expect("origin").visible);
        assert!(!scene.node(origin).expect("origin").intermediate);
    }

    #[test]
    fn given_morph_above_separate_skin_item_when_walking_then_two_items_emerge() {
        // shape <- skin <- morph <- origin
        let mut scene = SceneGraph::new();
        let origin = scene.add_node(mesh_node("origShape", None));
        let morph = scene.add_node(morph_node("blendShape1", Some(origin)));
        let skin = scene.add_node(skin_node("skinCluster1", Some(morph)));
        let mesh = scene.add_node(mesh_node("shape", Some(skin)));

        let mut stack = ControllerStack::new();
        let mut mesh_stack = ControllerMeshStack::new();
        let found =
            find_affected_nodes(&mut scene, mesh, &mut stack, &mut mesh_stack).expect("walk");

        assert!(found);
        assert_eq!(stack.len(), 2);
        assert!(stack[0].is_skin);
        assert!(!stack[1].is_skin);
        assert_eq!(stack[1].morph_controller_nodes, vec![morph]);
    }

    #[test]
    fn given_cyclic_chain_when_walking_then_the_session_fails_with_the_node_name() {
        let mut scene = SceneGraph::new();
        let skin = scene.add_node(skin_node("skinCluster1", None));
        let mesh = scene.add_node(mesh_node("shape", Some(skin)));
        if let Some(crate::scene::NodeKind::SkinDeformer(deformer)) =
            scene.node_mut(skin).map(|node| &mut node.kind)
        {
            deformer.input = Some(mesh);
        }

        let mut stack = ControllerStack::new();
        let mut mesh_stack = ControllerMeshStack::new();
        let err = find_affected_nodes(&mut scene, mesh, &mut stack, &mut mesh_stack)
            .expect_err("cycle must be fatal");

        match err {
            ExportError::CyclicDeformerChain { node_name, .. } => {
                assert_eq!(node_name, "shape");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn given_open_stack_when_restoring_then_every_flag_round_trips() {
        let mut scene = SceneGraph::new();
        let origin = scene.add_node(mesh_node("origShape", None).as_intermediate());
        let skin = scene.add_node(skin_node("skinCluster1", Some(origin)));
        let mesh = scene.add_node(mesh_node("shape", Some(skin)));

        let mut stack = ControllerStack::new();
        let mut mesh_stack = ControllerMeshStack::new();
        find_affected_nodes(&mut scene, mesh, &mut stack, &mut mesh_stack).expect("walk");

        reset_controller_node_states(&mut scene, &stack);
        reset_mesh_parameters(&mut scene, &mesh_stack);

        assert_eq!(
            scene.node(skin).expect("skin").node_state,
            NODE_STATE_NORMAL
        );
        let origin_node = scene.node(origin).expect("origin");
        assert!(origin_node.intermediate);
        assert!(!origin_node.visible);
    }

    #[test]
    fn given_node_deleted_mid_session_when_restoring_then_restore_skips_it() {
        let mut scene = SceneGraph::new();
        let origin = scene.add_node(mesh_node("origShape", None).as_intermediate());
        let skin = scene.add_node(skin_node("skinCluster1", Some(origin)));
        let mesh = scene.add_node(mesh_node("shape", Some(skin)));

        let mut stack = ControllerStack::new();
        let mut mesh_stack = ControllerMeshStack::new();
        find_affected_nodes(&mut scene, mesh, &mut stack, &mut mesh_stack).expect("walk");

        scene.remove_node(skin);
        scene.remove_node(origin);

        // Must not panic; both restores silently skip the deleted nodes.
        reset_controller_node_states(&mut scene, &stack);
        reset_mesh_parameters(&mut scene, &mesh_stack);
    }

    #[test]
    fn given_failing_closure_when_scoped_walk_runs_then_state_is_still_restored() {
        let mut scene = SceneGraph::new();
        let origin = scene.add_node(mesh_node("origShape", None).as_intermediate());
        let skin = scene.add_node(skin_node("skinCluster1", Some(origin)));
        let mesh = scene.add_node(mesh_node("shape", Some(skin)));

        let result: Result<Option<()>, _> = with_controller_stack(&mut scene, mesh, |_, _| {
            Err(ExportError::UnresolvedTarget {
                controller: "skinCluster1".to_string(),
                reason: "forced failure".to_string(),
            })
        });

        assert!(result.is_err());
        assert_eq!(
            scene.node(skin).expect("skin").node_state,
            NODE_STATE_NORMAL
        );
        assert!(scene.node(origin).expect("origin").intermediate);
    }

    #[test]
    fn given_deformer_chain_when_resolving_base_shape_then_origin_mesh_is_found() {
        let mut scene = SceneGraph::new();
        let origin = scene.add_node(mesh_node("origShape", None));
        let skin = scene.add_node(skin_node("skinCluster1", Some(origin)));
        let mesh = scene.add_node(mesh_node("shape", Some(skin)));

        assert_eq!(resolve_base_shape(&scene, mesh), Some(origin));
        assert_eq!(resolve_base_shape(&scene, origin), Some(origin));
    }

    #[test]
    fn given_dangling_chain_when_resolving_base_shape_then_none_is_returned() {
        let mut scene = SceneGraph::new();
        let skin = scene.add_node(skin_node("skinCluster1", None));
        let mesh = scene.add_node(mesh_node("shape", Some(skin)));

        assert_eq!(resolve_base_shape(&scene, mesh), None);
    }
}
