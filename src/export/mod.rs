mod diagnostic;
mod morph;
mod serializer;
mod skin;
mod types;
mod validation;
mod walker;

use std::collections::HashMap;

use log::warn;

// Re-export public types for callers of this module.
pub use diagnostic::{
    ControllerDiagnostic, ExportDiagnosticLog, MorphDiagnostic, diagnostic_log_path_for_output,
    write_diagnostic_log,
};
pub use types::{
    ColladaMorphController, ColladaSkinController, ControllerInstance, ControllerMeshItem,
    ControllerMeshStack, ControllerStack, ControllerStackItem, ExportIssue, ExportOptions,
    ExportReport, Severity, VertexInfluence, WEIGHT_TOLERANCE,
};

use crate::error::ExportError;
use crate::scene::{NodeId, SceneGraph};
use serializer::sanitize_id;

// ─── Public API ───────────────────────────────────────────────────────────────

/// Everything one controller-export session produces: the canonical
/// records, the instance-binding glue for the scene-graph phase, and the
/// session report.
#[derive(Debug, Clone)]
pub struct ControllerExport {
    pub skin_controllers: Vec<ColladaSkinController>,
    pub morph_controllers: Vec<ColladaMorphController>,
    pub instances: Vec<ControllerInstance>,
    pub report: ExportReport,
}

impl ControllerExport {
    /// The controller library as document text. Deterministic: repeated
    /// calls on the same export produce identical output.
    pub fn library_controllers_xml(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = serializer::write_library_controllers(
            &mut out,
            &self.skin_controllers,
            &self.morph_controllers,
        );
        out
    }

    pub fn diagnostic_log(&self) -> ExportDiagnosticLog {
        diagnostic::build_diagnostic_log(self)
    }
}

/// Binding element text for one controller instance.
pub fn instance_controller_xml(instance: &ControllerInstance) -> String {
    let mut out = String::new();
    let _ = serializer::write_instance_controller(&mut out, instance);
    out
}

/// Export every controller in the scene.
///
/// Walks the transform hierarchy depth-first, discovers the deformer chain
/// above each rendered mesh, extracts canonical controller records, and
/// restores all toggled node state before returning, also when the
/// session fails. Per-controller problems are contained as report issues;
/// only a corrupt scene graph (cyclic deformer chain) is fatal.
pub fn export_controllers(
    scene: &mut SceneGraph,
    options: &ExportOptions,
) -> Result<ControllerExport, ExportError> {
    let mut session = ExportSession::new(*options, scene.parent_index_map());
    session.issues.extend(validation::validate_scene(scene));

    let mut path = Vec::new();
    for root in scene.roots().to_vec() {
        session.export_element(scene, root, None, &mut path)?;
    }

    Ok(session.finish())
}

// ─── Session state ────────────────────────────────────────────────────────────

/// Per-session caches and accumulators. Created at session start, consumed
/// by `finish`; nothing survives across sessions.
struct ExportSession {
    options: ExportOptions,
    parent_map: HashMap<NodeId, NodeId>,
    /// (controller node, cluster index) -> index into `skin_controllers`.
    skin_cache: HashMap<(NodeId, usize), usize>,
    /// morph node -> index into `morph_controllers`.
    morph_cache: HashMap<NodeId, usize>,
    /// Ids already claimed by written controllers.
    exported_controller_ids: Vec<String>,
    skin_controllers: Vec<ColladaSkinController>,
    morph_controllers: Vec<ColladaMorphController>,
    instances: Vec<ControllerInstance>,
    issues: Vec<ExportIssue>,
}

impl ExportSession {
    fn new(options: ExportOptions, parent_map: HashMap<NodeId, NodeId>) -> Self {
        Self {
            options,
            parent_map,
            skin_cache: HashMap::new(),
            morph_cache: HashMap::new(),
            exported_controller_ids: Vec::new(),
            skin_controllers: Vec::new(),
            morph_controllers: Vec::new(),
            instances: Vec::new(),
            issues: Vec::new(),
        }
    }

    fn finish(self) -> ControllerExport {
        let report = ExportReport {
            skin_controller_count: self.skin_controllers.len(),
            morph_controller_count: self.morph_controllers.len(),
            instance_count: self.instances.len(),
            issues: self.issues,
        };
        ControllerExport {
            skin_controllers: self.skin_controllers,
            morph_controllers: self.morph_controllers,
            instances: self.instances,
            report,
        }
    }

    fn issue(&mut self, severity: Severity, code: &str, message: String) {
        self.issues.push(ExportIssue::new(severity, code, message));
    }

    // ── Scene recursion ──────────────────────────────────────────────────

    /// Visit one element occurrence and recurse into its children. `path`
    /// holds the current ancestor chain; a child already on it would make
    /// the hierarchy cyclic and is skipped rather than recursed forever.
    fn export_element(
        &mut self,
        scene: &mut SceneGraph,
        element: NodeId,
        parent: Option<NodeId>,
        path: &mut Vec<NodeId>,
    ) -> Result<(), ExportError> {
        if path.contains(&element) {
            self.issue(
                Severity::Warning,
                "HIERARCHY_CYCLE",
                format!(
                    "element '{}' is its own ancestor, subtree skipped",
                    scene.name_of(element)
                ),
            );
            return Ok(());
        }

        if scene.has_controller(element) {
            self.export_mesh_controllers(scene, element, parent)?;
        }

        path.push(element);
        let children = scene
            .node(element)
            .map(|node| node.children.clone())
            .unwrap_or_default();
        for child in children {
            self.export_element(scene, child, Some(element), path)?;
        }
        path.pop();
        Ok(())
    }

    /// Walk the deformer chain above one rendered mesh and export it. The
    /// walk and the restore are paired by `with_controller_stack`; state is
    /// reinstated on every exit path.
    fn export_mesh_controllers(
        &mut self,
        scene: &mut SceneGraph,
        mesh: NodeId,
        parent: Option<NodeId>,
    ) -> Result<(), ExportError> {
        let scene_element = parent.unwrap_or(mesh);

        let outcome = walker::with_controller_stack(scene, mesh, |scene, stack| {
            self.export_controller_stack(scene, mesh, stack)
        })?;

        if let Some(Some((controller_id, target_id, skeleton_roots))) = outcome {
            self.instances.push(ControllerInstance {
                scene_node: scene_element,
                controller_id,
                target_id,
                skeleton_roots,
            });
        }
        Ok(())
    }

    // ── Stack export ─────────────────────────────────────────────────────

    /// Export every deformer of one discovered stack, origin-side first so
    /// each controller's `source` can reference the one below it. Returns
    /// the chain head id, the rendered geometry id, and the skeleton roots
    /// collected along the way, or `None` when nothing was exported.
    fn export_controller_stack(
        &mut self,
        scene: &SceneGraph,
        mesh: NodeId,
        stack: &ControllerStack,
    ) -> Result<Option<(String, String, Vec<String>)>, ExportError> {
        let Some(mesh_shape) = scene.mesh(mesh) else {
            return Ok(None);
        };
        let target_id = sanitize_id(&mesh_shape.geometry_id);

        let base_geometry_id = walker::resolve_base_shape(scene, mesh)
            .and_then(|base| scene.mesh(base))
            .map(|base| sanitize_id(&base.geometry_id));
        let Some(base_geometry_id) = base_geometry_id else {
            warn!(
                "controller chain above '{}' never reaches a base shape, skipped",
                scene.name_of(mesh)
            );
            self.issue(
                Severity::Warning,
                "UNRESOLVED_TARGET",
                format!(
                    "controller chain above '{}' never reaches a base shape",
                    scene.name_of(mesh)
                ),
            );
            return Ok(None);
        };

        let mut chain_source = base_geometry_id;
        let mut skeleton_roots = Vec::new();
        let mut exported_any = false;

        for item in stack.iter().rev() {
            if item.is_skin
                && self.options.export_skins
                && let Some(skin_node) = item.skin_controller_node
            {
                match self.export_skin_item(scene, skin_node, mesh, &chain_source) {
                    Ok((controller_id, skeleton_root)) => {
                        chain_source = controller_id;
                        exported_any = true;
                        if let Some(root) = skeleton_root {
                            skeleton_roots.push(root);
                        }
                    }
                    Err(ExportError::UnresolvedTarget { controller, reason }) => {
                        warn!("skin controller '{controller}' skipped: {reason}");
                        self.issue(
                            Severity::Warning,
                            "UNRESOLVED_TARGET",
                            format!("skin controller '{controller}' skipped: {reason}"),
                        );
                    }
                    Err(fatal) => return Err(fatal),
                }
            }

            if self.options.export_morphs {
                for &morph_node in item.morph_controller_nodes.iter().rev() {
                    match self.export_morph_item(scene, morph_node, &chain_source) {
                        Ok(controller_id) => {
                            chain_source = controller_id;
                            exported_any = true;
                        }
                        Err(ExportError::UnresolvedTarget { controller, reason }) => {
                            warn!("morph controller '{controller}' skipped: {reason}");
                            self.issue(
                                Severity::Warning,
                                "UNRESOLVED_TARGET",
                                format!("morph controller '{controller}' skipped: {reason}"),
                            );
                        }
                        Err(fatal) => return Err(fatal),
                    }
                }
            }
        }

        if exported_any {
            Ok(Some((chain_source, target_id, skeleton_roots)))
        } else {
            Ok(None)
        }
    }

    /// Export one skin deformer for one driven shape, or return the cached
    /// record's id when this (deformer, instance) pair was already done.
    fn export_skin_item(
        &mut self,
        scene: &SceneGraph,
        skin_node: NodeId,
        output_shape: NodeId,
        source_id: &str,
    ) -> Result<(String, Option<String>), ExportError> {
        let cluster_index = scene
            .skin_deformer(skin_node)
            .and_then(|deformer| {
                deformer
                    .output_shapes
                    .iter()
                    .position(|&shape| shape == output_shape)
            })
            .ok_or_else(|| ExportError::UnresolvedTarget {
                controller: scene.name_of(skin_node),
                reason: format!(
                    "deformer does not drive shape '{}'",
                    scene.name_of(output_shape)
                ),
            })?;

        if let Some(&index) = self.skin_cache.get(&(skin_node, cluster_index)) {
            let cached = &self.skin_controllers[index];
            return Ok((cached.controller_id.clone(), cached.skeleton_root.clone()));
        }

        let controller_id = self.unique_controller_id(&sanitize_id(&scene.name_of(skin_node)));
        let controller = skin::export_skin_controller(
            scene,
            &self.parent_map,
            skin_node,
            output_shape,
            controller_id.clone(),
            source_id.to_string(),
            &self.options,
        )?;

        self.exported_controller_ids.push(controller_id.clone());
        self.skin_cache
            .insert((skin_node, cluster_index), self.skin_controllers.len());
        let skeleton_root = controller.skeleton_root.clone();
        self.skin_controllers.push(controller);
        Ok((controller_id, skeleton_root))
    }

    /// Export one morph deformer, or return the cached record's id.
    fn export_morph_item(
        &mut self,
        scene: &SceneGraph,
        morph_node: NodeId,
        source_id: &str,
    ) -> Result<String, ExportError> {
        if let Some(&index) = self.morph_cache.get(&morph_node) {
            return Ok(self.morph_controllers[index].controller_id.clone());
        }

        let controller_id = self.unique_controller_id(&sanitize_id(&scene.name_of(morph_node)));
        let controller = morph::export_morph_controller(
            scene,
            morph_node,
            controller_id.clone(),
            source_id.to_string(),
        )?;

        self.exported_controller_ids.push(controller_id.clone());
        self.morph_cache
            .insert(morph_node, self.morph_controllers.len());
        self.morph_controllers.push(controller);
        Ok(controller_id)
    }

    /// First free id derived from `base`. Registration happens only after
    /// the extraction succeeded, so a skipped controller never burns an id.
    fn unique_controller_id(&self, base: &str) -> String {
        if !self
            .exported_controller_ids
            .iter()
            .any(|id| id.as_str() == base)
        {
            return base.to_string();
        }
        let mut counter = 2;
        loop {
            let candidate = format!("{base}-{counter}");
            if !self
                .exported_controller_ids
                .iter()
                .any(|id| id == &candidate)
            {
                return candidate;
            }
            counter += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{
        MeshShape, MorphDeformer, MorphMethod, MorphTarget, NODE_STATE_NORMAL, SceneNode,
        ShapeWeightTable, SkinDeformer, SkinWeights,
    };
    use nalgebra::{Matrix4, Translation3};

    fn mesh_node(name: &str, vertex_count: usize, input: Option<NodeId>) -> SceneNode {
        SceneNode::mesh(
            name,
            MeshShape {
                geometry_id: format!("{name}-geom"),
                vertex_count,
                geometry_input: input,
            },
        )
    }

    /// root transform
    ///   └─ shape  <- skinCluster1 <- origShape (hidden)
    /// with joints hip/knee and vertex 0 weighted 0.7/0.3.
    struct SkinnedScene {
        scene: SceneGraph,
        root: NodeId,
        shape: NodeId,
        skin: NodeId,
        origin: NodeId,
    }

    fn skinned_scene() -> SkinnedScene {
        let mut scene = SceneGraph::new();
        let hip = scene.add_root(SceneNode::joint(
            "hip",
            Translation3::new(0.0, -1.0, 0.0).to_homogeneous(),
        ));
        let knee = scene.add_child(
            hip,
            SceneNode::joint("knee", Translation3::new(0.0, -2.0, 0.0).to_homogeneous()),
        );

        let origin = scene.add_node(mesh_node("origShape", 2, None).as_intermediate());
        let skin = scene.add_node(SceneNode::skin_deformer(
            "skinCluster1",
            SkinDeformer {
                input: Some(origin),
                output_shapes: Vec::new(),
                influences: vec![hip, knee],
                bind_shape_matrix: Some(Matrix4::identity()),
                weights: SkinWeights::Cluster(vec![ShapeWeightTable {
                    vertex_weights: vec![vec![(0, 0.7), (1, 0.3)], vec![(1, 1.0)]],
                }]),
            },
        ));
        let root = scene.add_root(SceneNode::transform("character"));
        let shape = scene.add_child(root, mesh_node("shape", 2, Some(skin)));
        if let Some(crate::scene::NodeKind::SkinDeformer(deformer)) =
            scene.node_mut(skin).map(|node| &mut node.kind)
        {
            deformer.output_shapes.push(shape);
        }
        SkinnedScene {
            scene,
            root,
            shape,
            skin,
            origin,
        }
    }

    #[test]
    fn given_skinned_mesh_when_exporting_then_canonical_record_matches_the_rig() {
        let mut rig = skinned_scene();

        let export =
            export_controllers(&mut rig.scene, &ExportOptions::default()).expect("session");

        assert_eq!(export.skin_controllers.len(), 1);
        let controller = &export.skin_controllers[0];
        assert_eq!(controller.controller_id, "skinCluster1");
        assert_eq!(controller.source_id, "origShape-geom");
        assert_eq!(controller.target_id, "shape-geom");
        assert_eq!(controller.joints.len(), 2);

        let first_vertex = &controller.vertex_influences[0];
        assert_eq!(first_vertex.len(), 2);
        let sum: f32 = first_vertex.iter().map(|influence| influence.weight).sum();
        assert!((sum - 1.0).abs() < 1e-6);

        assert_eq!(export.instances.len(), 1);
        let instance = &export.instances[0];
        assert_eq!(instance.scene_node, rig.root);
        assert_eq!(instance.controller_id, "skinCluster1");
        assert_eq!(instance.skeleton_roots, vec!["hip".to_string()]);

        assert_eq!(export.report.skin_controller_count, 1);
        assert_eq!(export.report.instance_count, 1);
    }

    #[test]
    fn given_finished_session_when_inspecting_scene_then_all_flags_round_tripped() {
        let mut rig = skinned_scene();

        export_controllers(&mut rig.scene, &ExportOptions::default()).expect("session");

        assert_eq!(
            rig.scene.node(rig.skin).expect("skin").node_state,
            NODE_STATE_NORMAL
        );
        let origin = rig.scene.node(rig.origin).expect("origin");
        assert!(origin.intermediate);
        assert!(!origin.visible);
        let shape = rig.scene.node(rig.shape).expect("shape");
        assert!(shape.visible);
        assert!(!shape.intermediate);
    }

    #[test]
    fn given_unmodified_scene_when_exporting_twice_then_output_is_byte_identical() {
        let mut rig = skinned_scene();

        let first = export_controllers(&mut rig.scene, &ExportOptions::default())
            .expect("first session")
            .library_controllers_xml();
        let second = export_controllers(&mut rig.scene, &ExportOptions::default())
            .expect("second session")
            .library_controllers_xml();

        assert_eq!(first, second);
    }

    #[test]
    fn given_instanced_shape_when_exporting_then_sources_are_written_once() {
        let mut rig = skinned_scene();
        // Second occurrence of the same shape under another transform.
        let other = rig.scene.add_root(SceneNode::transform("characterCopy"));
        rig.scene.instance_child(other, rig.shape);

        let export =
            export_controllers(&mut rig.scene, &ExportOptions::default()).expect("session");

        assert_eq!(export.skin_controllers.len(), 1);
        assert_eq!(export.instances.len(), 2);
        assert_eq!(export.instances[0].controller_id, "skinCluster1");
        assert_eq!(export.instances[1].controller_id, "skinCluster1");
        assert_ne!(
            export.instances[0].scene_node,
            export.instances[1].scene_node
        );

        let xml = export.library_controllers_xml();
        assert_eq!(xml.matches(r#"<controller id="skinCluster1">"#).count(), 1);
        assert_eq!(xml.matches("-joints-array").count(), 2); // array + accessor reference
    }

    #[test]
    fn given_morphs_stacked_on_skin_when_exporting_then_chain_links_to_base() {
        // shape <- blendShape2 <- blendShape1 <- skinCluster1 <- origShape
        let mut rig = skinned_scene();
        let morph1 = rig.scene.add_node(SceneNode::morph_deformer(
            "blendShape1",
            MorphDeformer {
                input: Some(rig.skin),
                targets: vec![MorphTarget {
                    geometry_id: "smile-geom".to_string(),
                    weight: 1.0,
                }],
                method: MorphMethod::Normalized,
            },
        ));
        let morph2 = rig.scene.add_node(SceneNode::morph_deformer(
            "blendShape2",
            MorphDeformer {
                input: Some(morph1),
                targets: vec![MorphTarget {
                    geometry_id: "frown-geom".to_string(),
                    weight: 0.0,
                }],
                method: MorphMethod::Normalized,
            },
        ));
        if let Some(crate::scene::NodeKind::Mesh(shape)) =
            rig.scene.node_mut(rig.shape).map(|node| &mut node.kind)
        {
            shape.geometry_input = Some(morph2);
        }

        let export =
            export_controllers(&mut rig.scene, &ExportOptions::default()).expect("session");

        assert_eq!(export.skin_controllers.len(), 1);
        assert_eq!(export.morph_controllers.len(), 2);

        let skin = &export.skin_controllers[0];
        assert_eq!(skin.source_id, "origShape-geom");
        let first_morph = &export.morph_controllers[0];
        assert_eq!(first_morph.controller_id, "blendShape1");
        assert_eq!(first_morph.source_id, "skinCluster1");
        let second_morph = &export.morph_controllers[1];
        assert_eq!(second_morph.controller_id, "blendShape2");
        assert_eq!(second_morph.source_id, "blendShape1");

        assert_eq!(export.instances[0].controller_id, "blendShape2");
    }

    #[test]
    fn given_skins_disabled_when_exporting_then_morphs_still_chain_from_base() {
        let mut rig = skinned_scene();
        let morph = rig.scene.add_node(SceneNode::morph_deformer(
            "blendShape1",
            MorphDeformer {
                input: Some(rig.skin),
                targets: Vec::new(),
                method: MorphMethod::Normalized,
            },
        ));
        if let Some(crate::scene::NodeKind::Mesh(shape)) =
            rig.scene.node_mut(rig.shape).map(|node| &mut node.kind)
        {
            shape.geometry_input = Some(morph);
        }

        let options = ExportOptions {
            export_skins: false,
            ..ExportOptions::default()
        };
        let export = export_controllers(&mut rig.scene, &options).expect("session");

        assert!(export.skin_controllers.is_empty());
        assert_eq!(export.morph_controllers.len(), 1);
        assert_eq!(export.morph_controllers[0].source_id, "origShape-geom");
    }

    #[test]
    fn given_dangling_chain_when_exporting_then_controller_is_skipped_with_issue() {
        let mut scene = SceneGraph::new();
        let skin = scene.add_node(SceneNode::skin_deformer(
            "skinCluster1",
            SkinDeformer {
                input: None, // never reaches a base shape
                output_shapes: Vec::new(),
                influences: Vec::new(),
                bind_shape_matrix: None,
                weights: SkinWeights::Cluster(Vec::new()),
            },
        ));
        let root = scene.add_root(SceneNode::transform("character"));
        let shape = scene.add_child(root, mesh_node("shape", 1, Some(skin)));
        if let Some(crate::scene::NodeKind::SkinDeformer(deformer)) =
            scene.node_mut(skin).map(|node| &mut node.kind)
        {
            deformer.output_shapes.push(shape);
        }

        let export = export_controllers(&mut scene, &ExportOptions::default()).expect("session");

        assert!(export.skin_controllers.is_empty());
        assert!(export.instances.is_empty());
        assert!(
            export
                .report
                .issues
                .iter()
                .any(|issue| issue.code == "UNRESOLVED_TARGET")
        );
        // The failed walk still restored the deformer's state.
        assert_eq!(
            scene.node(skin).expect("skin").node_state,
            NODE_STATE_NORMAL
        );
    }

    #[test]
    fn given_cyclic_deformer_chain_when_exporting_then_session_aborts_restored() {
        let mut rig = skinned_scene();
        // Corrupt the chain: the skin reads from the shape it feeds.
        if let Some(crate::scene::NodeKind::SkinDeformer(deformer)) =
            rig.scene.node_mut(rig.skin).map(|node| &mut node.kind)
        {
            deformer.input = Some(rig.shape);
        }

        let err = export_controllers(&mut rig.scene, &ExportOptions::default())
            .expect_err("cycle must abort the session");

        assert!(matches!(err, ExportError::CyclicDeformerChain { .. }));
        assert_eq!(
            rig.scene.node(rig.skin).expect("skin").node_state,
            NODE_STATE_NORMAL
        );
    }

    #[test]
    fn given_instance_when_rendering_binding_glue_then_url_references_chain_head() {
        let mut rig = skinned_scene();
        let export =
            export_controllers(&mut rig.scene, &ExportOptions::default()).expect("session");

        let xml = instance_controller_xml(&export.instances[0]);
        assert!(xml.contains(r##"<instance_controller url="#skinCluster1">"##));
        assert!(xml.contains("<skeleton>#hip</skeleton>"));
    }

    #[test]
    fn given_export_when_building_diagnostic_log_then_counts_match() {
        let mut rig = skinned_scene();
        let export =
            export_controllers(&mut rig.scene, &ExportOptions::default()).expect("session");

        let log = export.diagnostic_log();
        assert_eq!(log.skin_controller_count, 1);
        assert_eq!(log.instance_count, 1);
        assert_eq!(log.skins[0].joint_count, 2);
        assert_eq!(log.skins[0].vertex_count, 2);
        assert_eq!(log.skins[0].max_influences, 2);
    }
}
