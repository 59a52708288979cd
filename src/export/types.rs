use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

use crate::scene::{MorphMethod, NodeId};

/// Weights below this value are treated as zero and dropped.
pub const WEIGHT_TOLERANCE: f32 = 0.001;

// ─── Walk bookkeeping ─────────────────────────────────────────────────────────

/// One visited entry of the upstream deformer walk: a skin deformer and/or
/// the run of morph deformers stacked at this point of the chain, plus the
/// evaluation-state flags captured before the walk bypassed them.
#[derive(Debug, Clone, Default)]
pub struct ControllerStackItem {
    pub is_skin: bool,
    /// Valid iff `is_skin`.
    pub skin_controller_node: Option<NodeId>,
    /// Consecutive morph deformers coalesce here instead of producing one
    /// item each.
    pub morph_controller_nodes: Vec<NodeId>,
    /// Captured state flags, ordered as the item's nodes were discovered:
    /// morph nodes first, then the skin node if the item carries one.
    pub node_states: Vec<i32>,
}

pub type ControllerStack = Vec<ControllerStackItem>;

/// An intermediate mesh surfaced during the walk, with its original flags
/// so the restore pass can reinstate exactly the pre-walk state.
#[derive(Debug, Clone)]
pub struct ControllerMeshItem {
    pub mesh: NodeId,
    pub is_intermediate: bool,
    pub is_visible: bool,
}

pub type ControllerMeshStack = Vec<ControllerMeshItem>;

// ─── Canonical controller records ─────────────────────────────────────────────

/// One weighted joint influence on a vertex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VertexInfluence {
    /// Index into the owning controller's joint list.
    pub joint_index: usize,
    pub weight: f32,
}

/// Canonical skin controller record: the extractor's output and the
/// serializer's input.
#[derive(Debug, Clone)]
pub struct ColladaSkinController {
    pub controller_id: String,
    /// Base geometry or upstream controller this skin reads from, written
    /// as the `<skin source>` reference.
    pub source_id: String,
    /// Document id of the rendered geometry this controller deforms.
    pub target_id: String,
    /// Joint identifiers; order fixes the influence-index meaning for the
    /// whole record.
    pub joints: Vec<String>,
    /// One bind pose per joint, parallel to `joints`.
    pub bind_poses: Vec<Matrix4<f32>>,
    /// Transform applied to the mesh before skinning.
    pub bind_shape_transform: Matrix4<f32>,
    /// Per vertex: the non-trivial influences on that vertex.
    pub vertex_influences: Vec<Vec<VertexInfluence>>,
    /// Topmost joint above the first influence, for instance binding.
    pub skeleton_root: Option<String>,
}

impl ColladaSkinController {
    /// Largest influence count on any single vertex.
    pub fn max_influences(&self) -> usize {
        self.vertex_influences
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
    }
}

/// Canonical morph controller record.
#[derive(Debug, Clone)]
pub struct ColladaMorphController {
    pub controller_id: String,
    /// Base geometry or upstream controller, written as `<morph source>`.
    pub source_id: String,
    pub method: MorphMethod,
    /// Target geometry ids with their current blend weights.
    pub targets: Vec<(String, f32)>,
}

/// Instance-binding glue handed to the scene-graph instance phase: which
/// controller a scene element instances, and where its skeleton starts.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerInstance {
    /// Scene element (parent transform of the shape occurrence) that
    /// instances the controller.
    pub scene_node: NodeId,
    /// Head of the controller chain to instance.
    pub controller_id: String,
    /// Rendered geometry the chain ultimately deforms.
    pub target_id: String,
    pub skeleton_roots: Vec<String>,
}

// ─── Options, issues, report ──────────────────────────────────────────────────

/// Controller-export options shared by every entry point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExportOptions {
    pub export_skins: bool,
    pub export_morphs: bool,
    /// When set, keep only the N heaviest influences per vertex and scale
    /// the kept weights back to the pre-cap sum.
    pub max_influences_per_vertex: Option<usize>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            export_skins: true,
            export_morphs: true,
            max_influences_per_vertex: None,
        }
    }
}

/// Severity level used by export issues.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A single contained problem recorded during a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportIssue {
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

impl ExportIssue {
    pub fn new(severity: Severity, code: &str, message: String) -> Self {
        Self {
            severity,
            code: code.to_string(),
            message,
        }
    }
}

/// Session summary returned alongside the exported controllers.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub skin_controller_count: usize,
    pub morph_controller_count: usize,
    pub instance_count: usize,
    pub issues: Vec<ExportIssue>,
}
