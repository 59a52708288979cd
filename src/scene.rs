use std::collections::HashMap;

use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

// ─── Node handles and state flags ─────────────────────────────────────────────

/// Stable handle to a node in the scene arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deformer evaluates normally.
pub const NODE_STATE_NORMAL: i32 = 0;
/// Deformer is bypassed; downstream shapes observe its input geometry.
pub const NODE_STATE_PASS_THROUGH: i32 = 1;

// ─── Node kinds ───────────────────────────────────────────────────────────────

/// Tagged node payload. The exporter dispatches on this tag rather than on
/// per-node capability queries.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Grouping/transform node with no attached data.
    Transform,
    Joint(Joint),
    Mesh(MeshShape),
    SkinDeformer(SkinDeformer),
    MorphDeformer(MorphDeformer),
}

/// Coarse classification used by the upstream walker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeClass {
    Skin,
    Morph,
    Mesh,
    /// Anything that terminates an upstream walk: transforms, joints,
    /// missing nodes.
    Origin,
}

#[derive(Debug, Clone)]
pub struct Joint {
    /// World-inverse transform captured at bind time (the bind pose).
    pub world_inverse_bind: Matrix4<f32>,
}

#[derive(Debug, Clone)]
pub struct MeshShape {
    /// Document id of the geometry this shape tessellates to.
    pub geometry_id: String,
    pub vertex_count: usize,
    /// Upstream producer connected to the geometry input, if any.
    pub geometry_input: Option<NodeId>,
}

/// Blend method of a morph deformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MorphMethod {
    Normalized,
    Relative,
}

#[derive(Debug, Clone)]
pub struct MorphTarget {
    /// Document id of the target geometry. Target geometry itself is owned
    /// by the geometry exporter; only the reference travels through here.
    pub geometry_id: String,
    pub weight: f32,
}

#[derive(Debug, Clone)]
pub struct MorphDeformer {
    /// Upstream producer on the deformer's geometry input.
    pub input: Option<NodeId>,
    pub targets: Vec<MorphTarget>,
    pub method: MorphMethod,
}

/// Per-vertex weight storage of a skin deformer.
///
/// The two variants mirror the two skinning pipelines a host scene graph can
/// hand us: a cluster deformer carrying one full weight table per driven
/// shape, or a chain of per-joint weight filters. The extractor reconciles
/// both into the same per-vertex pair-list shape.
#[derive(Debug, Clone)]
pub enum SkinWeights {
    /// Per driven shape, per vertex: `(influence_index, weight)` pairs.
    Cluster(Vec<ShapeWeightTable>),
    /// One filter per influence, parallel to `SkinDeformer::influences`.
    JointClusters(Vec<JointClusterFilter>),
}

#[derive(Debug, Clone, Default)]
pub struct ShapeWeightTable {
    pub vertex_weights: Vec<Vec<(usize, f32)>>,
}

#[derive(Debug, Clone, Default)]
pub struct JointClusterFilter {
    /// Per driven shape: membership and parallel weights for this joint.
    pub memberships: Vec<ClusterMembership>,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterMembership {
    pub vertices: Vec<usize>,
    pub weights: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct SkinDeformer {
    /// Upstream producer on the deformer's geometry input.
    pub input: Option<NodeId>,
    /// Shapes driven by this deformer; position in this list is the cluster
    /// index used for weight lookup.
    pub output_shapes: Vec<NodeId>,
    /// Influence objects in the order the host reports them. This order
    /// fixes the joint-index space of everything extracted downstream.
    pub influences: Vec<NodeId>,
    /// Explicit pre-bind transform. Joint-cluster chains usually lack it,
    /// in which case the driven shape's accumulated transform stands in.
    pub bind_shape_matrix: Option<Matrix4<f32>>,
    pub weights: SkinWeights,
}

// ─── Scene nodes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SceneNode {
    pub name: String,
    pub kind: NodeKind,
    pub children: Vec<NodeId>,
    pub world_transform: Matrix4<f32>,
    /// Deformer evaluation state flag; see `NODE_STATE_*`.
    pub node_state: i32,
    pub visible: bool,
    /// Hidden pipeline-internal shape, excluded from rendering.
    pub intermediate: bool,
}

impl SceneNode {
    fn new(name: &str, kind: NodeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            children: Vec::new(),
            world_transform: Matrix4::identity(),
            node_state: NODE_STATE_NORMAL,
            visible: true,
            intermediate: false,
        }
    }

    pub fn transform(name: &str) -> Self {
        Self::new(name, NodeKind::Transform)
    }

    pub fn joint(name: &str, world_inverse_bind: Matrix4<f32>) -> Self {
        Self::new(name, NodeKind::Joint(Joint { world_inverse_bind }))
    }

    pub fn mesh(name: &str, shape: MeshShape) -> Self {
        Self::new(name, NodeKind::Mesh(shape))
    }

    pub fn skin_deformer(name: &str, deformer: SkinDeformer) -> Self {
        Self::new(name, NodeKind::SkinDeformer(deformer))
    }

    pub fn morph_deformer(name: &str, deformer: MorphDeformer) -> Self {
        Self::new(name, NodeKind::MorphDeformer(deformer))
    }

    pub fn with_world_transform(mut self, world_transform: Matrix4<f32>) -> Self {
        self.world_transform = world_transform;
        self
    }

    /// Marks the node as a hidden intermediate pipeline shape.
    pub fn as_intermediate(mut self) -> Self {
        self.intermediate = true;
        self.visible = false;
        self
    }
}

// ─── Scene graph ──────────────────────────────────────────────────────────────

/// In-memory scene graph: an arena of nodes plus the root list of the
/// transform hierarchy. Nodes can be removed mid-session, which leaves a
/// tombstone slot so outstanding handles resolve to `None` instead of
/// aliasing a reused index.
#[derive(Debug, Default)]
pub struct SceneGraph {
    nodes: Vec<Option<SceneNode>>,
    roots: Vec<NodeId>,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: SceneNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    pub fn add_root(&mut self, node: SceneNode) -> NodeId {
        let id = self.add_node(node);
        self.roots.push(id);
        id
    }

    pub fn add_child(&mut self, parent: NodeId, node: SceneNode) -> NodeId {
        let id = self.add_node(node);
        if let Some(parent_node) = self.node_mut(parent) {
            parent_node.children.push(id);
        }
        id
    }

    /// Attaches an existing node under an additional parent (DAG
    /// instancing: the same shape reachable through several paths).
    pub fn instance_child(&mut self, parent: NodeId, child: NodeId) {
        if let Some(parent_node) = self.node_mut(parent) {
            parent_node.children.push(child);
        }
    }

    pub fn remove_node(&mut self, id: NodeId) {
        if let Some(slot) = self.nodes.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&SceneNode> {
        self.nodes.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut SceneNode> {
        self.nodes.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Iterator over every live node id.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|_| NodeId(index as u32)))
    }

    /// Node name, or a placeholder for deleted nodes.
    pub fn name_of(&self, id: NodeId) -> String {
        self.node(id)
            .map(|node| node.name.clone())
            .unwrap_or_else(|| format!("node{}", id.0))
    }

    pub fn classify(&self, id: NodeId) -> NodeClass {
        match self.node(id).map(|node| &node.kind) {
            Some(NodeKind::SkinDeformer(_)) => NodeClass::Skin,
            Some(NodeKind::MorphDeformer(_)) => NodeClass::Morph,
            Some(NodeKind::Mesh(_)) => NodeClass::Mesh,
            _ => NodeClass::Origin,
        }
    }

    pub fn mesh(&self, id: NodeId) -> Option<&MeshShape> {
        match self.node(id).map(|node| &node.kind) {
            Some(NodeKind::Mesh(shape)) => Some(shape),
            _ => None,
        }
    }

    pub fn joint(&self, id: NodeId) -> Option<&Joint> {
        match self.node(id).map(|node| &node.kind) {
            Some(NodeKind::Joint(joint)) => Some(joint),
            _ => None,
        }
    }

    pub fn skin_deformer(&self, id: NodeId) -> Option<&SkinDeformer> {
        match self.node(id).map(|node| &node.kind) {
            Some(NodeKind::SkinDeformer(deformer)) => Some(deformer),
            _ => None,
        }
    }

    pub fn morph_deformer(&self, id: NodeId) -> Option<&MorphDeformer> {
        match self.node(id).map(|node| &node.kind) {
            Some(NodeKind::MorphDeformer(deformer)) => Some(deformer),
            _ => None,
        }
    }

    /// Producer connected upstream of a node's geometry input.
    pub fn upstream_of(&self, id: NodeId) -> Option<NodeId> {
        match self.node(id).map(|node| &node.kind) {
            Some(NodeKind::Mesh(shape)) => shape.geometry_input,
            Some(NodeKind::SkinDeformer(deformer)) => deformer.input,
            Some(NodeKind::MorphDeformer(deformer)) => deformer.input,
            _ => None,
        }
    }

    /// True if `id` is a mesh shape with at least one skin deformer in its
    /// upstream chain.
    pub fn has_skin_controller(&self, id: NodeId) -> bool {
        self.upstream_chain_contains(id, NodeClass::Skin)
    }

    /// True if `id` is a mesh shape with at least one morph deformer in its
    /// upstream chain.
    pub fn has_morph_controller(&self, id: NodeId) -> bool {
        self.upstream_chain_contains(id, NodeClass::Morph)
    }

    /// True if `id` is a mesh shape with any deformation controller
    /// upstream.
    pub fn has_controller(&self, id: NodeId) -> bool {
        self.has_skin_controller(id) || self.has_morph_controller(id)
    }

    fn upstream_chain_contains(&self, id: NodeId, class: NodeClass) -> bool {
        if self.mesh(id).is_none() {
            return false;
        }
        let mut visited = std::collections::HashSet::new();
        let mut current = self.upstream_of(id);
        while let Some(node_id) = current {
            if !visited.insert(node_id) {
                // Cyclic chain; the walker reports it as fatal, the
                // predicate just stops scanning.
                return false;
            }
            match self.classify(node_id) {
                c if c == class => return true,
                NodeClass::Skin | NodeClass::Morph | NodeClass::Mesh => {
                    current = self.upstream_of(node_id);
                }
                NodeClass::Origin => return false,
            }
        }
        false
    }

    /// Child-to-parent index over the transform hierarchy. When a node is
    /// instanced under several parents, the last edge wins; skeleton-root
    /// resolution only needs one valid path upward.
    pub fn parent_index_map(&self) -> HashMap<NodeId, NodeId> {
        let mut parents = HashMap::new();
        for (index, slot) in self.nodes.iter().enumerate() {
            let Some(node) = slot else {
                continue;
            };
            for &child in &node.children {
                parents.insert(child, NodeId(index as u32));
            }
        }
        parents
    }
}
