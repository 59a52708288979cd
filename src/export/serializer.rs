use std::collections::HashMap;
use std::fmt::{self, Write};

use nalgebra::Matrix4;

use super::types::{ColladaMorphController, ColladaSkinController, ControllerInstance};
use crate::scene::MorphMethod;

// ─── Id and text handling ─────────────────────────────────────────────────────

/// Reduce a scene name to an id usable in document references: keep
/// alphanumerics, `_`, `-` and `.`, replace everything else, and never
/// start with a digit.
pub(crate) fn sanitize_id(name: &str) -> String {
    let mut id: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if id.is_empty() {
        id.push('_');
    }
    if id.starts_with(|c: char| c.is_ascii_digit()) {
        id.insert(0, '_');
    }
    id
}

fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// 16 floats, row-major, as the document encodes matrices.
fn format_matrix(matrix: &Matrix4<f32>) -> String {
    let mut out = String::new();
    for row in 0..4 {
        for col in 0..4 {
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(out, "{}", matrix[(row, col)]);
        }
    }
    out
}

fn format_floats(values: impl IntoIterator<Item = f32>) -> String {
    let mut out = String::new();
    for value in values {
        if !out.is_empty() {
            out.push(' ');
        }
        let _ = write!(out, "{value}");
    }
    out
}

// ─── Library writer ───────────────────────────────────────────────────────────

/// Write the complete controller library. Each record is emitted exactly
/// once; re-instanced controllers only repeat through the instance glue.
pub(crate) fn write_library_controllers(
    w: &mut impl Write,
    skins: &[ColladaSkinController],
    morphs: &[ColladaMorphController],
) -> fmt::Result {
    writeln!(w, "<library_controllers>")?;
    for skin in skins {
        write_skin_controller(w, skin)?;
    }
    for morph in morphs {
        write_morph_controller(w, morph)?;
    }
    writeln!(w, "</library_controllers>")
}

pub(crate) fn write_skin_controller(
    w: &mut impl Write,
    skin: &ColladaSkinController,
) -> fmt::Result {
    let id = &skin.controller_id;
    writeln!(w, r#"  <controller id="{id}">"#)?;
    writeln!(w, r##"    <skin source="#{}">"##, skin.source_id)?;
    writeln!(
        w,
        "      <bind_shape_matrix>{}</bind_shape_matrix>",
        format_matrix(&skin.bind_shape_transform)
    )?;
    write_joint_source(w, skin)?;
    write_bind_poses_source(w, skin)?;

    let (pool, pool_indices) = build_weight_pool(skin);
    write_weight_source(w, skin, &pool)?;
    write_joints_element(w, skin)?;
    write_vertex_weights(w, skin, &pool_indices)?;

    writeln!(w, "    </skin>")?;
    writeln!(w, "  </controller>")
}

/// Joint source: names parallel to the bind-poses source.
fn write_joint_source(w: &mut impl Write, skin: &ColladaSkinController) -> fmt::Result {
    let id = &skin.controller_id;
    let names = skin
        .joints
        .iter()
        .map(|name| escape_text(name))
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(w, r#"      <source id="{id}-joints">"#)?;
    writeln!(
        w,
        r#"        <Name_array id="{id}-joints-array" count="{}">{names}</Name_array>"#,
        skin.joints.len()
    )?;
    writeln!(w, "        <technique_common>")?;
    writeln!(
        w,
        r##"          <accessor source="#{id}-joints-array" count="{}" stride="1">"##,
        skin.joints.len()
    )?;
    writeln!(w, r#"            <param name="JOINT" type="name"/>"#)?;
    writeln!(w, "          </accessor>")?;
    writeln!(w, "        </technique_common>")?;
    writeln!(w, "      </source>")
}

/// Bind-poses source: one 4x4 transform per joint.
fn write_bind_poses_source(w: &mut impl Write, skin: &ColladaSkinController) -> fmt::Result {
    let id = &skin.controller_id;
    let values = skin
        .bind_poses
        .iter()
        .map(format_matrix)
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(w, r#"      <source id="{id}-bind_poses">"#)?;
    writeln!(
        w,
        r#"        <float_array id="{id}-bind_poses-array" count="{}">{values}</float_array>"#,
        skin.bind_poses.len() * 16
    )?;
    writeln!(w, "        <technique_common>")?;
    writeln!(
        w,
        r##"          <accessor source="#{id}-bind_poses-array" count="{}" stride="16">"##,
        skin.bind_poses.len()
    )?;
    writeln!(w, r#"            <param name="TRANSFORM" type="float4x4"/>"#)?;
    writeln!(w, "          </accessor>")?;
    writeln!(w, "        </technique_common>")?;
    writeln!(w, "      </source>")
}

/// Deduplicated weight pool plus, per vertex, the pool index of each
/// influence (parallel to the record's influence lists).
fn build_weight_pool(skin: &ColladaSkinController) -> (Vec<f32>, Vec<Vec<usize>>) {
    let mut pool = Vec::new();
    let mut seen: HashMap<u32, usize> = HashMap::new();
    let mut pool_indices = Vec::with_capacity(skin.vertex_influences.len());

    for influences in &skin.vertex_influences {
        let mut indices = Vec::with_capacity(influences.len());
        for influence in influences {
            let bits = influence.weight.to_bits();
            let index = *seen.entry(bits).or_insert_with(|| {
                pool.push(influence.weight);
                pool.len() - 1
            });
            indices.push(index);
        }
        pool_indices.push(indices);
    }

    (pool, pool_indices)
}

fn write_weight_source(
    w: &mut impl Write,
    skin: &ColladaSkinController,
    pool: &[f32],
) -> fmt::Result {
    let id = &skin.controller_id;
    writeln!(w, r#"      <source id="{id}-weights">"#)?;
    writeln!(
        w,
        r#"        <float_array id="{id}-weights-array" count="{}">{}</float_array>"#,
        pool.len(),
        format_floats(pool.iter().copied())
    )?;
    writeln!(w, "        <technique_common>")?;
    writeln!(
        w,
        r##"          <accessor source="#{id}-weights-array" count="{}" stride="1">"##,
        pool.len()
    )?;
    writeln!(w, r#"            <param name="WEIGHT" type="float"/>"#)?;
    writeln!(w, "          </accessor>")?;
    writeln!(w, "        </technique_common>")?;
    writeln!(w, "      </source>")
}

fn write_joints_element(w: &mut impl Write, skin: &ColladaSkinController) -> fmt::Result {
    let id = &skin.controller_id;
    writeln!(w, "      <joints>")?;
    writeln!(w, r##"        <input semantic="JOINT" source="#{id}-joints"/>"##)?;
    writeln!(
        w,
        r##"        <input semantic="INV_BIND_MATRIX" source="#{id}-bind_poses"/>"##
    )?;
    writeln!(w, "      </joints>")
}

/// `<vertex_weights>`: per-vertex influence counts plus interleaved
/// (joint index, weight-pool index) pairs.
fn write_vertex_weights(
    w: &mut impl Write,
    skin: &ColladaSkinController,
    pool_indices: &[Vec<usize>],
) -> fmt::Result {
    let id = &skin.controller_id;
    let vcount = skin
        .vertex_influences
        .iter()
        .map(|influences| influences.len().to_string())
        .collect::<Vec<_>>()
        .join(" ");

    let mut v = String::new();
    for (influences, indices) in skin.vertex_influences.iter().zip(pool_indices) {
        for (influence, &pool_index) in influences.iter().zip(indices) {
            if !v.is_empty() {
                v.push(' ');
            }
            let _ = write!(v, "{} {}", influence.joint_index, pool_index);
        }
    }

    writeln!(
        w,
        r#"      <vertex_weights count="{}">"#,
        skin.vertex_influences.len()
    )?;
    writeln!(
        w,
        r##"        <input semantic="JOINT" source="#{id}-joints" offset="0"/>"##
    )?;
    writeln!(
        w,
        r##"        <input semantic="WEIGHT" source="#{id}-weights" offset="1"/>"##
    )?;
    writeln!(w, "        <vcount>{vcount}</vcount>")?;
    writeln!(w, "        <v>{v}</v>")?;
    writeln!(w, "      </vertex_weights>")
}

pub(crate) fn write_morph_controller(
    w: &mut impl Write,
    morph: &ColladaMorphController,
) -> fmt::Result {
    let id = &morph.controller_id;
    let method = match morph.method {
        MorphMethod::Normalized => "NORMALIZED",
        MorphMethod::Relative => "RELATIVE",
    };
    let target_ids = morph
        .targets
        .iter()
        .map(|(geometry_id, _)| escape_text(geometry_id))
        .collect::<Vec<_>>()
        .join(" ");
    let weights = format_floats(morph.targets.iter().map(|&(_, weight)| weight));

    writeln!(w, r#"  <controller id="{id}">"#)?;
    writeln!(
        w,
        r##"    <morph source="#{}" method="{method}">"##,
        morph.source_id
    )?;
    writeln!(w, r#"      <source id="{id}-targets">"#)?;
    writeln!(
        w,
        r#"        <IDREF_array id="{id}-targets-array" count="{}">{target_ids}</IDREF_array>"#,
        morph.targets.len()
    )?;
    writeln!(w, "        <technique_common>")?;
    writeln!(
        w,
        r##"          <accessor source="#{id}-targets-array" count="{}" stride="1">"##,
        morph.targets.len()
    )?;
    writeln!(w, r#"            <param name="MORPH_TARGET" type="IDREF"/>"#)?;
    writeln!(w, "          </accessor>")?;
    writeln!(w, "        </technique_common>")?;
    writeln!(w, "      </source>")?;
    writeln!(w, r#"      <source id="{id}-weights">"#)?;
    writeln!(
        w,
        r#"        <float_array id="{id}-weights-array" count="{}">{weights}</float_array>"#,
        morph.targets.len()
    )?;
    writeln!(w, "        <technique_common>")?;
    writeln!(
        w,
        r##"          <accessor source="#{id}-weights-array" count="{}" stride="1">"##,
        morph.targets.len()
    )?;
    writeln!(w, r#"            <param name="MORPH_WEIGHT" type="float"/>"#)?;
    writeln!(w, "          </accessor>")?;
    writeln!(w, "        </technique_common>")?;
    writeln!(w, "      </source>")?;
    writeln!(w, "      <targets>")?;
    writeln!(
        w,
        r##"        <input semantic="MORPH_TARGET" source="#{id}-targets"/>"##
    )?;
    writeln!(
        w,
        r##"        <input semantic="MORPH_WEIGHT" source="#{id}-weights"/>"##
    )?;
    writeln!(w, "      </targets>")?;
    writeln!(w, "    </morph>")?;
    writeln!(w, "  </controller>")
}

// ─── Instance glue ────────────────────────────────────────────────────────────

/// Binding element for the scene-graph instance phase: the controller url
/// plus one skeleton root reference per resolved root.
pub(crate) fn write_instance_controller(
    w: &mut impl Write,
    instance: &ControllerInstance,
) -> fmt::Result {
    writeln!(
        w,
        r##"<instance_controller url="#{}">"##,
        instance.controller_id
    )?;
    for root in &instance.skeleton_roots {
        writeln!(w, "  <skeleton>#{}</skeleton>", escape_text(root))?;
    }
    writeln!(w, "</instance_controller>")
}
