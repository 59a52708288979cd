use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;

use super::ControllerExport;

// ─── Diagnostic structs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ControllerDiagnostic {
    pub controller_id: String,
    pub target_id: String,
    pub joint_count: usize,
    pub vertex_count: usize,
    pub max_influences: usize,
    pub skeleton_root: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MorphDiagnostic {
    pub controller_id: String,
    pub source_id: String,
    pub target_count: usize,
}

/// Session-level diagnostic record, serialized to JSON next to the export
/// output when requested.
#[derive(Debug, Clone, Serialize)]
pub struct ExportDiagnosticLog {
    pub skin_controller_count: usize,
    pub morph_controller_count: usize,
    pub instance_count: usize,
    pub issue_count: usize,
    pub skins: Vec<ControllerDiagnostic>,
    pub morphs: Vec<MorphDiagnostic>,
}

// ─── Path helper ──────────────────────────────────────────────────────────────

pub fn diagnostic_log_path_for_output(output_path: &Path) -> PathBuf {
    output_path.with_extension("diagnostic.json")
}

// ─── Builders and writer ──────────────────────────────────────────────────────

pub(crate) fn build_diagnostic_log(export: &ControllerExport) -> ExportDiagnosticLog {
    let skins = export
        .skin_controllers
        .iter()
        .map(|skin| ControllerDiagnostic {
            controller_id: skin.controller_id.clone(),
            target_id: skin.target_id.clone(),
            joint_count: skin.joints.len(),
            vertex_count: skin.vertex_influences.len(),
            max_influences: skin.max_influences(),
            skeleton_root: skin.skeleton_root.clone(),
        })
        .collect();

    let morphs = export
        .morph_controllers
        .iter()
        .map(|morph| MorphDiagnostic {
            controller_id: morph.controller_id.clone(),
            source_id: morph.source_id.clone(),
            target_count: morph.targets.len(),
        })
        .collect();

    ExportDiagnosticLog {
        skin_controller_count: export.skin_controllers.len(),
        morph_controller_count: export.morph_controllers.len(),
        instance_count: export.instances.len(),
        issue_count: export.report.issues.len(),
        skins,
        morphs,
    }
}

/// Persist a diagnostic log as pretty-printed JSON.
pub fn write_diagnostic_log(path: &Path, log: &ExportDiagnosticLog) -> Result<()> {
    let json_bytes =
        serde_json::to_vec_pretty(log).context("failed to serialize export diagnostic JSON")?;
    fs::write(path, json_bytes)
        .with_context(|| format!("failed to write export diagnostic log: {}", path.display()))?;
    Ok(())
}
