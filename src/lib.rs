//! Skin/morph controller export.
//!
//! Walks a scene graph's deformer chains (skin clusters and stacked morph
//! deformers upstream of rendered meshes), resolves them into canonical
//! controller records, and serializes a COLLADA-style controller library
//! plus the instance-binding glue for the scene-graph phase.

pub mod error;
pub mod export;
pub mod scene;

pub use error::ExportError;
pub use export::{
    ControllerExport, ExportOptions, ExportReport, export_controllers, instance_controller_xml,
};
