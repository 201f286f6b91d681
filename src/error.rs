use thiserror::Error;

use crate::device::MeshHandle;
use crate::render_state::{ShaderPass, VertexFormat};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("vertex format {format:?} does not match shader pass {pass:?}")]
    VertexFormatMismatch { pass: ShaderPass, format: VertexFormat },
    #[error("failed to create {what}: {reason}")]
    ResourceCreation { what: &'static str, reason: String },
    #[error("unknown mesh handle {0:?}")]
    UnknownMesh(MeshHandle),
}
