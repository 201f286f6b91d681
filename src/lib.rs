pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod frame;
pub mod frustum;
pub mod light;
pub mod mesh;
pub mod render_state;
pub mod shadow_mask;
pub mod soft_device;
pub mod stencil;

pub use config::ShadowMaskConfig;
pub use device::GraphicsDevice;
pub use frame::{ShadowFrame, ViewParameters};
pub use shadow_mask::{CameraDistancePolicy, LightVolumePolicy, ShadowMaskMetrics, ShadowMaskPipeline};
pub use soft_device::SoftDevice;
