//! Per-frame shadow mask generation.
//!
//! The sun is composited into channel 0 of the first mask slice through the cascade
//! sequencer. Pooled point and spot lights are packed into the remaining channels and
//! composited one stencil-culled light volume at a time.

mod cascades;
mod channel_packer;
mod classifier;
mod compositor;
mod volume_cull;

pub use cascades::{CascadeMode, PassKind, DEBUG_CASCADE_PALETTE};
pub use channel_packer::{pack_lights, ChannelAssignment, ChannelLights};
pub use classifier::{classify, sun_cascade_range, ClassifiedCasters};
pub use compositor::ShadingTechnique;
pub use volume_cull::{resolved_stencil_value, DepthClipSupport, NonConvexVolume};

use anyhow::{Context, Result};
use glam::{Vec3, Vec4};

use crate::config::ShadowMaskConfig;
use crate::context::RenderContext;
use crate::device::{params, GraphicsDevice, RenderTarget};
use crate::frame::{ShadowFrame, ViewParameters};
use crate::light::{Light, LightShape};
use crate::mesh::UnitVolumeMeshes;
use crate::render_state::{CullMode, ShaderFlags};

/// Borrowed view of everything a stage needs while it records commands.
pub struct MaskStage<'a> {
    pub ctx: &'a mut RenderContext,
    pub device: &'a mut dyn GraphicsDevice,
    pub meshes: &'a UnitVolumeMeshes,
    pub config: &'a ShadowMaskConfig,
    pub view: ViewParameters,
}

/// Decides whether a pooled light is composited through its bounding volume or a
/// fullscreen pass.
pub trait LightVolumePolicy {
    fn use_light_volumes(&self, light: &Light, view: &ViewParameters) -> bool;
}

/// Uses light volumes whenever the camera is safely outside the light's bounds.
#[derive(Clone, Copy, Debug)]
pub struct CameraDistancePolicy {
    pub enabled: bool,
    pub area_lights: bool,
}

impl CameraDistancePolicy {
    const SMALL_LIGHT_BIAS: f32 = 0.5;

    pub fn from_config(config: &ShadowMaskConfig) -> Self {
        Self { enabled: config.light_volumes, area_lights: config.area_lights }
    }

    /// Sphere test radius. Small lights get a larger relative bias for the mesh tessellation.
    pub fn biased_radius(radius: f32) -> f32 {
        let scaled = radius * (-0.1 * radius + 1.5).max(1.22);
        scaled.max(radius + Self::SMALL_LIGHT_BIAS)
    }

    /// True when the near plane does not cut through the area light's box.
    fn box_clear_of_near_plane(light: &Light, view: &ViewParameters) -> bool {
        let to_world = light.area_light_matrix(Vec3::splat(light.radius * 1.08));
        let near = view.view_proj.row(2);
        // plane coefficients transform with the transpose of the object-to-world matrix
        let local = to_world.transpose() * near;
        let extent = local.x.abs() + local.y.abs() + local.z.abs();
        (extent + local.w) * (-extent + local.w) > 0.0
    }
}

impl Default for CameraDistancePolicy {
    fn default() -> Self {
        Self::from_config(&ShadowMaskConfig::default())
    }
}

impl LightVolumePolicy for CameraDistancePolicy {
    fn use_light_volumes(&self, light: &Light, view: &ViewParameters) -> bool {
        if !self.enabled {
            return false;
        }
        if light.shape() == LightShape::Area && self.area_lights {
            return Self::box_clear_of_near_plane(light, view);
        }
        let radius = Self::biased_radius(light.radius);
        radius * radius < light.position.distance_squared(view.camera_position)
    }
}

/// Counters of one generated frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShadowMaskMetrics {
    pub channel_budget: u32,
    pub channels_in_use: u32,
    pub placed_lights: u32,
    pub dropped_lights: u32,
    pub stencil_resets: u32,
    pub sun_cascades: u32,
    pub sun_rendered: bool,
    /// Light sides that went through a mask-gen technique.
    pub composited_sides: u32,
}

impl ShadowMaskMetrics {
    /// Budget in the high half, channels in use in the low half.
    pub fn packed_channel_stat(&self) -> u32 {
        (self.channel_budget << 16) | (self.channels_in_use & 0xFFFF)
    }
}

pub struct ShadowMaskPipeline {
    config: ShadowMaskConfig,
    ctx: RenderContext,
    meshes: UnitVolumeMeshes,
    policy: Box<dyn LightVolumePolicy>,
    clear_mask_pending: bool,
    last_metrics: ShadowMaskMetrics,
}

impl ShadowMaskPipeline {
    pub fn new(device: &mut dyn GraphicsDevice, config: ShadowMaskConfig) -> Result<Self> {
        let meshes = UnitVolumeMeshes::create(device).context("Failed to create unit volume meshes")?;
        log::debug!("Created {} unit volume meshes for the shadow mask", meshes.len());
        let policy = Box::new(CameraDistancePolicy::from_config(&config));
        let ctx = RenderContext::new();
        ctx.bind_all(device);
        Ok(Self { config, ctx, meshes, policy, clear_mask_pending: true, last_metrics: ShadowMaskMetrics::default() })
    }

    pub fn with_policy(mut self, policy: impl LightVolumePolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn config(&self) -> &ShadowMaskConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ShadowMaskConfig {
        &mut self.config
    }

    pub fn context(&self) -> &RenderContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RenderContext {
        &mut self.ctx
    }

    pub fn last_metrics(&self) -> ShadowMaskMetrics {
        self.last_metrics
    }

    /// Generates the shadow mask for `frame`.
    ///
    /// Writes each pooled light's mask channel and slice back into the frame and
    /// clears the generation mask of lights that found no free channel.
    pub fn render_frame(&mut self, device: &mut dyn GraphicsDevice, frame: &mut ShadowFrame) -> ShadowMaskMetrics {
        frame.reset_mask_assignments();
        let casters = classify(frame, &self.config);
        let budget = self.config.channel_budget();
        let mut metrics = ShadowMaskMetrics { channel_budget: budget, ..Default::default() };

        if casters.is_empty() {
            if self.clear_mask_pending {
                log::debug!("No shadow casters this frame; clearing {} mask slices", self.config.mask_slices);
                for slice in 0..self.config.mask_slices {
                    device.clear_color(RenderTarget::ShadowMaskSlice(slice), Vec4::ZERO);
                }
                self.clear_mask_pending = false;
            }
            self.last_metrics = metrics;
            return metrics;
        }
        self.clear_mask_pending = true;

        let resets_before = self.ctx.stencil_ref.resets();
        let saved = self.ctx.snapshot();
        self.ctx.shader_flags = ShaderFlags::empty();
        self.ctx.stencil_ref.set(1);

        let mut stage = MaskStage {
            ctx: &mut self.ctx,
            device,
            meshes: &self.meshes,
            config: &self.config,
            view: frame.view,
        };
        stage.device.set_matrix(params::VIEW_PROJ, &frame.view.view_proj);
        stage.device.clear_color(RenderTarget::ShadowMaskSlice(0), Vec4::ZERO);
        stage.ctx.clear_stencil(stage.device);
        stage.device.push_render_target(RenderTarget::ShadowMaskSlice(0));

        let mut first_channel = 0;
        let mut channels_in_use = 0;
        if let Some(sun) = casters.sun {
            metrics.sun_cascades = sun_cascade_range(frame, sun).len() as u32;
            metrics.sun_rendered = stage.render_sun_shadows(frame, sun);
            first_channel += 1;
            channels_in_use += 1;
        }

        if !casters.pooled.is_empty() {
            let assignment = pack_lights(frame, &casters.pooled, budget, first_channel, channels_in_use);
            metrics.placed_lights = assignment.placed() as u32;
            metrics.dropped_lights = assignment.dropped().len() as u32;
            metrics.composited_sides = stage.composite_channels(frame, &assignment, self.policy.as_ref());
            channels_in_use = assignment.channels_in_use();
        }
        metrics.channels_in_use = channels_in_use;

        stage.ctx.set_cull(stage.device, CullMode::Back, true);
        stage.ctx.restore(stage.device, saved);
        stage.device.pop_render_target();

        metrics.stencil_resets = self.ctx.stencil_ref.resets() - resets_before;
        log::trace!(
            "Shadow mask: {} of {} channels, {} lights placed, {} dropped",
            metrics.channels_in_use,
            metrics.channel_budget,
            metrics.placed_lights,
            metrics.dropped_lights
        );
        self.last_metrics = metrics;
        metrics
    }

    /// Marks the inside of `volume` in the stencil buffer, resolving it into the red
    /// channel of `target` on devices that cannot sample stencil.
    pub fn mark_non_convex_volume(
        &mut self,
        device: &mut dyn GraphicsDevice,
        view: &ViewParameters,
        target: RenderTarget,
        volume: &NonConvexVolume,
    ) {
        let saved = self.ctx.snapshot();
        let mut stage = MaskStage {
            ctx: &mut self.ctx,
            device,
            meshes: &self.meshes,
            config: &self.config,
            view: *view,
        };
        stage.device.set_matrix(params::VIEW_PROJ, &view.view_proj);
        stage.device.push_render_target(target);
        stage.stencil_cull_non_convex(volume.id, volume.mesh, volume.format, &volume.world);
        stage.device.pop_render_target();
        stage.ctx.restore(stage.device, saved);
        log::trace!("Marked non-convex volume {} into {target:?}", volume.id);
    }
}
