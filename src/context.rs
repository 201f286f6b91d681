use bitflags::bitflags;

use crate::device::GraphicsDevice;
use crate::light::ScissorRect;
use crate::mesh::UnitVolume;
use crate::render_state::{CullMode, RenderState, ShaderFlags, StateFlags, StencilFunc, StencilState};
use crate::stencil::StencilRefCounter;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PersFlags: u32 {
        /// Flip the requested cull mode for mirrored geometry.
        const MIRROR_CULL = 1 << 0;
    }
}

/// Render state shared by the shadow mask stages for one frame.
///
/// Setters mirror every change to the device and skip redundant calls. Stages
/// bracket their work with [`RenderContext::snapshot`] and [`RenderContext::restore`].
#[derive(Clone, Debug)]
pub struct RenderContext {
    pub stencil_ref: StencilRefCounter,
    /// Stencil function used when a cull pass marks an explicit id.
    pub stencil_cull_func: StencilFunc,
    pub shader_flags: ShaderFlags,
    pub pers_flags: PersFlags,
    /// Frustum mesh used for projector and frustum volumes.
    pub deferred_primitive: UnitVolume,
    state: RenderState,
    stencil: StencilState,
    cull: CullMode,
    scissor: Option<ScissorRect>,
    depth_clip: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub state: RenderState,
    pub stencil_cull_func: StencilFunc,
    pub shader_flags: ShaderFlags,
    pub pers_flags: PersFlags,
    pub cull: CullMode,
}

impl Default for RenderContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderContext {
    pub fn new() -> Self {
        Self {
            stencil_ref: StencilRefCounter::default(),
            stencil_cull_func: StencilFunc::GreaterEqual,
            shader_flags: ShaderFlags::empty(),
            pers_flags: PersFlags::empty(),
            deferred_primitive: UnitVolume::Projector(0),
            state: RenderState::default(),
            stencil: StencilState::default(),
            cull: CullMode::Back,
            scissor: None,
            depth_clip: true,
        }
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn stencil_state(&self) -> StencilState {
        self.stencil
    }

    pub fn cull_mode(&self) -> CullMode {
        self.cull
    }

    pub fn scissor(&self) -> Option<ScissorRect> {
        self.scissor
    }

    pub fn depth_clip(&self) -> bool {
        self.depth_clip
    }

    /// Pushes the whole tracked state to the device.
    pub fn bind_all(&self, device: &mut dyn GraphicsDevice) {
        device.set_render_state(&self.state);
        device.set_stencil_state(&self.stencil);
        device.set_cull_mode(self.cull);
        device.set_scissor(self.scissor);
        device.set_depth_clip(self.depth_clip);
    }

    pub fn set_state(&mut self, device: &mut dyn GraphicsDevice, state: RenderState) {
        if self.state != state {
            self.state = state;
            device.set_render_state(&state);
        }
    }

    pub fn set_stencil_state(&mut self, device: &mut dyn GraphicsDevice, stencil: StencilState) {
        if self.stencil != stencil {
            self.stencil = stencil;
            device.set_stencil_state(&stencil);
        }
    }

    /// Sets the cull mode, flipped while mirror culling is active unless `skip_mirror`.
    pub fn set_cull(&mut self, device: &mut dyn GraphicsDevice, mode: CullMode, skip_mirror: bool) {
        let mode =
            if !skip_mirror && self.pers_flags.contains(PersFlags::MIRROR_CULL) { mode.mirrored() } else { mode };
        self.restore_cull(device, mode);
    }

    /// Rebinds a previously observed cull mode as-is.
    pub fn restore_cull(&mut self, device: &mut dyn GraphicsDevice, mode: CullMode) {
        if self.cull != mode {
            self.cull = mode;
            device.set_cull_mode(mode);
        }
    }

    pub fn set_scissor(&mut self, device: &mut dyn GraphicsDevice, rect: Option<ScissorRect>) {
        if self.scissor != rect {
            self.scissor = rect;
            device.set_scissor(rect);
        }
    }

    pub fn set_depth_clip(&mut self, device: &mut dyn GraphicsDevice, enabled: bool) {
        if self.depth_clip != enabled {
            self.depth_clip = enabled;
            device.set_depth_clip(enabled);
        }
    }

    /// Clears the stencil buffer to zero over the whole target.
    pub fn clear_stencil(&mut self, device: &mut dyn GraphicsDevice) {
        let scissor = self.scissor;
        self.set_scissor(device, None);
        device.clear_stencil(0);
        self.set_scissor(device, scissor);
    }

    /// Next light-volume reference, clearing the stencil buffer when the counter wraps.
    pub fn next_volume_ref(&mut self, device: &mut dyn GraphicsDevice) -> u8 {
        if self.stencil_ref.advance() {
            log::debug!("stencil reference wrapped, clearing stencil (reset #{})", self.stencil_ref.resets());
            self.clear_stencil(device);
        }
        self.stencil_ref.reference()
    }

    /// Reserves `sides + 1` references for one light.
    pub fn reserve_stencil_refs(&mut self, device: &mut dyn GraphicsDevice, sides: u32) {
        if self.stencil_ref.reserve(sides) {
            log::debug!("stencil reservation of {} wrapped, clearing stencil", sides + 1);
            self.clear_stencil(device);
        }
    }

    /// Restricts drawing to pixels whose stencil equals (or differs from) the current reference.
    pub fn stencil_test_current_ref(&mut self, device: &mut dyn GraphicsDevice, equal: bool) {
        let func = if equal { StencilFunc::Equal } else { StencilFunc::NotEqual };
        self.set_stencil_state(device, StencilState::keep(func, self.stencil_ref.reference()));
        let mut state = self.state;
        state.flags.insert(StateFlags::STENCIL);
        self.set_state(device, state);
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            state: self.state,
            stencil_cull_func: self.stencil_cull_func,
            shader_flags: self.shader_flags,
            pers_flags: self.pers_flags,
            cull: self.cull,
        }
    }

    pub fn restore(&mut self, device: &mut dyn GraphicsDevice, snapshot: ContextSnapshot) {
        self.stencil_cull_func = snapshot.stencil_cull_func;
        self.shader_flags = snapshot.shader_flags;
        self.pers_flags = snapshot.pers_flags;
        self.restore_cull(device, snapshot.cull);
        self.set_state(device, snapshot.state);
    }
}
