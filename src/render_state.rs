use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct StateFlags: u32 {
        const DEPTH_WRITE = 1 << 0;
        const DEPTH_TEST = 1 << 1;
        const STENCIL = 1 << 2;
        const WIREFRAME = 1 << 3;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ColorWrites: u8 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
    }
}

impl ColorWrites {
    /// Write mask selecting exactly one channel of an RGBA target.
    pub fn channel(index: u32) -> Self {
        Self::from_bits_truncate(1 << (index % 4))
    }

    pub fn channel_index(self, index: usize) -> bool {
        self.bits() & (1 << index) != 0
    }
}

bitflags! {
    /// Runtime shader permutation bits toggled by the shadow passes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ShaderFlags: u64 {
        const SAMPLE0 = 1 << 0;
        const SAMPLE1 = 1 << 1;
        const SAMPLE2 = 1 << 2;
        const SAMPLE3 = 1 << 3;
        const SAMPLE4 = 1 << 4;
        const CUBEMAP0 = 1 << 5;
        const HW_PCF_COMPARE = 1 << 6;
        const POINT_LIGHT = 1 << 7;
        const SHADOW_MIXED_MAP_G16R16 = 1 << 8;
        const SHADOW_JITTERING = 1 << 9;
        const NEAREST = 1 << 10;
        const QUALITY = 1 << 11;
        const QUALITY1 = 1 << 12;
    }
}

impl ShaderFlags {
    /// Bits reset at the start of every deferred shadow pass.
    pub const SHADOW_PASS_RESET: ShaderFlags = ShaderFlags::SAMPLE0
        .union(ShaderFlags::SAMPLE1)
        .union(ShaderFlags::SAMPLE2)
        .union(ShaderFlags::SAMPLE4)
        .union(ShaderFlags::CUBEMAP0)
        .union(ShaderFlags::HW_PCF_COMPARE)
        .union(ShaderFlags::POINT_LIGHT)
        .union(ShaderFlags::SHADOW_MIXED_MAP_G16R16)
        .union(ShaderFlags::SHADOW_JITTERING)
        .union(ShaderFlags::NEAREST);

    pub const QUALITY_MASK: ShaderFlags = ShaderFlags::QUALITY.union(ShaderFlags::QUALITY1);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum DepthFunc {
    Less,
    #[default]
    LessEqual,
    Equal,
    Greater,
    GreaterEqual,
    Always,
}

impl DepthFunc {
    pub fn passes(self, fragment: f32, stored: f32) -> bool {
        match self {
            DepthFunc::Less => fragment < stored,
            DepthFunc::LessEqual => fragment <= stored,
            DepthFunc::Equal => fragment == stored,
            DepthFunc::Greater => fragment > stored,
            DepthFunc::GreaterEqual => fragment >= stored,
            DepthFunc::Always => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// `ONE, ONE` with an add operation.
    Additive,
    /// `ONE, ONE` resolved with a max operation.
    AdditiveMax,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderState {
    pub flags: StateFlags,
    pub depth_func: DepthFunc,
    pub color_writes: ColorWrites,
    pub blend: BlendMode,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            flags: StateFlags::DEPTH_TEST | StateFlags::DEPTH_WRITE,
            depth_func: DepthFunc::LessEqual,
            color_writes: ColorWrites::all(),
            blend: BlendMode::Opaque,
        }
    }
}

impl RenderState {
    pub fn depth_test(&self) -> bool {
        self.flags.contains(StateFlags::DEPTH_TEST)
    }

    pub fn stencil(&self) -> bool {
        self.flags.contains(StateFlags::STENCIL)
    }

    /// Stencil-only marking state: depth tested with `LessEqual`, nothing written but stencil.
    pub fn stencil_mark(self) -> Self {
        let mut flags = self.flags;
        flags.remove(StateFlags::DEPTH_WRITE | StateFlags::WIREFRAME);
        flags.insert(StateFlags::DEPTH_TEST | StateFlags::STENCIL);
        Self { flags, depth_func: DepthFunc::LessEqual, color_writes: ColorWrites::empty(), blend: self.blend }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

impl CullMode {
    pub fn mirrored(self) -> Self {
        match self {
            CullMode::Front => CullMode::Back,
            CullMode::Back => CullMode::Front,
            CullMode::None => CullMode::None,
        }
    }
}

/// Stencil comparison, evaluated as `(reference & mask) FUNC (stored & mask)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum StencilFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    #[default]
    Always,
}

impl StencilFunc {
    pub fn passes(self, reference: u8, stored: u8, mask: u8) -> bool {
        let reference = reference & mask;
        let stored = stored & mask;
        match self {
            StencilFunc::Never => false,
            StencilFunc::Less => reference < stored,
            StencilFunc::Equal => reference == stored,
            StencilFunc::LessEqual => reference <= stored,
            StencilFunc::Greater => reference > stored,
            StencilFunc::NotEqual => reference != stored,
            StencilFunc::GreaterEqual => reference >= stored,
            StencilFunc::Always => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrSat,
    DecrSat,
    Invert,
    Incr,
    Decr,
}

impl StencilOp {
    pub fn apply(self, stored: u8, reference: u8) -> u8 {
        match self {
            StencilOp::Keep => stored,
            StencilOp::Zero => 0,
            StencilOp::Replace => reference,
            StencilOp::IncrSat => stored.saturating_add(1),
            StencilOp::DecrSat => stored.saturating_sub(1),
            StencilOp::Invert => !stored,
            StencilOp::Incr => stored.wrapping_add(1),
            StencilOp::Decr => stored.wrapping_sub(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilState {
    pub func: StencilFunc,
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
    pub reference: u8,
    pub read_mask: u8,
    pub write_mask: u8,
}

impl Default for StencilState {
    fn default() -> Self {
        Self::keep(StencilFunc::Always, 0)
    }
}

impl StencilState {
    pub const fn new(
        func: StencilFunc,
        fail: StencilOp,
        depth_fail: StencilOp,
        pass: StencilOp,
        reference: u8,
    ) -> Self {
        Self { func, fail, depth_fail, pass, reference, read_mask: 0xFF, write_mask: 0xFF }
    }

    /// Test-only state: compare against `reference`, never write.
    pub const fn keep(func: StencilFunc, reference: u8) -> Self {
        Self::new(func, StencilOp::Keep, StencilOp::Keep, StencilOp::Keep, reference)
    }

    /// Marking state that only touches pixels where the depth test fails.
    pub const fn on_depth_fail(func: StencilFunc, op: StencilOp, reference: u8) -> Self {
        Self::new(func, StencilOp::Keep, op, StencilOp::Keep, reference)
    }

    pub fn resolve(&self, stored: u8, stencil_passed: bool, depth_passed: bool) -> u8 {
        let op = if !stencil_passed {
            self.fail
        } else if !depth_passed {
            self.depth_fail
        } else {
            self.pass
        };
        let written = op.apply(stored, self.reference);
        (stored & !self.write_mask) | (written & self.write_mask)
    }
}

/// Shader passes of the `DeferredShadowPass` technique, in technique order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShadowGenPass {
    ShadowPass = 2,
    ShadowCullPass = 3,
    ShadowFrustumCullPass = 4,
    StencilVolumeClip = 5,
    CloudsSeparate = 6,
    StencilCullNonConvexResolve = 9,
    ShadowCullPassFrontFacing = 10,
    ShadowFrustumCullPassFrontFacing = 11,
    StencilVolumeClipFrontFacing = 12,
}

impl ShadowGenPass {
    pub fn index(self) -> u32 {
        self as u32
    }

    /// Passes that clamp geometry to the far plane instead of relying on depth clipping.
    pub fn clamps_far_plane(self) -> bool {
        matches!(
            self,
            ShadowGenPass::ShadowCullPass | ShadowGenPass::ShadowFrustumCullPass | ShadowGenPass::StencilVolumeClip
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderPass {
    ShadowGen(ShadowGenPass),
    /// First pass of a single-pass technique.
    Main,
}

impl ShaderPass {
    pub fn index(self) -> u32 {
        match self {
            ShaderPass::ShadowGen(pass) => pass.index(),
            ShaderPass::Main => 0,
        }
    }
}

impl From<ShadowGenPass> for ShaderPass {
    fn from(pass: ShadowGenPass) -> Self {
        ShaderPass::ShadowGen(pass)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Technique {
    DeferredShadowPass,
    ShadowMaskGen,
    ShadowMaskGenVolume,
    DebugShadowCascades,
}

impl Technique {
    pub fn name(self) -> &'static str {
        match self {
            Technique::DeferredShadowPass => "DeferredShadowPass",
            Technique::ShadowMaskGen => "ShadowMaskGen",
            Technique::ShadowMaskGenVolume => "ShadowMaskGenVolume",
            Technique::DebugShadowCascades => "DebugShadowCascades",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    /// Position-only layout of the unit volume meshes.
    P3F,
    /// Position, packed color and texcoord layout used by the fullscreen quad.
    P3FC4BT2F,
}
