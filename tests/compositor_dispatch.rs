use deferred_shadows::context::PersFlags;
use deferred_shadows::device::DeviceCaps;
use deferred_shadows::frustum::{light_frustum, FrustumType, ShadowFrustum};
use deferred_shadows::light::{Light, LightFlags, LightId, ScissorRect};
use deferred_shadows::render_state::{
    ColorWrites, CullMode, DepthFunc, ShaderFlags, ShaderPass, ShadowGenPass, StencilOp, Technique,
};
use deferred_shadows::soft_device::{DeviceCommand, DrawKind, DrawRecord};
use deferred_shadows::{
    LightVolumePolicy, ShadowFrame, ShadowMaskConfig, ShadowMaskPipeline, SoftDevice, ViewParameters,
};
use glam::{Mat3, Mat4, Vec3};

fn device() -> SoftDevice {
    SoftDevice::new(24, 24, DeviceCaps { depth_clip_control: true, stencil_texture_sampling: true })
}

fn frame_from(camera: Vec3) -> ShadowFrame {
    let view = Mat4::look_at_rh(camera, Vec3::ZERO, Vec3::Y);
    ShadowFrame::new(ViewParameters::new(view, Mat4::perspective_rh(1.2, 1.0, 0.1, 100.0), (24, 24)))
}

fn add_omni(frame: &mut ShadowFrame, radius: f32, scissor: ScissorRect) -> LightId {
    let light = Light::new(LightId(0), Vec3::ZERO, radius).with_scissor(scissor);
    frame.add_pooled_light(light, [ShadowFrustum::omni(Vec3::ZERO, 0.1, radius)])
}

fn mask_draws(dev: &SoftDevice) -> Vec<DrawRecord> {
    dev.draws()
        .filter(|draw| matches!(draw.technique, Some(Technique::ShadowMaskGen | Technique::ShadowMaskGenVolume)))
        .cloned()
        .collect()
}

fn cull_draws(dev: &SoftDevice, pass: ShadowGenPass) -> Vec<DrawRecord> {
    dev.draws()
        .filter(|draw| draw.technique == Some(Technique::DeferredShadowPass))
        .filter(|draw| draw.pass == Some(ShaderPass::ShadowGen(pass)))
        .cloned()
        .collect()
}

/// Cull modes of the draws that mark back faces.
fn back_face_culls(dev: &SoftDevice) -> Vec<CullMode> {
    cull_draws(dev, ShadowGenPass::ShadowFrustumCullPass)
        .iter()
        .filter(|draw| draw.stencil.depth_fail == StencilOp::Replace)
        .map(|draw| draw.cull)
        .collect()
}

fn add_projector(frame: &mut ShadowFrame) -> LightId {
    let projector = Light::new(LightId(0), Vec3::new(-2.0, 0.0, 0.0), 3.0)
        .with_flags(LightFlags::PROJECTOR)
        .with_scissor(ScissorRect::new(0, 0, 8, 8));
    let mut spot = ShadowFrustum::new(
        FrustumType::PerObject,
        light_frustum(projector.position, projector.direction(), projector.radius, 60.0),
    );
    spot.use_shadow_pool = true;
    frame.add_pooled_light(projector, [spot])
}

struct AlwaysFullscreen;

impl LightVolumePolicy for AlwaysFullscreen {
    fn use_light_volumes(&self, _light: &Light, _view: &ViewParameters) -> bool {
        false
    }
}

#[test]
fn distant_camera_shades_through_light_volumes() {
    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let mut frame = frame_from(Vec3::new(0.0, 0.0, 20.0));
    add_omni(&mut frame, 1.0, ScissorRect::new(0, 0, 24, 24));

    let metrics = pipeline.render_frame(&mut dev, &mut frame);

    let draws = mask_draws(&dev);
    assert_eq!(metrics.composited_sides, 6);
    assert_eq!(draws.len(), 6);
    for draw in &draws {
        assert_eq!(draw.technique, Some(Technique::ShadowMaskGenVolume));
        assert!(matches!(draw.kind, DrawKind::Indexed(_)));
        assert!(draw.shader_flags.contains(ShaderFlags::CUBEMAP0 | ShaderFlags::HW_PCF_COMPARE));
        assert_eq!(draw.state.color_writes, ColorWrites::R);
        assert!(draw.state.depth_test());
        assert_eq!(draw.state.depth_func, DepthFunc::LessEqual);
        assert!(draw.state.stencil());
    }
    assert!(pipeline.context().shader_flags.is_empty());
}

#[test]
fn camera_inside_light_shades_fullscreen() {
    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let mut frame = frame_from(Vec3::new(0.0, 0.0, 3.0));
    add_omni(&mut frame, 4.0, ScissorRect::new(0, 0, 24, 24));

    pipeline.render_frame(&mut dev, &mut frame);

    let draws = mask_draws(&dev);
    assert_eq!(draws.len(), 6);
    for draw in &draws {
        assert_eq!(draw.technique, Some(Technique::ShadowMaskGen));
        assert_eq!(draw.kind, DrawKind::Fullscreen);
        assert!(!draw.state.depth_test());
        assert!(!draw.shader_flags.contains(ShaderFlags::CUBEMAP0));
    }
}

#[test]
fn custom_policy_overrides_volume_choice() {
    let mut dev = device();
    let mut pipeline =
        ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline").with_policy(AlwaysFullscreen);
    let mut frame = frame_from(Vec3::new(0.0, 0.0, 20.0));
    add_omni(&mut frame, 1.0, ScissorRect::new(0, 0, 24, 24));

    pipeline.render_frame(&mut dev, &mut frame);

    assert!(mask_draws(&dev).iter().all(|draw| draw.kind == DrawKind::Fullscreen));
}

#[test]
fn only_sides_in_the_generation_mask_are_shaded() {
    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let mut frame = frame_from(Vec3::new(0.0, 0.0, 20.0));
    let light = add_omni(&mut frame, 1.0, ScissorRect::new(0, 0, 24, 24));
    if let Some(frustum) = frame.first_frustum_mut(light) {
        frustum.gen_mask = 0b101;
    }

    let metrics = pipeline.render_frame(&mut dev, &mut frame);

    assert_eq!(metrics.composited_sides, 2);
    assert_eq!(mask_draws(&dev).len(), 2);
}

#[test]
fn projector_and_area_lights_have_a_single_side() {
    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let mut frame = frame_from(Vec3::new(0.0, 0.0, 20.0));

    let projector = Light::new(LightId(0), Vec3::new(-2.0, 0.0, 0.0), 3.0)
        .with_flags(LightFlags::PROJECTOR)
        .with_scissor(ScissorRect::new(0, 0, 8, 8));
    let mut spot = ShadowFrustum::new(
        FrustumType::PerObject,
        light_frustum(projector.position, projector.direction(), projector.radius, 60.0),
    );
    spot.use_shadow_pool = true;
    frame.add_pooled_light(projector, [spot]);

    let mut area = Light::new(LightId(0), Vec3::new(2.0, 0.0, 0.0), 2.0)
        .with_flags(LightFlags::AREA)
        .with_scissor(ScissorRect::new(12, 12, 8, 8));
    area.area_width = 1.0;
    area.area_height = 0.5;
    area.basis = Mat3::from_rotation_y(0.3);
    let mut panel = ShadowFrustum::new(FrustumType::PerObject, Mat4::perspective_rh(1.0, 1.0, 0.1, 2.0));
    panel.use_shadow_pool = true;
    frame.add_pooled_light(area, [panel]);

    let metrics = pipeline.render_frame(&mut dev, &mut frame);

    assert_eq!(metrics.placed_lights, 2);
    assert_eq!(metrics.channels_in_use, 1);
    assert_eq!(metrics.composited_sides, 2);
    let draws = mask_draws(&dev);
    assert_eq!(draws.len(), 2);
    assert!(draws.iter().all(|draw| draw.technique == Some(Technique::ShadowMaskGenVolume)));
}

#[test]
fn scissor_follows_the_light_rect() {
    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let mut frame = frame_from(Vec3::new(0.0, 0.0, 20.0));
    add_omni(&mut frame, 1.0, ScissorRect::new(2, 2, 4, 4));

    pipeline.render_frame(&mut dev, &mut frame);

    assert!(dev.commands().contains(&DeviceCommand::Scissor(Some(ScissorRect::new(2, 2, 5, 5)))));
    assert_eq!(dev.scissor(), None);

    let mut dev = device();
    let config = ShadowMaskConfig { deferred_shading_scissor: false, ..Default::default() };
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, config).expect("pipeline");
    pipeline.render_frame(&mut dev, &mut frame);
    assert!(!dev.commands().iter().any(|command| matches!(command, DeviceCommand::Scissor(Some(_)))));
}

#[test]
fn dropped_lights_are_never_shaded() {
    let mut dev = device();
    let config = ShadowMaskConfig { mask_slices: 1, ..Default::default() };
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, config).expect("pipeline");
    let mut frame = frame_from(Vec3::new(0.0, 0.0, 20.0));
    let lights: Vec<LightId> = (0..5).map(|_| add_omni(&mut frame, 1.0, ScissorRect::new(0, 0, 24, 24))).collect();

    let metrics = pipeline.render_frame(&mut dev, &mut frame);

    assert_eq!(metrics.dropped_lights, 1);
    assert_eq!(metrics.composited_sides, 4 * 6);
    assert_eq!(mask_draws(&dev).len(), 24);
    assert_eq!(frame.light(lights[4]).and_then(|light| light.mask_channel), None);
}

#[test]
fn omni_winding_flip_cancels_inside_a_mirrored_view() {
    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let mut frame = frame_from(Vec3::new(0.0, 0.0, 20.0));
    add_omni(&mut frame, 1.0, ScissorRect::new(0, 0, 24, 24));

    pipeline.render_frame(&mut dev, &mut frame);
    assert_eq!(back_face_culls(&dev), vec![CullMode::Back; 6]);

    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    pipeline.context_mut().pers_flags.insert(PersFlags::MIRROR_CULL);
    pipeline.render_frame(&mut dev, &mut frame);
    assert_eq!(back_face_culls(&dev), vec![CullMode::Front; 6]);
    assert!(pipeline.context().pers_flags.contains(PersFlags::MIRROR_CULL));
}

#[test]
fn projectors_follow_the_view_mirroring() {
    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let mut frame = frame_from(Vec3::new(0.0, 0.0, 20.0));
    add_projector(&mut frame);

    pipeline.render_frame(&mut dev, &mut frame);
    assert_eq!(back_face_culls(&dev), vec![CullMode::Front]);

    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    pipeline.context_mut().pers_flags.insert(PersFlags::MIRROR_CULL);
    pipeline.render_frame(&mut dev, &mut frame);
    assert_eq!(back_face_culls(&dev), vec![CullMode::Back]);
}

#[test]
fn front_faces_take_their_own_pass_without_depth_clip_control() {
    let mut dev = SoftDevice::new(24, 24, DeviceCaps { depth_clip_control: false, stencil_texture_sampling: true });
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let mut frame = frame_from(Vec3::new(0.0, 0.0, 20.0));
    add_omni(&mut frame, 1.0, ScissorRect::new(0, 0, 24, 24));

    pipeline.render_frame(&mut dev, &mut frame);

    let back = cull_draws(&dev, ShadowGenPass::ShadowFrustumCullPass);
    assert_eq!(back.len(), 6);
    assert!(back.iter().all(|draw| draw.stencil.depth_fail == StencilOp::Replace && draw.depth_clip));
    let front = cull_draws(&dev, ShadowGenPass::ShadowFrustumCullPassFrontFacing);
    assert_eq!(front.len(), 6);
    assert!(front.iter().all(|draw| draw.stencil.depth_fail == StencilOp::Zero));

    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    pipeline.render_frame(&mut dev, &mut frame);
    assert!(cull_draws(&dev, ShadowGenPass::ShadowFrustumCullPassFrontFacing).is_empty());
    let shared = cull_draws(&dev, ShadowGenPass::ShadowFrustumCullPass);
    assert_eq!(shared.len(), 12);
    assert!(shared.iter().any(|draw| draw.stencil.depth_fail == StencilOp::Replace && !draw.depth_clip));
}
