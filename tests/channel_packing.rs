use deferred_shadows::device::{DeviceCaps, RenderTarget};
use deferred_shadows::frustum::{DepthTextureId, ShadowFrustum};
use deferred_shadows::light::{Light, LightFlags, LightId, ScissorRect};
use deferred_shadows::soft_device::DeviceCommand;
use deferred_shadows::{ShadowFrame, ShadowMaskConfig, ShadowMaskPipeline, SoftDevice, ViewParameters};
use glam::{Mat4, Vec3};

fn device() -> SoftDevice {
    SoftDevice::new(32, 32, DeviceCaps { depth_clip_control: true, stencil_texture_sampling: true })
}

fn frame() -> ShadowFrame {
    let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 20.0), Vec3::ZERO, Vec3::Y);
    ShadowFrame::new(ViewParameters::new(view, Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0), (32, 32)))
}

fn add_omni(frame: &mut ShadowFrame, position: Vec3, scissor: ScissorRect) -> LightId {
    let light = Light::new(LightId(0), position, 2.0).with_scissor(scissor);
    frame.add_pooled_light(light, [ShadowFrustum::omni(position, 0.1, 2.0)])
}

fn add_sun(frame: &mut ShadowFrame) -> LightId {
    let sun = Light::new(LightId(0), Vec3::new(0.0, 100.0, 0.0), 1000.0).with_flags(LightFlags::SUN);
    frame.add_sun(sun, [ShadowFrustum::cascade(0, Mat4::IDENTITY, DepthTextureId(0))])
}

#[test]
fn overlapping_lights_are_split_across_channels() {
    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let mut frame = frame();
    let a = add_omni(&mut frame, Vec3::new(-3.0, 0.0, 0.0), ScissorRect::new(0, 0, 16, 16));
    let b = add_omni(&mut frame, Vec3::new(-1.0, 0.0, 0.0), ScissorRect::new(8, 8, 16, 16));
    let c = add_omni(&mut frame, Vec3::new(3.0, 0.0, 0.0), ScissorRect::new(26, 26, 4, 4));

    let metrics = pipeline.render_frame(&mut dev, &mut frame);

    assert_eq!(metrics.placed_lights, 3);
    assert_eq!(metrics.dropped_lights, 0);
    assert_eq!(metrics.channels_in_use, 2);
    assert_eq!(frame.light(a).and_then(|light| light.mask_channel), Some(0));
    assert_eq!(frame.light(b).and_then(|light| light.mask_channel), Some(1));
    assert_eq!(frame.light(c).and_then(|light| light.mask_channel), Some(0));
    assert_eq!(frame.light(c).and_then(|light| light.mask_slice), Some(0));
    assert_eq!(dev.target_depth(), 0);
}

#[test]
fn sun_keeps_channel_zero_and_exhaustion_drops_lights() {
    let mut dev = device();
    let config = ShadowMaskConfig { mask_slices: 1, ..Default::default() };
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, config).expect("pipeline");
    let mut frame = frame();
    add_sun(&mut frame);
    let rect = ScissorRect::new(4, 4, 8, 8);
    let lights: Vec<LightId> = (0..4).map(|i| add_omni(&mut frame, Vec3::new(i as f32, 0.0, 0.0), rect)).collect();

    let metrics = pipeline.render_frame(&mut dev, &mut frame);

    assert!(metrics.sun_rendered);
    assert_eq!(metrics.channel_budget, 4);
    assert_eq!(metrics.placed_lights, 3);
    assert_eq!(metrics.dropped_lights, 1);
    // three placed channels after the sun plus one pseudo channel for the dropped light
    assert_eq!(metrics.channels_in_use, 5);
    assert_eq!(metrics.packed_channel_stat(), (4 << 16) | 5);

    let channels: Vec<Option<u32>> = lights.iter().map(|&id| frame.light(id).and_then(|l| l.mask_channel)).collect();
    assert_eq!(channels, vec![Some(1), Some(2), Some(3), None]);
    assert_eq!(frame.first_frustum(lights[3]).map(|frustum| frustum.gen_mask), Some(0));
    assert_eq!(frame.first_frustum(lights[0]).map(|frustum| frustum.gen_mask), Some(0x3F));
}

#[test]
fn fifth_channel_switches_to_second_slice() {
    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let mut frame = frame();
    let rect = ScissorRect::new(0, 0, 32, 32);
    let lights: Vec<LightId> = (0..6).map(|i| add_omni(&mut frame, Vec3::new(i as f32, 0.0, 0.0), rect)).collect();

    let metrics = pipeline.render_frame(&mut dev, &mut frame);

    assert_eq!(metrics.channels_in_use, 6);
    let last = frame.light(lights[5]).expect("light");
    assert_eq!((last.mask_slice, last.mask_channel), (Some(1), Some(1)));
    let pushes: Vec<RenderTarget> = dev
        .commands()
        .iter()
        .filter_map(|command| match command {
            DeviceCommand::PushTarget(target) => Some(*target),
            _ => None,
        })
        .collect();
    assert_eq!(pushes, vec![RenderTarget::ShadowMaskSlice(0), RenderTarget::ShadowMaskSlice(1)]);
    assert_eq!(dev.target_depth(), 0);
}

#[test]
fn empty_frames_clear_the_mask_once() {
    let mut dev = device();
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let clears = |dev: &SoftDevice| {
        dev.commands().iter().filter(|command| matches!(command, DeviceCommand::ClearColor(_))).count()
    };

    let mut empty = frame();
    pipeline.render_frame(&mut dev, &mut empty);
    assert_eq!(clears(&dev), 2);
    pipeline.render_frame(&mut dev, &mut empty);
    assert_eq!(clears(&dev), 2);

    let mut lit = frame();
    add_omni(&mut lit, Vec3::ZERO, ScissorRect::new(0, 0, 8, 8));
    pipeline.render_frame(&mut dev, &mut lit);
    dev.clear_log();
    pipeline.render_frame(&mut dev, &mut empty);
    assert_eq!(clears(&dev), 2);
}
