use deferred_shadows::device::DeviceCaps;
use deferred_shadows::frustum::ShadowFrustum;
use deferred_shadows::light::{Light, LightId, ScissorRect};
use deferred_shadows::soft_device::DeviceCommand;
use deferred_shadows::stencil::{StencilRefCounter, STENC_MAX_REF};
use deferred_shadows::{ShadowFrame, ShadowMaskConfig, ShadowMaskPipeline, SoftDevice, ViewParameters};
use glam::{Mat4, Vec3};

fn frame_with_lights(count: u32) -> ShadowFrame {
    let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 30.0), Vec3::ZERO, Vec3::Y);
    let mut frame =
        ShadowFrame::new(ViewParameters::new(view, Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0), (32, 32)));
    for i in 0..count {
        // spread out so every light fits in channel 0
        let scissor = ScissorRect::new((i % 8 * 3) as i32, (i / 8 * 3) as i32, 1, 1);
        let position = Vec3::new(i as f32 - count as f32 * 0.5, 0.0, 0.0);
        let light = Light::new(LightId(0), position, 0.5).with_scissor(scissor);
        frame.add_pooled_light(light, [ShadowFrustum::omni(position, 0.05, 0.5)]);
    }
    frame
}

fn stencil_clears(dev: &SoftDevice) -> usize {
    dev.commands().iter().filter(|command| matches!(command, DeviceCommand::ClearStencil(_))).count()
}

#[test]
fn reservations_wrap_and_clear_the_stencil() {
    let mut dev = SoftDevice::new(32, 32, DeviceCaps { depth_clip_control: true, stencil_texture_sampling: true });
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let mut frame = frame_with_lights(40);

    let metrics = pipeline.render_frame(&mut dev, &mut frame);

    assert_eq!(metrics.placed_lights, 40);
    assert_eq!(metrics.channels_in_use, 1);
    assert_eq!(metrics.composited_sides, 240);
    // each omni light nets seven references; the 37th reservation overflows
    assert_eq!(metrics.stencil_resets, 1);
    assert_eq!(stencil_clears(&dev), 2);
    assert_eq!(pipeline.context().stencil_ref.value(), 7 * 4);
}

#[test]
fn small_frames_never_wrap() {
    let mut dev = SoftDevice::new(32, 32, DeviceCaps::default());
    let mut pipeline = ShadowMaskPipeline::new(&mut dev, ShadowMaskConfig::default()).expect("pipeline");
    let mut frame = frame_with_lights(3);

    let metrics = pipeline.render_frame(&mut dev, &mut frame);

    assert_eq!(metrics.stencil_resets, 0);
    assert_eq!(stencil_clears(&dev), 1);
    assert_eq!(pipeline.context().stencil_ref.value(), 1 + 7 * 3);
}

#[test]
fn counter_stays_in_range_under_mixed_use() {
    let mut counter = StencilRefCounter::new(1);
    let mut resets = 0;
    for round in 0..500u32 {
        let sides = if round % 3 == 0 { 6 } else { 1 };
        if counter.reserve(sides) {
            resets += 1;
        }
        for _ in 0..sides {
            counter.decrement();
            assert!(counter.reference() > 0);
        }
        counter.release(sides);
        if counter.advance() {
            resets += 1;
        }
        assert!(counter.value() <= STENC_MAX_REF);
    }
    assert_eq!(counter.resets(), resets);
    assert!(resets > 0);
}
