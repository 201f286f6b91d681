use std::ops::Range;

use crate::config::ShadowMaskConfig;
use crate::frame::ShadowFrame;
use crate::frustum::MAX_CASCADES;
use crate::light::LightId;

/// Casters that need shadow mask work this frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassifiedCasters {
    /// Routed to the cascade sequencer.
    pub sun: Option<LightId>,
    /// Routed to the channel packer, in frame order.
    pub pooled: Vec<LightId>,
}

impl ClassifiedCasters {
    pub fn is_empty(&self) -> bool {
        self.sun.is_none() && self.pooled.is_empty()
    }
}

pub fn classify(frame: &ShadowFrame, config: &ShadowMaskConfig) -> ClassifiedCasters {
    if !config.shadow_passes {
        return ClassifiedCasters::default();
    }

    let sun = frame.sun.filter(|&id| frame.light(id).is_some_and(|light| light.casts_shadows()));

    let mut pooled = Vec::with_capacity(frame.pooled_lights.len());
    for &id in &frame.pooled_lights {
        let Some(light) = frame.light(id) else {
            debug_assert!(false, "pooled light {} is not part of the frame", id.0);
            continue;
        };
        if !light.casts_shadows() {
            debug_assert!(false, "pooled light {} does not cast shadow maps", id.0);
            continue;
        }
        if frame.frustum_range(id).is_empty() {
            log::trace!("Light {} has no shadow frustum this frame", id.0);
            continue;
        }
        pooled.push(id);
    }

    ClassifiedCasters { sun, pooled }
}

/// Leading run of dynamic cascades in the sun's frustum range.
pub fn sun_cascade_range(frame: &ShadowFrame, sun: LightId) -> Range<usize> {
    let range = frame.frustum_range(sun);
    let count = frame.frustums[range.clone()]
        .iter()
        .take_while(|frustum| frustum.frustum_type.is_dynamic_cascade())
        .count();
    if count > MAX_CASCADES as usize {
        log::warn!("Sun has {count} cascades; only the first {MAX_CASCADES} are composited");
    }
    range.start..range.start + count.min(MAX_CASCADES as usize)
}
