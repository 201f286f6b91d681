use smallvec::SmallVec;
use std::ops::Range;

use crate::frame::ShadowFrame;
use crate::light::{LightId, ScissorRect};

/// Lights sharing one mask channel, in placement order.
pub type ChannelLights = SmallVec<[(LightId, ScissorRect); 4]>;

/// Per-frame mapping from mask channel to the lights composited into it.
///
/// Channel `c` lives in slice `c / 4`, component `c % 4`.
#[derive(Clone, Debug, Default)]
pub struct ChannelAssignment {
    channels: Vec<ChannelLights>,
    first_channel: u32,
    channels_in_use: u32,
    dropped: Vec<LightId>,
}

impl ChannelAssignment {
    /// `first_channel` and `channels_in_use` account for channels already taken by the sun.
    pub fn new(budget: u32, first_channel: u32, channels_in_use: u32) -> Self {
        Self {
            channels: vec![ChannelLights::new(); budget as usize],
            first_channel,
            channels_in_use,
            dropped: Vec::new(),
        }
    }

    pub fn budget(&self) -> u32 {
        self.channels.len() as u32
    }

    pub fn first_channel(&self) -> u32 {
        self.first_channel
    }

    /// Highest used channel plus one, with every dropped light counted as an extra channel.
    pub fn channels_in_use(&self) -> u32 {
        self.channels_in_use
    }

    pub fn dropped(&self) -> &[LightId] {
        &self.dropped
    }

    pub fn placed(&self) -> usize {
        self.channels.iter().map(|lights| lights.len()).sum()
    }

    pub fn channel(&self, channel: u32) -> &[(LightId, ScissorRect)] {
        self.channels.get(channel as usize).map(|lights| lights.as_slice()).unwrap_or(&[])
    }

    /// Channels the compositor walks.
    pub fn active_channels(&self) -> Range<u32> {
        self.first_channel..self.channels_in_use.min(self.budget())
    }

    pub fn channel_of(&self, light: LightId) -> Option<u32> {
        self.channels.iter().position(|lights| lights.iter().any(|(id, _)| *id == light)).map(|index| index as u32)
    }

    /// Places `light` in the first channel whose lights it does not overlap.
    ///
    /// Returns `None` and records the light as dropped when every channel conflicts.
    pub fn place(&mut self, light: LightId, rect: ScissorRect) -> Option<u32> {
        let start = self.first_channel as usize;
        let free = self
            .channels
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, lights)| lights.iter().all(|(_, other)| !rect.overlaps(other)))
            .map(|(index, _)| index);

        match free {
            Some(index) => {
                self.channels[index].push((light, rect));
                self.channels_in_use = self.channels_in_use.max(index as u32 + 1);
                Some(index as u32)
            }
            None => {
                self.dropped.push(light);
                self.channels_in_use += 1;
                None
            }
        }
    }
}

/// Packs `candidates` in order. Dropped lights get their first frustum's generation mask cleared.
pub fn pack_lights(
    frame: &mut ShadowFrame,
    candidates: &[LightId],
    budget: u32,
    first_channel: u32,
    channels_in_use: u32,
) -> ChannelAssignment {
    let mut assignment = ChannelAssignment::new(budget, first_channel, channels_in_use);
    for &id in candidates {
        let Some(rect) = frame.light(id).map(|light| light.scissor) else {
            continue;
        };
        if assignment.place(id, rect).is_none() {
            log::debug!("No free shadow mask channel for light {}; dropping its shadow this frame", id.0);
            if let Some(frustum) = frame.first_frustum_mut(id) {
                frustum.gen_mask = 0;
            }
        }
    }
    assignment
}
