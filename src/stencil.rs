/// Largest stencil reference value handed out before the buffer must be cleared.
pub const STENC_MAX_REF: u32 = 255;

/// First reference value after a light-volume reset. Zero is the cleared value and
/// one is reserved for the first volume marked after a clear.
pub const STENCIL_RESET_BASE: u32 = 2;

/// Generation counter shared by every stencil user of a frame.
///
/// The counter itself never touches the device. Operations that overflow report it so
/// the caller can clear the stencil buffer before the returned reference is used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StencilRefCounter {
    value: u32,
    resets: u32,
}

impl StencilRefCounter {
    pub fn new(value: u32) -> Self {
        debug_assert!(value <= STENC_MAX_REF);
        Self { value: value.min(STENC_MAX_REF), resets: 0 }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn reference(&self) -> u8 {
        self.value.min(STENC_MAX_REF) as u8
    }

    /// Number of times the counter wrapped back to a base value.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Advances to the next light-volume reference. Returns `true` when the counter
    /// wrapped and the stencil buffer has to be cleared.
    #[must_use]
    pub fn advance(&mut self) -> bool {
        self.value += 1;
        if self.value > STENC_MAX_REF {
            self.value = STENCIL_RESET_BASE;
            self.resets += 1;
            return true;
        }
        false
    }

    /// Reserves `sides + 1` references for a multi-sided light.
    #[must_use]
    pub fn reserve(&mut self, sides: u32) -> bool {
        self.value += sides + 1;
        if self.value > STENC_MAX_REF {
            self.value = sides + 1;
            self.resets += 1;
            return true;
        }
        false
    }

    /// Returns the references consumed by the per-side decrements of a reservation.
    pub fn release(&mut self, sides: u32) {
        self.value = (self.value + sides).min(STENC_MAX_REF);
    }

    pub fn decrement(&mut self) {
        self.value = self.value.saturating_sub(1);
    }

    pub fn set(&mut self, value: u32) {
        debug_assert!(value <= STENC_MAX_REF, "stencil reference {value} out of range");
        self.value = value.min(STENC_MAX_REF);
    }
}

/// How a stencil cull pass picks its function and reference value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StencilCullId {
    /// Write this exact value where the back faces fail the depth test.
    Mark(u8),
    /// Fresh light-volume reference from the shared counter (`GEQUAL`).
    Volume,
    /// Legacy: pre-decrement the counter, test `GEQUAL`.
    LegacyGequal,
    /// Legacy: pre-decrement the counter, test `LEQUAL`. Unconfirmed caller.
    LegacyLequal,
    /// Peel one layer: `EQUAL` against the counter, decrement on depth fail.
    Shrink,
}

impl StencilCullId {
    pub fn from_raw(id: i32) -> Self {
        match id {
            id if id >= 0 => StencilCullId::Mark(id.min(STENC_MAX_REF as i32) as u8),
            -4 => StencilCullId::Shrink,
            -3 => StencilCullId::LegacyLequal,
            -2 => StencilCullId::LegacyGequal,
            _ => StencilCullId::Volume,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            StencilCullId::Mark(id) => id as i32,
            StencilCullId::Volume => -1,
            StencilCullId::LegacyGequal => -2,
            StencilCullId::LegacyLequal => -3,
            StencilCullId::Shrink => -4,
        }
    }

    /// Sentinel ids run the front-face pass; explicit marks only touch back faces.
    pub fn uses_front_faces(self) -> bool {
        !matches!(self, StencilCullId::Mark(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_wraps_to_base() {
        let mut counter = StencilRefCounter::new(STENC_MAX_REF - 1);
        assert!(!counter.advance());
        assert_eq!(counter.value(), STENC_MAX_REF);
        assert!(counter.advance());
        assert_eq!(counter.value(), STENCIL_RESET_BASE);
        assert_eq!(counter.resets(), 1);
    }

    #[test]
    fn reserve_resets_to_side_count() {
        let mut counter = StencilRefCounter::new(250);
        assert!(counter.reserve(6));
        assert_eq!(counter.value(), 7);
        assert!(!counter.reserve(6));
        assert_eq!(counter.value(), 14);
    }

    #[test]
    fn release_saturates() {
        let mut counter = StencilRefCounter::new(STENC_MAX_REF);
        counter.release(3);
        assert_eq!(counter.value(), STENC_MAX_REF);
    }

    #[test]
    fn sentinel_round_trip() {
        for raw in [-4, -3, -2, -1, 0, 7] {
            assert_eq!(StencilCullId::from_raw(raw).raw(), raw);
        }
        assert_eq!(StencilCullId::from_raw(-9), StencilCullId::Volume);
        assert!(!StencilCullId::Mark(3).uses_front_faces());
        assert!(StencilCullId::Shrink.uses_front_faces());
    }
}
