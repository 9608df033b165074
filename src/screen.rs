// KTOONSERVATIVE SCREEN-STATE ADAPTER
// SWAPS THE SAMPLING CADENCE BETWEEN ACTIVE USE AND DISPLAY-OFF.
// ONLY THE CADENCE CHANGES; THE ENGINE READS is_on FOR THE 2ND-CORE GATE.

use crate::tuning::Tunables;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScreenState {
    is_on: bool,
    // VALID ONLY WHILE is_on IS FALSE
    saved_sampling_rate: u32,
}

impl Default for ScreenState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScreenState {
    pub fn new() -> Self {
        Self {
            is_on: true,
            saved_sampling_rate: 0,
        }
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn saved_sampling_rate(&self) -> u32 {
        self.saved_sampling_rate
    }

    pub fn on_screen_on(&mut self, tunables: &mut Tunables) {
        if !self.is_on && self.saved_sampling_rate > 0 {
            tunables.sampling_rate = self.saved_sampling_rate;
        }
        self.is_on = true;
    }

    pub fn on_screen_off(&mut self, tunables: &mut Tunables) {
        // A SECOND OFF WOULD SAVE THE SCREEN-OFF RATE OVER THE ACTIVE ONE
        if self.is_on {
            self.saved_sampling_rate = tunables.sampling_rate;
        }
        tunables.sampling_rate = tunables.sampling_rate_screen_off;
        self.is_on = false;
    }
}
