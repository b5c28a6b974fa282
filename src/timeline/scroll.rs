use crate::models::settings::NEAR_TOP_THRESHOLD;

/// What a scroll update did to the near-top classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollTransition {
    EnteredTop,
    LeftTop,
    Unchanged,
}

/// Classifies the viewer as near the newest item or not.
///
/// A fresh tracker starts near top, since a timeline opens at its newest item.
#[derive(Debug, Clone)]
pub struct ScrollTracker {
    threshold: f64,
    is_near_top: bool,
}

impl Default for ScrollTracker {
    fn default() -> Self {
        Self::new(NEAR_TOP_THRESHOLD)
    }
}

impl ScrollTracker {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            is_near_top: true,
        }
    }

    pub fn is_near_top(&self) -> bool {
        self.is_near_top
    }

    pub fn update_scroll_offset(&mut self, offset: f64) -> ScrollTransition {
        let near_top = offset < self.threshold;
        let transition = match (self.is_near_top, near_top) {
            (false, true) => ScrollTransition::EnteredTop,
            (true, false) => ScrollTransition::LeftTop,
            _ => ScrollTransition::Unchanged,
        };
        self.is_near_top = near_top;
        transition
    }
}
