//! Change detection against the last transmitted snapshot.

use crate::codec::StateBlock;

/// Decides whether a fresh snapshot warrants a send.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector {
    tolerance: f32,
}

impl ChangeDetector {
    /// `tolerance` is the largest per-field difference still treated as unchanged.
    /// Zero (or anything non-positive) means exact byte comparison.
    pub fn new(tolerance: f32) -> Self {
        Self {
            tolerance: if tolerance.is_finite() { tolerance.max(0.0) } else { 0.0 },
        }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// A snapshot with nothing to compare against always differs.
    pub fn differs(&self, snapshot: &StateBlock, last: Option<&StateBlock>) -> bool {
        let Some(last) = last else {
            return true;
        };
        if self.tolerance == 0.0 {
            return snapshot != last;
        }
        snapshot
            .fields()
            .iter()
            .zip(last.fields().iter())
            .any(|(a, b)| !((a - b).abs() <= self.tolerance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::EntityStateCodec, entity::EntityTransform, math::Vec3};

    fn block_at(x: f32) -> StateBlock {
        EntityStateCodec::capture(&EntityTransform::at(Vec3::new(x, 0.0, 0.0)))
    }

    #[test]
    fn empty_history_is_changed() {
        assert!(ChangeDetector::default().differs(&block_at(0.0), None));
    }

    #[test]
    fn exact_comparison() {
        let d = ChangeDetector::default();
        assert!(!d.differs(&block_at(1.0), Some(&block_at(1.0))));
        assert!(d.differs(&block_at(1.0), Some(&block_at(1.0001))));
    }

    #[test]
    fn tolerance_absorbs_jitter() {
        let d = ChangeDetector::new(0.01);
        assert!(!d.differs(&block_at(1.0), Some(&block_at(1.005))));
        assert!(d.differs(&block_at(1.0), Some(&block_at(1.5))));
    }

    #[test]
    fn nan_field_counts_as_change() {
        let d = ChangeDetector::new(0.5);
        assert!(d.differs(&block_at(f32::NAN), Some(&block_at(0.0))));
    }
}
