//! Exponentially weighted moving average with a variable-weight update.

/// First-order exponential filter.
///
/// `apply(exp, sample)` blends `sample` into the running value with weight
/// `1 - alpha^exp`, so a caller can account for uneven sample spacing by
/// passing the number of periods covered in `exp`. The filter is unset until
/// the first sample, which seeds it directly.
#[derive(Clone, Debug)]
pub struct ExpFilter {
    alpha: f32,
    filtered: Option<f32>,
    max: Option<f32>,
}

impl ExpFilter {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha,
            filtered: None,
            max: None,
        }
    }

    /// Like [`ExpFilter::new`], but the filtered value is capped at `max`.
    pub fn with_max(alpha: f32, max: f32) -> Self {
        Self {
            alpha,
            filtered: None,
            max: Some(max),
        }
    }

    /// Clear the filtered value and install a new base weight.
    pub fn reset(&mut self, alpha: f32) {
        self.alpha = alpha;
        self.filtered = None;
    }

    /// Swap the base weight without losing the filtered value.
    pub fn update_base(&mut self, alpha: f32) {
        self.alpha = alpha;
    }

    /// Fold in `sample`, weighting the history by `alpha^exp`.
    pub fn apply(&mut self, exp: f32, sample: f32) -> f32 {
        let mut value = match self.filtered {
            None => sample,
            Some(prev) => {
                let alpha = if exp == 1.0 {
                    self.alpha
                } else {
                    self.alpha.powf(exp)
                };
                alpha * prev + (1.0 - alpha) * sample
            }
        };
        if let Some(max) = self.max {
            value = value.min(max);
        }
        self.filtered = Some(value);
        value
    }

    /// Current filtered value, `None` before the first sample.
    pub fn filtered(&self) -> Option<f32> {
        self.filtered
    }
}
