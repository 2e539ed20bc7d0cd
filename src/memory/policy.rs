use crate::config::{LeniencyOverride, MemoryOptions};

/// Explicit leniency policy handed to every accountant at construction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryPolicy {
    /// Grace-margin allocation starts enabled
    pub lenient: bool,

    /// `set_lenient()` is refused (force-strict override)
    pub leniency_locked: bool,

    /// Fraction of the limit granted as grace
    pub grace_margin: f64,

    /// Absolute cap on the grace, in bytes
    pub max_grace: u64,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            lenient: false,
            leniency_locked: false,
            grace_margin: 0.10,
            max_grace: 100 * 1024 * 1024,
        }
    }
}

impl MemoryPolicy {
    pub fn strict() -> Self {
        Self {
            lenient: false,
            leniency_locked: true,
            ..Self::default()
        }
    }

    pub fn lenient() -> Self {
        Self {
            lenient: true,
            ..Self::default()
        }
    }

    /// Resolve the tri-state override against the configured default
    pub fn from_options(options: &MemoryOptions) -> Self {
        let (lenient, leniency_locked) = match options.leniency_override {
            LeniencyOverride::ForceLenient => (true, false),
            LeniencyOverride::ForceStrict => (false, true),
            LeniencyOverride::Unset => (options.lenient_allocation, false),
        };
        Self {
            lenient,
            leniency_locked,
            grace_margin: options.grace_margin,
            max_grace: options.max_grace_bytes,
        }
    }

    /// `min(max_grace, limit * grace_margin)`
    pub fn grace_for(&self, limit: i64) -> i64 {
        let margin = (limit.max(0) as f64 * self.grace_margin) as i64;
        let cap = i64::try_from(self.max_grace).unwrap_or(i64::MAX);
        margin.min(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grace_is_capped() {
        let policy = MemoryPolicy::lenient();
        assert_eq!(policy.grace_for(1000), 100);
        assert_eq!(policy.grace_for(10 * 1024 * 1024 * 1024), 100 * 1024 * 1024);
    }

    #[test]
    fn test_override_resolution() {
        let mut options = MemoryOptions {
            lenient_allocation: true,
            ..MemoryOptions::default()
        };
        assert!(MemoryPolicy::from_options(&options).lenient);

        options.leniency_override = LeniencyOverride::ForceStrict;
        let policy = MemoryPolicy::from_options(&options);
        assert!(!policy.lenient);
        assert!(policy.leniency_locked);

        options.lenient_allocation = false;
        options.leniency_override = LeniencyOverride::ForceLenient;
        assert!(MemoryPolicy::from_options(&options).lenient);
    }
}
