use std::time::Duration;

/// Tunables of a [`VM`](crate::VM) instance.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Period of the interrupt ticker.
    pub interrupt_interval: Duration,
    /// Whether a ticker thread drives interrupt checks. Without it checks
    /// only happen when something requests one explicitly.
    pub ticker: bool,
    /// Native activations allowed before a send fails with a stack overflow.
    pub max_frames: usize,
    /// Receiver classes a call site remembers before going megamorphic.
    pub inline_cache_size: usize,
    /// Number of process priority levels (1-based, highest runs first).
    pub priorities: usize,
    /// Priority of the process that runs the first top-level context.
    pub bootstrap_priority: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            interrupt_interval: Duration::from_millis(3),
            ticker: true,
            max_frames: 4096,
            inline_cache_size: 6,
            priorities: 80,
            bootstrap_priority: 40,
        }
    }
}

impl VmConfig {
    /// No ticker thread; tests drive interrupt checks by hand.
    pub fn quiet() -> Self {
        Self {
            ticker: false,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.priorities == 0 {
            return Err("at least one priority level is required");
        }
        if self.bootstrap_priority == 0 || self.bootstrap_priority > self.priorities {
            return Err("bootstrap priority must be within 1..=priorities");
        }
        if self.inline_cache_size == 0 {
            return Err("inline cache size must be > 0");
        }
        if self.max_frames == 0 {
            return Err("max_frames must be > 0");
        }
        Ok(())
    }
}
