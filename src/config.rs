//! Engine configuration.

/// Limits and diagnostics shared by every thread of a `Jvm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Slot arena ceiling per thread.
    pub max_stack_slots: usize,
    /// Call depth ceiling per thread.
    pub max_frames: usize,
    /// Emit one `trace!` event per executed opcode.
    pub trace_opcodes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_stack_slots: 1 << 20,
            max_frames: 4096,
            trace_opcodes: false,
        }
    }
}

impl Config {
    pub fn with_max_stack_slots(mut self, slots: usize) -> Self {
        self.max_stack_slots = slots;
        self
    }

    pub fn with_max_frames(mut self, frames: usize) -> Self {
        self.max_frames = frames;
        self
    }

    pub fn with_trace_opcodes(mut self, enabled: bool) -> Self {
        self.trace_opcodes = enabled;
        self
    }
}
