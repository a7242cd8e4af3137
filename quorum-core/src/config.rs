/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum buffered out-of-order operations. Oldest dropped first.
    pub max_pending_ops: usize,
    /// Remote deliveries a buffered operation survives before it is dropped.
    pub max_pending_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pending_ops: 10_000,
            max_pending_attempts: 256,
        }
    }
}

impl EngineConfig {
    /// Config for testing (tiny buffer, short retry window).
    pub fn for_testing() -> Self {
        Self {
            max_pending_ops: 8,
            max_pending_attempts: 3,
        }
    }
}
