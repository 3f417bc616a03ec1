use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    pub buffer_pool_size: usize,
    pub replacer_k: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_pool_size: 1000,
            replacer_k: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockManagerConfig {
    pub cycle_detection_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        LockManagerConfig {
            cycle_detection_interval: Duration::from_millis(50),
        }
    }
}
