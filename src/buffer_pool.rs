use std::time::Duration;

use tokio::sync::Mutex;

const MAX_POOLED: usize = 100;
const SMALL: usize = 8_192;
const LARGE: usize = 16_384;

/// Relay buffer size class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSize {
    Small,
    Large,
}

impl BufferSize {
    /// Long lived tunnels get the large buffers.
    pub fn for_idle_timeout(idle: Duration) -> Self {
        if idle > Duration::from_secs(300) {
            BufferSize::Large
        } else {
            BufferSize::Small
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            BufferSize::Small => SMALL,
            BufferSize::Large => LARGE,
        }
    }
}

/// Reusable relay buffers, backed by async-aware mutexes
pub struct BufferPool {
    small: Mutex<Vec<Vec<u8>>>,
    large: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            small: Mutex::new(Vec::with_capacity(MAX_POOLED)),
            large: Mutex::new(Vec::with_capacity(MAX_POOLED)),
        }
    }

    fn slot(&self, size: BufferSize) -> &Mutex<Vec<Vec<u8>>> {
        match size {
            BufferSize::Small => &self.small,
            BufferSize::Large => &self.large,
        }
    }

    /// Get a zeroed buffer from the pool or allocate a new one
    pub async fn get(&self, size: BufferSize) -> Vec<u8> {
        match self.slot(size).lock().await.pop() {
            Some(buffer) => buffer,
            None => vec![0u8; size.bytes()],
        }
    }

    /// Return a buffer for reuse; buffers of the wrong size are dropped
    pub async fn put(&self, mut buffer: Vec<u8>, size: BufferSize) {
        let expected = size.bytes();
        if buffer.len() != expected || buffer.capacity() > expected * 2 {
            return;
        }
        // no data leaks between tunnels
        buffer.fill(0);

        let mut pool = self.slot(size).lock().await;
        if pool.len() < MAX_POOLED {
            pool.push(buffer);
        }
    }

    #[cfg(test)]
    pub async fn pooled(&self, size: BufferSize) -> usize {
        self.slot(size).lock().await.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
