use ringbuf::{traits::*, HeapRb};

/// Re-chunks an arbitrary-sized sample stream into fixed-size blocks.
///
/// Capture devices deliver callbacks of whatever size the host picks; the
/// wire wants one frame per fixed block. When the backlog exceeds the ring
/// capacity the oldest samples are dropped so stale audio never piles up.
pub struct BlockAssembler {
    buffer: HeapRb<f32>,
    block_size: usize,
}

impl BlockAssembler {
    /// Create an assembler emitting `block_size` samples per block.
    ///
    /// `capacity` is clamped to at least two blocks.
    pub fn new(block_size: usize, capacity: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            buffer: HeapRb::new(capacity.max(block_size * 2)),
            block_size,
        }
    }

    /// Append samples, returns how many old samples were evicted to make room
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let mut evicted = 0;

        for &sample in samples {
            if self.buffer.try_push(sample).is_err() {
                let _ = self.buffer.try_pop();
                let _ = self.buffer.try_push(sample);
                evicted += 1;
            }
        }

        evicted
    }

    /// Take the next complete block, if one is buffered
    pub fn next_block(&mut self) -> Option<Vec<f32>> {
        if self.buffer.occupied_len() < self.block_size {
            return None;
        }

        let mut block = vec![0.0f32; self.block_size];
        let read = self.buffer.pop_slice(&mut block);
        debug_assert_eq!(read, self.block_size);
        Some(block)
    }

    /// Samples waiting for the next block
    pub fn len(&self) -> usize {
        self.buffer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Discard any partial block
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
