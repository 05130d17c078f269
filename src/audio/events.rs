//! Engine command queue
//!
//! Voice commands cross from control threads (the score player, live
//! keyboard input) into the render callback through a ring buffer. The
//! producer side is mutex-guarded for multi-producer access; the consumer
//! side is drained with `try_lock` so the audio thread never blocks; a
//! held lock just defers the batch to the next callback.

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;

use super::sampler::{EnvelopeSettings, SampleBuffer};

/// Commands applied by the render loop before mixing each block.
pub enum EngineCommand {
    /// Start a synthesized-waveform voice bound to `voice_id`.
    WaveOn {
        voice_id: String,
        buffer: Arc<Vec<f32>>,
        gain: f32,
        attack: f32,
    },
    /// Start a sample voice bound to `voice_id`.
    SampleOn {
        voice_id: String,
        buffer: Arc<SampleBuffer>,
        frequency: f64,
        base_frequency: f64,
        velocity: f32,
        env: EnvelopeSettings,
        looped: bool,
    },
    /// Note-off for one voice (both pools; whichever holds the binding acts).
    Release { voice_id: String, release: f32 },
    /// Graceful note-off for everything (pause).
    ReleaseAll { release: f32 },
    /// Hard micro-fade cutoff for everything (stop/shutdown).
    SilenceAll,
}

pub struct CommandQueue {
    producer: Mutex<ringbuf::HeapProd<EngineCommand>>,
    consumer: Mutex<ringbuf::HeapCons<EngineCommand>>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        let rb = HeapRb::new(capacity);
        let (producer, consumer) = rb.split();
        Self {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            capacity,
        }
    }

    /// Push a command. Returns false (command dropped) when the queue is
    /// full or the producer lock is contended; dropping beats blocking.
    pub fn push(&self, command: EngineCommand) -> bool {
        if let Some(mut producer) = self.producer.try_lock() {
            if producer.try_push(command).is_ok() {
                return true;
            }
            log::debug!(
                "engine command queue full (capacity {}), command dropped",
                self.capacity
            );
        }
        false
    }

    /// Drain everything into `buffer` (cleared first). Called from the
    /// render loop; uses `try_lock` so it never blocks the audio thread.
    pub fn drain_into(&self, buffer: &mut Vec<EngineCommand>) -> usize {
        buffer.clear();
        if let Some(mut consumer) = self.consumer.try_lock() {
            while let Some(command) = consumer.try_pop() {
                buffer.push(command);
            }
        }
        buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer
            .try_lock()
            .map(|c| c.is_empty())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(id: &str) -> EngineCommand {
        EngineCommand::Release {
            voice_id: id.to_string(),
            release: 0.3,
        }
    }

    #[test]
    fn push_then_drain_preserves_order() {
        let queue = CommandQueue::new(16);
        assert!(queue.push(release("a")));
        assert!(queue.push(release("b")));
        assert!(queue.push(EngineCommand::SilenceAll));

        let mut buffer = Vec::new();
        assert_eq!(queue.drain_into(&mut buffer), 3);
        match &buffer[0] {
            EngineCommand::Release { voice_id, .. } => assert_eq!(voice_id, "a"),
            _ => panic!("expected Release first"),
        }
        assert!(matches!(buffer[2], EngineCommand::SilenceAll));
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_drops_instead_of_blocking() {
        let queue = CommandQueue::new(2);
        assert!(queue.push(release("a")));
        assert!(queue.push(release("b")));
        assert!(!queue.push(release("c")));

        let mut buffer = Vec::new();
        assert_eq!(queue.drain_into(&mut buffer), 2);
    }
}
