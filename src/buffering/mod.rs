//! Audio buffering: the lock-free SPSC sample ring fed by the capture
//! callback, plus the typed chunk and pre-roll types consumed downstream.
//!
//! The ring holds normalized f32 samples at the *device* rate; the source
//! drains it, resamples, and assembles fixed-size i16 [`chunk::AudioChunk`]s.
//! `ringbuf::HeapRb` gives a wait-free `push_slice` safe to call from the
//! real-time audio callback.

pub mod chunk;
pub mod preroll;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half — held by the audio callback thread.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Consumer half — held by the pipeline thread.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Ring capacity: 2^20 = 1 048 576 f32 samples ≈ 21.8 s at 48 kHz.
/// Plenty of slack for the worst case of a full capture cycle plus
/// classification running before the next drain.
pub const RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_sample_ring() -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
