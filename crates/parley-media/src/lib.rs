//! Media pipeline: reframing, chunking, capture, playback, and the
//! transcription/synthesis service links.

pub mod audio;
pub mod capture;
pub mod chunker;
pub mod device;
pub mod playback;
pub mod reframe;
pub mod synthesis;
pub mod transcription;
