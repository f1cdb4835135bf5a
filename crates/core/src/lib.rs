//! Speech to IPA recognition, IPA to speech rendering, and the acoustic
//! analysis that checks both.

pub mod analysis;
pub mod config;
pub mod pipeline;
pub mod recognize;
pub mod render;
pub mod util;
pub mod waveform;
