pub mod buffer;
pub mod decode;
pub mod dsp;
pub mod resample;

pub use buffer::WaveformBuffer;
