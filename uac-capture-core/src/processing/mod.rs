pub mod gain_stage;
pub mod ring_buffer;
pub mod wav_format;
