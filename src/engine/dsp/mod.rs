pub mod delay;
pub mod drum_voice;
pub mod mod_delay;
pub mod osc;
pub mod reverb;
pub mod sample_player;
pub mod svf;
pub mod waveshaper;
