pub mod harmonic;
pub mod loop_extend;
pub mod plan;
pub mod tempo;
pub mod transition;
