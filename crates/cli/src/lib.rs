//! Front ends for charformer checkpoints: a clap command line and a small
//! blocking HTTP service.

pub mod cli;
pub mod serve;
