//! Numeric kernels for charformer: matmul, softmax, layer norm and masked attention.

pub mod attention;
pub mod config;
pub mod layernorm;
pub mod matmul;
pub mod registry;
pub mod utils;

pub use attention::*;
pub use config::*;
pub use layernorm::*;
pub use matmul::*;
pub use registry::*;
pub use utils::*;
