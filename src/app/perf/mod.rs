pub mod frames;
pub mod parse;
pub mod sampler;
pub mod sink;
