pub mod budget;
pub mod common;
pub mod example;
pub mod executor;
pub mod sampler;
pub mod serializer;
pub mod template;
