pub mod classifier;
pub mod digester;
pub mod pipeline;
pub mod scanner;
pub mod store;
