pub mod scanner;
pub mod storage;
