pub mod cli;
pub mod demos;
