pub mod describer;
pub mod info;
pub mod meta;
pub mod options;
pub mod session;
