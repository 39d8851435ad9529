pub mod addresses;
pub mod alloc;
pub mod instructions;
pub mod processor;
