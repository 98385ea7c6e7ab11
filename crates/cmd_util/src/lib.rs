pub mod env;
pub mod keyvalue;
