pub mod fullname;
pub mod protocol;
pub mod types;
