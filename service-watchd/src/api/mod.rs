pub mod hash;
pub mod routes;
