pub mod db;
pub mod models;
pub mod payload;
pub mod routes;
pub mod sirh;
pub mod store;
pub mod task;
