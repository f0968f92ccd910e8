pub mod backend;
pub mod entity;
pub mod sqlite;
pub mod store;
pub mod window;
