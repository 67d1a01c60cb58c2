pub mod change;
pub mod friendship;
pub mod message;
pub mod presence;
pub mod summary;
pub mod user;
