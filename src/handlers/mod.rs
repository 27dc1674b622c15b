pub mod billing;
pub mod chat;
pub mod health;
pub mod usage;
