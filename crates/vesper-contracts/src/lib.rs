pub mod chat;
pub mod effects;
pub mod events;
pub mod models;
pub mod render;
