pub mod chat;
pub mod classifications;
pub mod messages;
pub mod metadata;
