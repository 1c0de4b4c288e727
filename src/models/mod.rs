pub mod chat;
pub mod classification;
pub mod message;
