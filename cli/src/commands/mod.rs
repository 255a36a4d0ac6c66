pub mod conversation;
pub mod health;
pub mod message;
pub mod session;
pub mod voice;
