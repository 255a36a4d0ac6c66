pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod identity;
pub mod usage;
pub mod voice;
