pub mod input;
pub mod response;

pub use input::{InputGuard, InputGuardRequest};
pub use response::{ResponseGuard, ResponseGuardRequest};
