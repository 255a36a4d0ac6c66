pub mod ledger;
pub mod limiter;

pub use ledger::UsageLedger;
pub use limiter::UsageLimiter;
