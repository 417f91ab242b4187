//! Rate limiting logic and state management.

mod counter;
mod key;
mod limiter;
mod queue;

pub use counter::{WindowCounter, WindowStatus};
pub use key::CounterKey;
pub use limiter::{Decision, RateLimiter};
pub use queue::{QueueTicket, RequestQueue};
