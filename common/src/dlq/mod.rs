// Dead letter recovery: ownership of DLQs and the retry daemon draining them

pub mod ownership;
pub mod retrier;

pub use ownership::{DlqOwnership, OwnedQueue};
pub use retrier::{DrainReport, RetryDaemon, RetryOptions};
