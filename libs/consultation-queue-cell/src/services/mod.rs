pub mod broadcaster;
pub mod cache;
pub mod dispatch;
pub mod estimator;
pub mod presence;
pub mod queue;
pub mod store;
pub mod watchdog;

pub use broadcaster::*;
pub use cache::*;
pub use dispatch::*;
pub use estimator::*;
pub use presence::*;
pub use queue::*;
pub use store::*;
pub use watchdog::*;
