//! Job queues shared between the dispatcher and the worker pool.
//!
//! - `BlockingQueue`: bounded/unbounded blocking deque
//! - `BroadcastQueue`: publisher/subscriber accounting plus poison-pill shutdown

mod blocking;
mod broadcast;

pub use blocking::BlockingQueue;
pub use broadcast::{BroadcastQueue, Signal};
