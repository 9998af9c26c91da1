pub mod async_task;
pub mod observability;
pub mod time;

pub use observability::init_observability;
