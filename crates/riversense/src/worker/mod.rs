pub mod pool;
pub mod report;

pub use pool::WorkerPool;
pub use report::JobReport;
