//! Built-in pipeline stages.

mod csv;
mod forward;
mod merge;
mod print;
mod store_perf;
mod store_resctrl;

pub use forward::QueueForwarder;
pub use merge::{Merger, MERGER_NAME};
pub use print::PrintHandler;
pub use store_perf::StorePerf;
pub use store_resctrl::StoreResCtrl;
