pub mod project;
pub mod queue;
pub mod storage;
pub mod util;

pub use project::*;
pub use queue::*;
pub use storage::*;
pub use util::*;
