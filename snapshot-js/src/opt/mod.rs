pub mod batch;
pub mod dce;

pub use batch::build_batches;
pub use batch::InstBatch;
pub use batch::Param;
pub use dce::eliminate_dead_code;
