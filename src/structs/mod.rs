pub mod aligned_buffer;
pub mod deadline;
