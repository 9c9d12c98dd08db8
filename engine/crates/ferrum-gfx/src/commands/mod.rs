pub mod barrier;
pub mod cmd_allocator;
pub mod command_list;
pub mod command_queue;
pub mod fence;
pub mod submission_context;
