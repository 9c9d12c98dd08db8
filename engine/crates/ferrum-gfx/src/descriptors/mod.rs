pub mod slot_allocator;
