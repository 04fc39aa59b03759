#![cfg_attr(not(test), no_std)]

pub mod frame_allocator;

pub use self::frame_allocator::FrameAllocator;
