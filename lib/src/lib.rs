#![no_std]

#[cfg(test)]
extern crate std;

pub mod btree;
pub mod kernel_services;
pub mod klog;
pub mod list;
pub mod path;
pub mod ports;
pub mod pqueue;
pub mod ring_buffer;
pub mod sorted;
pub mod spinlock;

pub use btree::BTreeMap;
pub use klog::KlogLevel;
pub use list::{LinkArena, ListHead, ListLink, NIL};
pub use pqueue::PriorityQueue;
pub use ring_buffer::RingBuffer;
pub use sorted::SortedArray;
pub use spinlock::{IrqMutex, IrqRwLock};
