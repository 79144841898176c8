//! Pooled message buffers
//!
//! Encoding and reading frames happens for every signaling message, so the
//! byte buffers backing them are recycled through a [`BufferPool`] instead of
//! being allocated per message.
//!
//! ```text
//!   BufferPool::acquire() ──► PooledBuffer ──► Message (Arc<PooledBuffer>)
//!          ▲                                       │ clone per queue
//!          │                                       ▼
//!          └────────── last reference dropped ◄── written to transport
//! ```
//!
//! A [`Message`] shares its buffer through an `Arc`, so handing the same
//! message to several connections only bumps an atomic reference count. When
//! the last reference goes away the allocation returns to the pool.

pub mod message;
pub mod pool;

pub use message::{FrameKind, Message};
pub use pool::{BufferPool, PooledBuffer};
