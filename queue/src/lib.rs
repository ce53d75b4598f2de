//! Buffering primitives for event pipelines.
//!
//! This crate provides the two queue implementations that sit between event
//! producers and consumers in a pipeline:
//!
//! - [acked::Queue]: a durable, page-structured queue with explicit
//!   acknowledgement, periodic checkpoints, and crash recovery. Use it when
//!   in-flight events must survive a process crash (at-least-once delivery).
//! - [batch::Queue]: a bounded in-memory queue that hands readers the whole
//!   batch-in-progress in one swap. Use it when durability is not required
//!   and latency matters.
//!
//! Both are single-purpose state machines: they never spawn tasks and never
//! block a thread. Coordinating concurrent producers and consumers around
//! them (mailboxes, backpressure, read timeouts) is the job of the
//! `conduit-pipeline` crate.
//!
//! # Status
//!
//! `conduit-queue` is ALPHA software and its storage layout may still change
//! between versions.

pub mod acked;
pub mod batch;
