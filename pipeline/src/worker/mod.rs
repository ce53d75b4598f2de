//! The consumer side of a pipeline.
//!
//! A [Worker] drives repeated read → compute → acknowledge cycles against
//! any [ReadClient](crate::ReadClient), coordinating with the pipeline owner
//! through an explicit signal bundle rather than process-wide globals:
//! [signals] yields a [Controls] for the owner (request a flush, initiate
//! shutdown) and a [Signals] for the worker. Tests can construct independent
//! worker instances with independent signals.
//!
//! Flush is a test-and-clear handshake: the owner raises `flush_requested`,
//! exactly one subsequent batch carries `flush = true` into the compute
//! step, and `flushing` drops back to false once that batch completes.

mod engine;
mod metrics;

pub use engine::Worker;

use commonware_runtime::{Signal, Signaler};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Configuration for a [Worker].
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    /// Consume all remaining elements before honoring a shutdown request.
    pub drain: bool,

    /// Process elements one at a time in arrival order instead of handing
    /// the compute step whole batches. Systems that need strict
    /// order-preservation across filter/output stages pay the throughput
    /// cost and set this.
    pub preserve_order: bool,
}

/// Create a linked [Controls]/[Signals] pair.
pub fn signals() -> (Controls, Signals) {
    let flush_requested = Arc::new(AtomicBool::new(false));
    let flushing = Arc::new(AtomicBool::new(false));
    let (signaler, shutdown) = Signaler::new();
    (
        Controls {
            flush_requested: flush_requested.clone(),
            flushing: flushing.clone(),
            signaler: Some(signaler),
        },
        Signals {
            flush_requested,
            flushing,
            shutdown,
        },
    )
}

/// Owner-side handle for signaling a [Worker].
pub struct Controls {
    flush_requested: Arc<AtomicBool>,
    flushing: Arc<AtomicBool>,
    signaler: Option<Signaler>,
}

impl Controls {
    /// Ask the worker to carry a flush on its next batch.
    pub fn request_flush(&self) {
        self.flushing.store(true, Ordering::SeqCst);
        self.flush_requested.store(true, Ordering::SeqCst);
    }

    /// Whether a requested flush has not yet completed.
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(mut signaler) = self.signaler.take() {
            signaler.signal(0);
        }
    }
}

/// Worker-side view of the owner's signals.
pub struct Signals {
    pub(crate) flush_requested: Arc<AtomicBool>,
    pub(crate) flushing: Arc<AtomicBool>,
    pub(crate) shutdown: Signal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer,
        client::{AckedReadClient, MemoryReadClient},
        mocks, Error,
    };
    use commonware_codec::RangeCfg;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Clock, Metrics, Runner};
    use commonware_utils::{NZU32, NZU64};
    use std::time::Duration;

    const POLL: Duration = Duration::from_millis(10);

    fn buffer_config(partition: &str) -> buffer::Config<(RangeCfg, ())> {
        buffer::Config {
            queue: conduit_queue::acked::Config {
                partition: partition.to_string(),
                checkpoint_partition: format!("{partition}_checkpoints"),
                page_capacity: NZU32!(1024),
                max_bytes: 1 << 20,
                max_unread: 1024,
                checkpoint_acks: NZU64!(1024),
                compression: None,
                codec_config: ((0..).into(), ()),
            },
            mailbox_size: 64,
        }
    }

    #[test_traced]
    fn test_drain_consumes_everything() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let queue = conduit_queue::batch::Queue::new(16);
            for i in 0..10u32 {
                queue.write(i).await.unwrap();
            }

            let (mut controls, signals) = signals();
            let client = MemoryReadClient::new(context.with_label("client"), queue, POLL);
            let processor = mocks::Processor::new();
            let worker = Worker::new(
                context.with_label("worker"),
                client,
                processor.clone(),
                signals,
                Config {
                    drain: true,
                    preserve_order: false,
                },
            );
            let handle = worker.start();
            controls.shutdown();
            handle.await.unwrap().unwrap();

            // All ten elements were consumed before stopping
            let calls = processor.calls();
            let consumed: usize = calls
                .iter()
                .filter(|call| !call.shutdown)
                .map(|call| call.elements.len())
                .sum();
            assert_eq!(consumed, 10);

            // The terminal pass is one empty flush+shutdown compute
            let last = calls.last().unwrap();
            assert!(last.elements.is_empty());
            assert!(last.flush);
            assert!(last.shutdown);
            assert_eq!(
                calls.iter().filter(|call| call.shutdown).count(),
                1,
                "exactly one terminal pass"
            );
        });
    }

    #[test_traced]
    fn test_no_drain_leaves_remainder_durable() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = buffer_config("test_worker_no_drain");

            // First session: 10 durable elements, shutdown raised before the
            // worker starts, batches limited to 5
            {
                let (engine, mut writer, reader) =
                    buffer::Engine::init(context.with_label("buffer"), cfg.clone())
                        .await
                        .unwrap();
                engine.start();
                for i in 0..10u8 {
                    writer.write(vec![i]).await.unwrap();
                }

                let (mut controls, signals) = signals();
                controls.shutdown();
                let client =
                    AckedReadClient::new(context.with_label("client"), reader.clone(), 5, POLL);
                let processor = mocks::Processor::new();
                let worker = Worker::new(
                    context.with_label("worker"),
                    client,
                    processor.clone(),
                    signals,
                    Config {
                        drain: false,
                        preserve_order: false,
                    },
                );
                worker.start().await.unwrap().unwrap();

                // Only the one in-flight batch was consumed
                let calls = processor.calls();
                let consumed: usize = calls
                    .iter()
                    .filter(|call| !call.shutdown)
                    .map(|call| call.elements.len())
                    .sum();
                assert_eq!(consumed, 5);

                let mut reader = reader;
                reader.close().await.unwrap();
            }

            // Second session: the five unconsumed elements persisted and are
            // redelivered
            {
                let (engine, _writer, mut reader) =
                    buffer::Engine::<_, Vec<u8>>::init(context.with_label("second"), cfg.clone())
                        .await
                        .unwrap();
                engine.start();
                let batch = reader.read_batch(10).await.unwrap().unwrap();
                assert_eq!(batch.len(), 5);
                assert_eq!(batch.first_seq(), 5);
                reader.close().await.unwrap();
            }
        });
    }

    #[test_traced]
    fn test_drain_through_durable_buffer() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = buffer_config("test_worker_drain_acked");
            let (engine, mut writer, reader) =
                buffer::Engine::init(context.with_label("buffer"), cfg).await.unwrap();
            engine.start();
            for i in 0..10u8 {
                writer.write(vec![i]).await.unwrap();
            }

            let (mut controls, signals) = signals();
            controls.shutdown();
            let client = AckedReadClient::new(context.with_label("client"), reader.clone(), 3, POLL);
            let processor = mocks::Processor::new();
            let worker = Worker::new(
                context.with_label("worker"),
                client,
                processor.clone(),
                signals,
                Config {
                    drain: true,
                    preserve_order: false,
                },
            );
            worker.start().await.unwrap().unwrap();

            // Draining consumed all ten (in four batches of <= 3) and acked
            // them
            let calls = processor.calls();
            let consumed: usize = calls
                .iter()
                .filter(|call| !call.shutdown)
                .map(|call| call.elements.len())
                .sum();
            assert_eq!(consumed, 10);
            let mut reader = reader;
            assert!(reader.is_fully_acked().await.unwrap());
            reader.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_preserve_order_single_element_batches() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let queue = conduit_queue::batch::Queue::new(16);
            for i in 0..4u32 {
                queue.write(i).await.unwrap();
            }

            let (mut controls, signals) = signals();
            let client = MemoryReadClient::new(context.with_label("client"), queue, POLL);
            let processor = mocks::Processor::new();
            let worker = Worker::new(
                context.with_label("worker"),
                client,
                processor.clone(),
                signals,
                Config {
                    drain: true,
                    preserve_order: true,
                },
            );
            let handle = worker.start();
            controls.shutdown();
            handle.await.unwrap().unwrap();

            // The compute step saw one element at a time, in arrival order
            let calls = processor.calls();
            let element_calls: Vec<_> =
                calls.iter().filter(|call| !call.shutdown).collect();
            assert_eq!(element_calls.len(), 4);
            for (i, call) in element_calls.iter().enumerate() {
                assert_eq!(call.elements, vec![i as u32]);
            }
        });
    }

    #[test_traced]
    fn test_flush_carried_by_next_batch() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let queue = conduit_queue::batch::Queue::new(16);

            let (mut controls, signals) = signals();
            let client =
                MemoryReadClient::new(context.with_label("client"), queue.clone(), POLL);
            let processor = mocks::Processor::new();
            let worker = Worker::new(
                context.with_label("worker"),
                client,
                processor.clone(),
                signals,
                Config {
                    drain: true,
                    preserve_order: false,
                },
            );
            let handle = worker.start();

            controls.request_flush();
            assert!(controls.is_flushing());
            queue.write(1u32).await.unwrap();

            // Wait until the flush batch has been processed
            while controls.is_flushing() {
                context.sleep(POLL).await;
            }
            let calls = processor.calls();
            let first = calls.first().unwrap();
            assert_eq!(first.elements, vec![1]);
            assert!(first.flush);
            assert!(!first.shutdown);

            controls.shutdown();
            handle.await.unwrap().unwrap();
        });
    }

    #[test_traced]
    fn test_compute_failure_is_fatal() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let queue = conduit_queue::batch::Queue::new(16);
            queue.write(1u32).await.unwrap();
            queue.write(2u32).await.unwrap();

            let (_controls, signals) = signals();
            let client = MemoryReadClient::new(context.with_label("client"), queue, POLL);
            let processor = mocks::Processor::failing(0);
            let worker = Worker::new(
                context.with_label("worker"),
                client,
                processor.clone(),
                signals,
                Config {
                    drain: false,
                    preserve_order: false,
                },
            );
            let result = worker.start().await.unwrap();
            assert!(matches!(result, Err(Error::Processor(_))));

            // No retry happened
            assert_eq!(processor.calls().len(), 1);
        });
    }
}
