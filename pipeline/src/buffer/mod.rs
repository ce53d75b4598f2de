//! Durable buffering between producers and a consumer.
//!
//! [Engine] owns a [conduit_queue::acked::Queue] and serves it over a
//! mailbox: producers hold cloned [Writer]s, the consumer holds a [Reader].
//! All waiting is future-based:
//!
//! - a write received while the queue is at capacity parks until
//!   acknowledgements free room; the producer's `await` is the
//!   backpressure;
//! - a read received while nothing is unread parks until a write arrives;
//!   the consumer bounds the wait with its clock and treats expiry as "no
//!   batch" (the engine returns any undelivered batch to the unread state).
//!
//! Dropping a pending request is cancellation and never loses buffered
//! elements.

mod engine;
mod ingress;
mod metrics;

pub use engine::Engine;
pub use ingress::{Reader, Writer};

/// Configuration for the [Engine].
#[derive(Clone)]
pub struct Config<C> {
    /// Configuration for the underlying durable queue.
    pub queue: conduit_queue::acked::Config<C>,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use commonware_codec::RangeCfg;
    use commonware_macros::{select, test_traced};
    use commonware_runtime::{deterministic, Clock, Metrics, Runner, Spawner};
    use commonware_utils::{NZU32, NZU64};
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    fn test_config(partition: &str) -> Config<(RangeCfg, ())> {
        Config {
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
    fn test_write_read_ack() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = test_config("test_actor_basic");
            let (engine, mut writer, mut reader) =
                Engine::init(context.with_label("buffer"), cfg).await.unwrap();
            engine.start();

            let seq = writer.write(b"zero".to_vec()).await.unwrap();
            assert_eq!(seq, 0);
            writer.write(b"one".to_vec()).await.unwrap();

            let batch = reader.read_batch(10).await.unwrap().unwrap();
            assert_eq!(batch.len(), 2);
            assert!(reader.is_empty().await.unwrap());
            assert!(!reader.is_fully_acked().await.unwrap());

            reader.ack(batch.first_seq(), batch.last_seq()).await.unwrap();
            assert!(reader.is_fully_acked().await.unwrap());
            reader.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_backpressure_released_by_ack() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut cfg = test_config("test_actor_backpressure");
            cfg.queue.max_unread = 2;
            let (engine, mut writer, mut reader) =
                Engine::init(context.with_label("buffer"), cfg).await.unwrap();
            engine.start();

            writer.write(b"a".to_vec()).await.unwrap();
            writer.write(b"b".to_vec()).await.unwrap();

            // A third write parks until capacity frees
            let done = Arc::new(AtomicBool::new(false));
            let flag = done.clone();
            let mut parked = writer.clone();
            context.with_label("producer").spawn(move |_| async move {
                parked.write(b"c".to_vec()).await.unwrap();
                flag.store(true, Ordering::SeqCst);
            });
            context.sleep(Duration::from_millis(10)).await;
            assert!(!done.load(Ordering::SeqCst));

            // Reading alone does not free capacity
            let batch = reader.read_batch(10).await.unwrap().unwrap();
            context.sleep(Duration::from_millis(10)).await;
            assert!(!done.load(Ordering::SeqCst));

            // Acknowledgement does
            reader.ack(batch.first_seq(), batch.last_seq()).await.unwrap();
            context.sleep(Duration::from_millis(10)).await;
            assert!(done.load(Ordering::SeqCst));

            reader.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_read_timeout_then_delivery() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = test_config("test_actor_timeout");
            let (engine, mut writer, mut reader) =
                Engine::init(context.with_label("buffer"), cfg).await.unwrap();
            engine.start();

            // Nothing to read: the bounded wait expires with no batch
            let sleep = context.sleep(Duration::from_millis(20));
            let read = reader.read_batch(10);
            let outcome = select! {
                result = read => {
                    Some(result)
                },
                _ = sleep => {
                    None
                },
            };
            assert!(outcome.is_none());

            // Elements written afterwards are delivered in full
            writer.write(b"a".to_vec()).await.unwrap();
            writer.write(b"b".to_vec()).await.unwrap();
            let batch = reader.read_batch(10).await.unwrap().unwrap();
            assert_eq!(batch.len(), 2);
            assert_eq!(batch.first_seq(), 0);

            reader.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_operations_after_close() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = test_config("test_actor_closed");
            let (engine, mut writer, mut reader) =
                Engine::init(context.with_label("buffer"), cfg).await.unwrap();
            let handle = engine.start();

            writer.write(b"a".to_vec()).await.unwrap();
            reader.close().await.unwrap();
            handle.await.unwrap().unwrap();

            assert!(matches!(
                writer.write(b"b".to_vec()).await,
                Err(Error::Closed)
            ));
            assert!(matches!(reader.read_batch(1).await, Err(Error::Closed)));
        });
    }

    #[test_traced]
    fn test_persistence_across_sessions() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = test_config("test_actor_persist");

            // First session: write five, ack two, close
            {
                let (engine, mut writer, mut reader) =
                    Engine::init(context.with_label("first"), cfg.clone())
                        .await
                        .unwrap();
                engine.start();
                for i in 0..5u8 {
                    writer.write(vec![i]).await.unwrap();
                }
                let batch = reader.read_batch(2).await.unwrap().unwrap();
                reader.ack(batch.first_seq(), batch.last_seq()).await.unwrap();
                reader.close().await.unwrap();
            }

            // Second session: the three unacked elements are redelivered
            {
                let (engine, _writer, mut reader) =
                    Engine::<_, Vec<u8>>::init(context.with_label("second"), cfg.clone())
                        .await
                        .unwrap();
                engine.start();
                let batch = reader.read_batch(10).await.unwrap().unwrap();
                assert_eq!(batch.len(), 3);
                assert_eq!(batch.first_seq(), 2);
                reader.ack(batch.first_seq(), batch.last_seq()).await.unwrap();
                assert!(reader.is_fully_acked().await.unwrap());
                reader.close().await.unwrap();
            }
        });
    }

    #[test_traced]
    fn test_concurrent_producers_preserve_order() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut cfg = test_config("test_actor_producers");
            cfg.queue.max_unread = 4;
            let (engine, writer, mut reader) =
                Engine::init(context.with_label("buffer"), cfg).await.unwrap();
            engine.start();

            for producer in 0..3u8 {
                let mut writer = writer.clone();
                context.with_label("producer").spawn(move |_| async move {
                    for i in 0..8u8 {
                        writer.write(vec![producer, i]).await.unwrap();
                    }
                });
            }

            let mut seen: Vec<Vec<u8>> = Vec::new();
            while seen.len() < 24 {
                let Some(batch) = reader.read_batch(4).await.unwrap() else {
                    continue;
                };
                let (first, last) = (batch.first_seq(), batch.last_seq());
                seen.extend(batch.into_items().into_iter().map(|(_, v)| v));
                reader.ack(first, last).await.unwrap();
            }

            // Each producer's elements arrive in its write order
            for producer in 0..3u8 {
                let order: Vec<u8> = seen
                    .iter()
                    .filter(|v| v[0] == producer)
                    .map(|v| v[1])
                    .collect();
                let expected: Vec<u8> = (0..8).collect();
                assert_eq!(order, expected, "producer {producer} order broken");
            }

            reader.close().await.unwrap();
        });
    }
}
