use super::{metrics, Config, Signals};
use crate::{Batch, Error, Processor, ReadClient};
use commonware_runtime::{Handle, Metrics, Spawner};
use futures::FutureExt;
use std::sync::atomic::Ordering;
use tracing::{debug, error};

/// The consumer loop: reads batches, drives the compute boundary, closes
/// (acknowledges) batches, and implements the flush/drain/shutdown protocol.
///
/// # Lifecycle
///
/// The loop runs until a shutdown signal is observed. If `drain` is
/// configured, it then keeps consuming until the queue reports empty.
/// Finally it performs exactly one terminal pass (an empty batch computed
/// with `flush = true, shutdown = true`) so downstream stages
/// emit buffered state even if no new elements arrived, and stops.
///
/// A compute failure is fatal: the loop logs it, stops consuming, and
/// surfaces the error through its [Handle]. Retrying internally could
/// silently drop or duplicate the in-flight batch.
pub struct Worker<E, R, P>
where
    E: Spawner + Metrics,
    R: ReadClient,
    P: Processor<Element = R::Element>,
{
    context: E,
    client: R,
    processor: P,
    signals: Signals,

    /// Consume the whole queue before honoring shutdown.
    drain: bool,

    /// Hand elements to the compute step one at a time, preserving arrival
    /// order through filter/output stages at a throughput cost.
    preserve_order: bool,

    metrics: metrics::Metrics,
}

impl<E, R, P> Worker<E, R, P>
where
    E: Spawner + Metrics,
    R: ReadClient,
    R::Element: Sync,
    P: Processor<Element = R::Element>,
{
    pub fn new(context: E, client: R, processor: P, signals: Signals, cfg: Config) -> Self {
        let metrics = metrics::Metrics::init(&context);
        Self {
            context,
            client,
            processor,
            signals,
            drain: cfg.drain,
            preserve_order: cfg.preserve_order,
            metrics,
        }
    }

    /// Start consuming.
    pub fn start(self) -> Handle<Result<(), Error>> {
        let context = self.context.clone();
        context.spawn(|_| self.run())
    }

    async fn run(mut self) -> Result<(), Error> {
        let mut shutdown = self.signals.shutdown.clone();
        let mut stopping = false;
        loop {
            // Observe shutdown between batches, never mid-batch
            if !stopping && (&mut shutdown).now_or_never().is_some() {
                debug!("shutdown observed");
                stopping = true;
            }

            let batch = self.client.read_batch().await?;
            if let Some(batch) = batch {
                if !batch.is_empty() {
                    let count = batch.len() as u64;
                    self.metrics.consumed.inc_by(count);
                    self.metrics.batches.inc();

                    // Test-and-clear: this batch carries any pending flush
                    let flush = self
                        .signals
                        .flush_requested
                        .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok();
                    if flush {
                        self.metrics.flushes.inc();
                    }

                    self.client.start_metrics(&batch);
                    self.process(&batch, flush, false).await?;
                    self.metrics.filtered.inc_by(count);
                    self.client.add_filtered_metrics(count);
                    self.client.add_output_metrics(count);
                    self.client.close_batch(batch).await?;

                    if flush {
                        self.signals.flushing.store(false, Ordering::SeqCst);
                    }
                }
            }

            if stopping && !(self.drain && !self.client.is_empty().await?) {
                break;
            }
        }

        // Terminal pass: downstream stages receive a final flush even if no
        // new elements arrived
        let batch = self.client.new_batch();
        self.client.start_metrics(&batch);
        self.process(&batch, true, true).await?;
        self.client.close_batch(batch).await?;
        self.signals.flushing.store(false, Ordering::SeqCst);
        debug!("stopped");
        Ok(())
    }

    async fn process(
        &mut self,
        batch: &Batch<R::Element>,
        flush: bool,
        shutdown: bool,
    ) -> Result<(), Error> {
        let result = if self.preserve_order && batch.len() > 1 {
            let mut result = Ok(());
            for element in batch.items() {
                result = self
                    .processor
                    .process(std::slice::from_ref(element), flush, shutdown)
                    .await;
                if result.is_err() {
                    break;
                }
            }
            result
        } else {
            self.processor.process(batch.items(), flush, shutdown).await
        };
        if let Err(err) = &result {
            self.metrics.failures.inc();
            error!(
                ?err,
                "compute failed; the worker stopped processing new events"
            );
        }
        result
    }
}
