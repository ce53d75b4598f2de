//! Mock implementations for testing pipeline components.

use crate::Error;
use std::sync::{Arc, Mutex};

/// One invocation of the compute boundary, as observed by [Processor].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call<V> {
    pub elements: Vec<V>,
    pub flush: bool,
    pub shutdown: bool,
}

/// A [crate::Processor] that records every invocation and can be told to
/// fail.
///
/// Clones share state: keep one handle for assertions while the worker owns
/// another.
pub struct Processor<V> {
    calls: Arc<Mutex<Vec<Call<V>>>>,
    fail_on: Option<usize>,
}

impl<V> Clone for Processor<V> {
    fn clone(&self) -> Self {
        Self {
            calls: self.calls.clone(),
            fail_on: self.fail_on,
        }
    }
}

impl<V> Default for Processor<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Processor<V> {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_on: None,
        }
    }

    /// Fail the call with index `call` (0-based) and every call after it.
    pub fn failing(call: usize) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_on: Some(call),
        }
    }

    /// Snapshot of every invocation so far.
    pub fn calls(&self) -> Vec<Call<V>>
    where
        V: Clone,
    {
        self.calls.lock().unwrap().clone()
    }
}

impl<V: Clone + Send + Sync + 'static> crate::Processor for Processor<V> {
    type Element = V;

    async fn process(
        &mut self,
        elements: &[V],
        flush: bool,
        shutdown: bool,
    ) -> Result<(), Error> {
        let mut calls = self.calls.lock().unwrap();
        let index = calls.len();
        calls.push(Call {
            elements: elements.to_vec(),
            flush,
            shutdown,
        });
        if let Some(fail_on) = self.fail_on {
            if index >= fail_on {
                return Err(Error::Processor("mock failure".to_string()));
            }
        }
        Ok(())
    }
}
