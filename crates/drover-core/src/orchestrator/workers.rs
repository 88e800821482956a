//! Concurrent executions, tracked outside their tasks so an attempt can be
//! settled even when its worker never hands a result back.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::{AbortHandle, Id, JoinSet};
use tracing::warn;

/// How a worker ended.
#[derive(Debug)]
pub enum Finished<T> {
    Done(T),
    Panicked(String),
    /// Cancelled through its abort handle or by runtime shutdown.
    Aborted,
}

/// A `JoinSet` plus the context each worker was started with.
pub struct Workers<C, T> {
    set: JoinSet<std::thread::Result<T>>,
    context: HashMap<Id, C>,
}

impl<C, T: Send + 'static> Workers<C, T> {
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
            context: HashMap::new(),
        }
    }

    pub fn spawn<F>(&mut self, context: C, work: F) -> AbortHandle
    where
        F: Future<Output = T> + Send + 'static,
    {
        let handle = self.set.spawn(AssertUnwindSafe(work).catch_unwind());
        self.context.insert(handle.id(), context);
        handle
    }

    /// Next worker to end, with its context. `None` once all have ended.
    pub async fn join_next(&mut self) -> Option<(C, Finished<T>)> {
        loop {
            let (id, finished) = match self.set.join_next_with_id().await? {
                Ok((id, Ok(value))) => (id, Finished::Done(value)),
                Ok((id, Err(panic))) => (id, Finished::Panicked(panic_message(panic.as_ref()))),
                Err(e) => {
                    warn!(error = %e, "execution worker did not finish");
                    (e.id(), Finished::Aborted)
                }
            };
            match self.context.remove(&id) {
                Some(context) => return Some((context, finished)),
                None => warn!(worker = %id, "ended worker has no tracked context"),
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn panic_messages() {
        let s: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(s.as_ref()), "boom");
        let s: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(s.as_ref()), "bang");
        let s: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(s.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn results_come_back_with_their_context() {
        let mut workers: Workers<&str, u32> = Workers::new();
        workers.spawn("light-0", async { 7 });

        let (context, finished) = workers.join_next().await.unwrap();
        assert_eq!(context, "light-0");
        assert!(matches!(finished, Finished::Done(7)));
        assert!(workers.context.is_empty());
        assert!(workers.join_next().await.is_none());
    }

    #[tokio::test]
    async fn panics_are_caught() {
        let mut workers: Workers<&str, ()> = Workers::new();
        workers.spawn("light-1", async { panic!("agent exploded") });

        let (context, finished) = workers.join_next().await.unwrap();
        assert_eq!(context, "light-1");
        match finished {
            Finished::Panicked(message) => assert_eq!(message, "agent exploded"),
            other => panic!("expected a panic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn aborted_worker_still_yields_its_context() {
        let mut workers: Workers<&str, ()> = Workers::new();
        let handle = workers.spawn("gpu_light-0", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        workers.spawn("light-0", async {});
        handle.abort();

        let mut ended = Vec::new();
        while let Some((context, finished)) = workers.join_next().await {
            ended.push((context, matches!(finished, Finished::Aborted)));
        }
        ended.sort();
        assert_eq!(ended, vec![("gpu_light-0", true), ("light-0", false)]);
    }
}
