//! Shutdown steps, run in reverse registration order.

use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{debug, warn};

type Step = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
pub struct CleanupStack {
    steps: Vec<(&'static str, Step)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&mut self, name: &'static str, step: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push((name, Box::new(move || step().boxed())));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step, last registered first. A failing step does not stop
    /// the ones after it; the failures are returned.
    pub async fn run(&mut self) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        while let Some((name, step)) = self.steps.pop() {
            debug!(step = name, "Running cleanup");
            if let Err(e) = step().await {
                warn!(step = name, error = %e, "Cleanup step failed");
                errors.push(e.context(name));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_lifo_and_continues_after_failure() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for name in ["first", "second", "third"] {
            let order = order.clone();
            stack.push(name, move || async move {
                order.lock().unwrap().push(name);
                if name == "second" {
                    anyhow::bail!("boom");
                }
                Ok(())
            });
        }
        assert_eq!(stack.len(), 3);

        let errors = stack.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "second");
        assert!(stack.is_empty());

        assert!(stack.run().await.is_empty());
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_stack_is_send_and_sync() {
        assert_send_sync::<CleanupStack>();
    }
}
