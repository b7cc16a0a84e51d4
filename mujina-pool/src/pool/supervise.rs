//! Panic containment for pool tasks.
//!
//! A panic in a request handler must not take the pool down, and a panic in
//! one of the long-running loops must not stop that loop for good. Handlers
//! are wrapped with [`catch_panic`]; loops are run by [`supervise`], which
//! restarts them after a panic or an error.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::tracing::prelude::*;

/// Delay before a failed loop is started again.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Run `fut`, logging and swallowing a panic. Returns `None` if it panicked.
pub async fn catch_panic<F>(task: &str, fut: F) -> Option<F::Output>
where
    F: Future,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(output) => Some(output),
        Err(payload) => {
            error!(task, panic = panic_message(payload.as_ref()), "Task panicked");
            None
        }
    }
}

/// Run the future produced by `make` until it returns `Ok` or `shutdown`
/// fires, starting a fresh one [`RESTART_DELAY`] after every panic or error.
pub async fn supervise<M, F>(task: &'static str, shutdown: CancellationToken, mut make: M)
where
    M: FnMut() -> F,
    F: Future<Output = Result<()>>,
{
    loop {
        let finished = tokio::select! {
            _ = shutdown.cancelled() => true,
            run = catch_panic(task, make()) => match run {
                Some(Ok(())) => true,
                Some(Err(e)) => {
                    error!(task, error = %e, "Task failed");
                    false
                }
                None => false,
            },
        };
        if finished {
            break;
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(RESTART_DELAY) => {
                warn!(task, "Restarting task");
            }
        }
    }
    trace!(task, "Task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn catch_panic_returns_output() {
        assert_eq!(catch_panic("ok", async { 7 }).await, Some(7));
        let panicked = catch_panic("boom", async {
            panic!("boom");
        })
        .await;
        assert_eq!(panicked, None::<()>);
    }

    #[test]
    fn panic_messages() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");
        let s: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(s.as_ref()), "non-string panic payload");
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_after_panic() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        supervise("flaky", CancellationToken::new(), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("not yet");
                }
                Ok(())
            }
        })
        .await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_after_error() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let started = tokio::time::Instant::now();
        supervise("failing", CancellationToken::new(), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(Error::Disconnected);
                }
                Ok(())
            }
        })
        .await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= RESTART_DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_restarting_until_shutdown() {
        let shutdown = CancellationToken::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let task = tokio::spawn(supervise("broken", shutdown.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Disconnected) }
        }));
        tokio::time::sleep(RESTART_DELAY * 5 + Duration::from_millis(500)).await;
        shutdown.cancel();
        task.await.unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervise("forever", shutdown.clone(), || {
            std::future::pending::<Result<()>>()
        }));
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
        task.await.unwrap();
    }
}
