use super::coordinator::TransactionCoordinator;
use super::scope::TransactionScope;
use crate::core::DbError;
use crate::interface::{Session, SessionProvider};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use tracing::Level;

/// A boxed unit of work, so heterogeneous closures can share one `Vec`
pub type BoxedWork<S, T, E> =
    Box<dyn for<'s> FnOnce(&'s mut TransactionScope<S>) -> BoxFuture<'s, Result<T, E>> + Send>;

/// Box a closure as a [`BoxedWork`].
///
/// Going through this function lets the compiler infer the closure's
/// higher-ranked signature, which a bare `Box::new(|tx| ...)` does not.
pub fn unit_of_work<S, T, E, F>(work: F) -> BoxedWork<S, T, E>
where
    S: Session,
    F: for<'s> FnOnce(&'s mut TransactionScope<S>) -> BoxFuture<'s, Result<T, E>> + Send + 'static,
{
    Box::new(work)
}

impl<P: SessionProvider> TransactionCoordinator<P> {
    /// Run `works` in order inside a single transaction.
    ///
    /// The first failure rolls the whole batch back and is returned; the units
    /// after it never run and the results gathered so far are dropped.
    pub async fn run_batch<T, E>(
        &self,
        context: Option<&str>,
        works: Vec<BoxedWork<P::Session, T, E>>,
    ) -> Result<Vec<T>, E>
    where
        P::Session: 'static,
        T: Send + 'static,
        E: From<DbError> + Display + Send + 'static,
    {
        self.run_in_transaction(context, move |tx| {
            Box::pin(async move {
                let total = works.len();
                let mut results = Vec::with_capacity(total);
                for (index, work) in works.into_iter().enumerate() {
                    tx.log(
                        Level::DEBUG,
                        &format!("Executing batch operation {}/{}", index + 1, total),
                    );
                    results.push(work(&mut *tx).await?);
                }
                Ok(results)
            })
        })
        .await
    }

    /// Run each of `works` in its own transaction, all concurrently.
    ///
    /// **Not atomic as a group.** Every unit commits or rolls back on its own
    /// session; when one fails, the others are neither cancelled nor undone.
    /// All units are awaited, then the first failure to complete is returned.
    /// On success the results come back in input order. A panicking unit is
    /// rolled back on its own; the panic resumes once every sibling has finished.
    ///
    /// Unit `i` runs under the context `<context>_<i>`, or `parallel_<i>`.
    pub async fn run_parallel<T, E>(
        &self,
        context: Option<&str>,
        works: Vec<BoxedWork<P::Session, T, E>>,
    ) -> Result<Vec<T>, E>
    where
        P::Session: 'static,
        T: Send + 'static,
        E: From<DbError> + Display + Send + 'static,
    {
        let mut pending: FuturesUnordered<_> = works
            .into_iter()
            .enumerate()
            .map(|(index, work)| {
                let label = match context {
                    Some(context) => format!("{}_{}", context, index),
                    None => format!("parallel_{}", index),
                };
                async move {
                    // A panicking unit must not unwind through its still-running siblings
                    let result = AssertUnwindSafe(self.run_in_transaction(Some(label.as_str()), work))
                        .catch_unwind()
                        .await;
                    (index, result)
                }
            })
            .collect();

        let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(pending.len()).collect();
        let mut first_error = None;
        let mut first_panic = None;

        while let Some((index, result)) = pending.next().await {
            match result {
                Ok(Ok(value)) => slots[index] = Some(value),
                Ok(Err(err)) if first_error.is_none() => first_error = Some(err),
                Ok(Err(err)) => self.log(
                    Level::DEBUG,
                    &format!("Parallel operation {} also failed: {}", index, err),
                    context,
                ),
                Err(payload) => {
                    self.log(
                        Level::ERROR,
                        &format!("Parallel operation {} panicked, waiting for the others", index),
                        context,
                    );
                    first_panic.get_or_insert(payload);
                }
            }
        }

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(slots.into_iter().flatten().collect()),
        }
    }
}
