//! Transactional command dispatch.
//!
//! Every top-level [`Dispatcher::send`] opens one database transaction. Handlers receive a
//! [`DispatchContext`] carrying that transaction, and any sub-command they dispatch through the
//! context joins it. The transaction commits only when the outermost handler returns `Ok` and no
//! sub-request failed; any error anywhere in the tree rolls back every write made since the
//! top-level call began, even when a caller recovers from it.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::SqliteConnection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::{DbClient, Store};

#[cfg(test)]
mod tests;

/// A command or query routed through the [`Dispatcher`].
pub trait Request: Send + 'static {
    type Response: Send + 'static;

    /// Name used in logs and errors.
    const NAME: &'static str;
}

#[async_trait]
pub trait Handler<R: Request>: Send + Sync + 'static {
    async fn handle(&self, request: R, context: &mut DispatchContext<'_>) -> Result<R::Response>;
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for {0}")]
    NoHandler(&'static str),
    #[error("dispatch of {0} was cancelled")]
    Cancelled(&'static str),
    #[error("{0} returned after a nested request failed; its transaction was rolled back")]
    RollbackOnly(&'static str),
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn handle_erased(
        &self,
        request: Box<dyn Any + Send>,
        context: &mut DispatchContext<'_>,
    ) -> Result<Box<dyn Any + Send>>;
}

struct HandlerAdapter<R, H> {
    handler: H,
    request: PhantomData<fn(R)>,
}

#[async_trait]
impl<R, H> ErasedHandler for HandlerAdapter<R, H>
where
    R: Request,
    H: Handler<R>,
{
    async fn handle_erased(
        &self,
        request: Box<dyn Any + Send>,
        context: &mut DispatchContext<'_>,
    ) -> Result<Box<dyn Any + Send>> {
        let request = request
            .downcast::<R>()
            .map_err(|_| anyhow!("request type mismatch for {}", R::NAME))?;
        let response = self.handler.handle(*request, context).await?;
        Ok(Box::new(response))
    }
}

pub struct Dispatcher {
    db: DbClient,
    handlers: HashMap<TypeId, Box<dyn ErasedHandler>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(db: DbClient) -> Self {
        Self {
            db,
            handlers: HashMap::new(),
        }
    }

    /// Registers the handler for `R`, replacing any previous one.
    pub fn register<R, H>(&mut self, handler: H) -> &mut Self
    where
        R: Request,
        H: Handler<R>,
    {
        let adapter = HandlerAdapter {
            handler,
            request: PhantomData::<fn(R)>,
        };
        if self
            .handlers
            .insert(TypeId::of::<R>(), Box::new(adapter))
            .is_some()
        {
            warn!(request = R::NAME, "handler replaced");
        }
        self
    }

    #[must_use]
    pub fn db(&self) -> &DbClient {
        &self.db
    }

    /// Runs `request` inside a new transaction.
    ///
    /// # Errors
    /// Returns the handler's error unchanged after rolling back,
    /// [`DispatchError::RollbackOnly`] when a nested request failed, or an error if the
    /// transaction cannot be opened or committed.
    pub async fn send<R: Request>(
        &self,
        request: R,
        cancellation: &CancellationToken,
    ) -> Result<R::Response> {
        if cancellation.is_cancelled() {
            return Err(DispatchError::Cancelled(R::NAME).into());
        }

        let mut transaction = self.db.pool().begin().await?;
        let mut rollback_only = false;

        let outcome = {
            let mut context = DispatchContext {
                dispatcher: self,
                connection: &mut *transaction,
                rollback_only: &mut rollback_only,
                cancellation: cancellation.clone(),
                depth: 0,
            };
            self.invoke(request, &mut context).await
        };

        let outcome = match outcome {
            Ok(_) if rollback_only => Err(DispatchError::RollbackOnly(R::NAME).into()),
            outcome => outcome,
        };

        match outcome {
            Ok(response) => {
                transaction.commit().await?;
                debug!(request = R::NAME, "transaction committed");
                Ok(response)
            }
            Err(error) => {
                if let Err(rollback_error) = transaction.rollback().await {
                    warn!(request = R::NAME, error = %rollback_error, "rollback failed");
                }
                debug!(request = R::NAME, error = %error, "transaction rolled back");
                Err(error)
            }
        }
    }

    async fn invoke<R: Request>(
        &self,
        request: R,
        context: &mut DispatchContext<'_>,
    ) -> Result<R::Response> {
        let handler = self
            .handlers
            .get(&TypeId::of::<R>())
            .ok_or(DispatchError::NoHandler(R::NAME))?;

        debug!(request = R::NAME, depth = context.depth, "dispatching");

        let response = handler.handle_erased(Box::new(request), context).await?;
        response
            .downcast::<R::Response>()
            .map(|response| *response)
            .map_err(|_| anyhow!("response type mismatch for {}", R::NAME))
    }
}

/// Handle on the ambient transaction of the call being handled.
pub struct DispatchContext<'a> {
    dispatcher: &'a Dispatcher,
    connection: &'a mut SqliteConnection,
    rollback_only: &'a mut bool,
    cancellation: CancellationToken,
    depth: usize,
}

impl DispatchContext<'_> {
    /// Dispatches a sub-request inside the current transaction.
    ///
    /// A failed sub-request marks the transaction rollback-only, so it will not commit even if
    /// the caller handles the error.
    ///
    /// # Errors
    /// Returns the sub-handler's error, or [`DispatchError::Cancelled`] when the run was cancelled.
    pub async fn dispatch<R: Request>(&mut self, request: R) -> Result<R::Response> {
        let outcome = if self.cancellation.is_cancelled() {
            Err(DispatchError::Cancelled(R::NAME).into())
        } else {
            let mut nested = DispatchContext {
                dispatcher: self.dispatcher,
                connection: &mut *self.connection,
                rollback_only: &mut *self.rollback_only,
                cancellation: self.cancellation.clone(),
                depth: self.depth + 1,
            };
            self.dispatcher.invoke(request, &mut nested).await
        };

        if let Err(error) = &outcome {
            debug!(request = R::NAME, error = %error, "transaction marked rollback-only");
            *self.rollback_only = true;
        }
        outcome
    }

    #[must_use]
    pub fn store(&mut self) -> Store<'_> {
        Store::new(&mut *self.connection)
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }
}
