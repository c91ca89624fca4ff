//! Lifecycle callbacks fired after create, complete and terminate.
//!
//! Callbacks are registered up front on [`EventHooks`] and run as detached
//! tokio tasks. Their failures are logged and never reach the client.

use crate::models::UploadResource;
use futures::future::BoxFuture;
use std::{future::Future, sync::Arc};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEventKind {
    Created,
    Completed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct UploadEvent {
    pub kind: UploadEventKind,
    pub upload: UploadResource,
}

pub type EventCallback =
    Arc<dyn Fn(UploadEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Registered callbacks, grouped by event kind.
#[derive(Clone, Default)]
pub struct EventHooks {
    on_create: Vec<EventCallback>,
    on_complete: Vec<EventCallback>,
    on_terminate: Vec<EventCallback>,
}

impl EventHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(UploadEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_create.push(boxed(callback));
        self
    }

    pub fn on_complete<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(UploadEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_complete.push(boxed(callback));
        self
    }

    pub fn on_terminate<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(UploadEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_terminate.push(boxed(callback));
        self
    }

    fn callbacks(&self, kind: UploadEventKind) -> &[EventCallback] {
        match kind {
            UploadEventKind::Created => &self.on_create,
            UploadEventKind::Completed => &self.on_complete,
            UploadEventKind::Terminated => &self.on_terminate,
        }
    }

    /// Spawn every callback registered for `kind`. Must run inside a tokio
    /// runtime.
    pub fn dispatch(&self, kind: UploadEventKind, upload: &UploadResource) {
        for callback in self.callbacks(kind) {
            let callback = callback.clone();
            let event = UploadEvent {
                kind,
                upload: upload.clone(),
            };
            tokio::spawn(async move {
                let id = event.upload.id.clone();
                if let Err(err) = callback(event).await {
                    warn!("{:?} callback for upload {} failed: {:#}", kind, id, err);
                }
            });
        }
    }
}

fn boxed<F, Fut>(callback: F) -> EventCallback
where
    F: Fn(UploadEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(callback(event)) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{UploadLength, UploadMetadata};
    use chrono::Duration;
    use tokio::sync::mpsc;

    fn upload() -> UploadResource {
        UploadResource::new(
            "evt",
            UploadLength::Known(1),
            UploadMetadata::default(),
            Duration::hours(1),
        )
    }

    #[tokio::test]
    async fn dispatches_only_matching_kind() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hooks = EventHooks::new().on_complete(move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event.kind)?;
                Ok::<_, anyhow::Error>(())
            }
        });

        hooks.dispatch(UploadEventKind::Created, &upload());
        hooks.dispatch(UploadEventKind::Completed, &upload());

        assert_eq!(rx.recv().await, Some(UploadEventKind::Completed));
        drop(hooks);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn failing_callback_does_not_stop_others() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hooks = EventHooks::new()
            .on_terminate(|_| async { Err::<(), _>(anyhow::anyhow!("hook exploded")) })
            .on_terminate(move |event| {
                let tx = tx.clone();
                async move {
                    tx.send(event.upload.id)?;
                    Ok::<_, anyhow::Error>(())
                }
            });

        hooks.dispatch(UploadEventKind::Terminated, &upload());
        assert_eq!(rx.recv().await.as_deref(), Some("evt"));
    }
}
