use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use treetab_core::wire::{EventTopic, RequestError, TabEvent};
use treetab_core::{CreateProps, TabId, TabQuery, TabRecord, UpdateProps};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("request timed out: {op}")]
    Timeout { op: &'static str },
    #[error("operation rejected: {0}")]
    Rejected(RequestError),
    #[error("unexpected response shape for {op}")]
    UnexpectedResponse { op: &'static str },
}

/// The tab-owning process as seen from the view side.
///
/// Every method is an async boundary crossing; callers treat each result as
/// ground truth at the moment it arrives and never cache across calls.
/// `subscribe` returns a bounded receiver per listener. A receiver that is
/// dropped or falls behind is detached without affecting other listeners.
pub trait TabDirectory: Send + Sync {
    fn query(
        &self,
        filter: TabQuery,
    ) -> impl Future<Output = Result<Vec<TabRecord>, DirectoryError>> + Send;

    fn create(
        &self,
        props: CreateProps,
    ) -> impl Future<Output = Result<TabRecord, DirectoryError>> + Send;

    fn update(
        &self,
        tab_id: TabId,
        props: UpdateProps,
    ) -> impl Future<Output = Result<(), DirectoryError>> + Send;

    fn remove(&self, tab_id: TabId) -> impl Future<Output = Result<(), DirectoryError>> + Send;

    /// The pseudo-tab backing the view page itself; used to learn which
    /// window the view belongs to.
    fn owning_tab(&self) -> impl Future<Output = Result<TabRecord, DirectoryError>> + Send;

    fn visited_tab_ids(
        &self,
    ) -> impl Future<Output = Result<Vec<TabId>, DirectoryError>> + Send;

    fn subscribe(
        &self,
        topic: EventTopic,
    ) -> impl Future<Output = mpsc::Receiver<TabEvent>> + Send;
}
