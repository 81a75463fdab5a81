use crate::error::Result;
use crate::models::{NewUsageEntry, UsageFilter, UsageLogEntry};
use crate::storage::UsageRepository;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: u32 = 256;

#[derive(Clone)]
pub struct UsageRecorder {
    repository: Arc<dyn UsageRepository>,
    dropped: Arc<AtomicU64>,
}

impl UsageRecorder {
    pub fn new(repository: Arc<dyn UsageRepository>) -> Self {
        Self {
            repository,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append one entry. Never fails.
    pub async fn record(&self, entry: NewUsageEntry) {
        let entry = entry.normalized();
        let endpoint = entry.endpoint.clone();
        let success = entry.success;

        match self.repository.append(entry).await {
            Ok(id) => {
                tracing::trace!(id, endpoint = %endpoint, success, "Usage recorded");
            }
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    error = %err,
                    endpoint = %endpoint,
                    success,
                    "Failed to record usage entry; dropping it"
                );
            }
        }
    }

    /// Entries lost to storage failures since startup
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn query(&self, filter: UsageFilter) -> UsageQuery {
        UsageQuery {
            repository: self.repository.clone(),
            filter,
            page_size: DEFAULT_PAGE_SIZE,
            limit: None,
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.repository.ping().await
    }
}

/// A restartable, lazily paged view over the usage log.
///
/// Each call to [`UsageQuery::stream`] starts from the lowest id and stops at
/// the highest id that existed when the stream first polled the store, so a
/// stream is finite even while new entries keep arriving.
#[derive(Clone)]
pub struct UsageQuery {
    repository: Arc<dyn UsageRepository>,
    filter: UsageFilter,
    page_size: u32,
    limit: Option<usize>,
}

struct PageState {
    after_id: i64,
    max_id: Option<i64>,
    buffer: VecDeque<UsageLogEntry>,
    remaining: Option<usize>,
    exhausted: bool,
}

impl UsageQuery {
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn stream(&self) -> BoxStream<'static, Result<UsageLogEntry>> {
        let repository = self.repository.clone();
        let filter = self.filter.clone();
        let page_size = self.page_size;

        let state = PageState {
            after_id: 0,
            max_id: None,
            buffer: VecDeque::new(),
            remaining: self.limit,
            exhausted: false,
        };

        stream::try_unfold(state, move |state| {
            next_entry(repository.clone(), filter.clone(), page_size, state)
        })
        .boxed()
    }

    pub async fn collect(&self) -> Result<Vec<UsageLogEntry>> {
        self.stream().try_collect().await
    }
}

async fn next_entry(
    repository: Arc<dyn UsageRepository>,
    filter: UsageFilter,
    page_size: u32,
    mut state: PageState,
) -> Result<Option<(UsageLogEntry, PageState)>> {
    if state.remaining == Some(0) {
        return Ok(None);
    }

    if state.buffer.is_empty() && !state.exhausted {
        let max_id = match state.max_id {
            Some(max_id) => max_id,
            None => {
                let max_id = repository.max_id().await?;
                state.max_id = Some(max_id);
                max_id
            }
        };

        let page = repository.page(&filter, state.after_id, max_id, page_size).await?;
        if page.len() < page_size as usize {
            state.exhausted = true;
        }
        if let Some(last) = page.last() {
            state.after_id = last.id;
        }
        state.buffer.extend(page);
    }

    match state.buffer.pop_front() {
        Some(entry) => {
            if let Some(remaining) = state.remaining.as_mut() {
                *remaining -= 1;
            }
            Ok(Some((entry, state)))
        }
        None => Ok(None),
    }
}
