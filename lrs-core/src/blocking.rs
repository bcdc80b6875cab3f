//! Blocking - Synchronous Entry Points Over Any Backend
//!
//! `TigerStyle`: One algorithm body; the blocking model only changes how
//! the caller waits.
//!
//! [`BlockingBackend`] owns a current-thread runtime and drives the async
//! [`Backend`] with `block_on`. Its `read` is an [`Iterator`] that blocks
//! once per fetched chunk. It must not be used from inside a tokio runtime.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::runtime::{Builder, Runtime};

use crate::backend::{Backend, ListEntry};
use crate::bulk::WriteOptions;
use crate::error::{BackendError, BackendResult};
use crate::pagination::StatementQueryResult;
use crate::query::{Query, StructuredQuery};
use crate::record::{Record, WriteInput};
use crate::status::BackendStatus;

/// Blocking facade over an async backend.
pub struct BlockingBackend {
    inner: Arc<dyn Backend>,
    runtime: Runtime,
}

impl std::fmt::Debug for BlockingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingBackend")
            .field("backend", &self.inner.name())
            .finish()
    }
}

impl BlockingBackend {
    /// Wrap `inner` with its own runtime.
    ///
    /// # Errors
    /// Returns `Engine` if the runtime cannot be created.
    pub fn new(inner: Arc<dyn Backend>) -> BackendResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BackendError::engine(format!("failed to build runtime: {e}")))?;
        Ok(Self { inner, runtime })
    }

    /// The wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Backend> {
        &self.inner
    }

    /// See [`Backend::status`].
    pub fn status(&self) -> BackendStatus {
        self.runtime.block_on(self.inner.status())
    }

    /// See [`Backend::list`].
    pub fn list<'a>(
        &'a self,
        target: Option<&'a str>,
        details: bool,
        new: bool,
    ) -> BlockingIter<'a, ListEntry> {
        BlockingIter {
            runtime: &self.runtime,
            stream: self.inner.list(target, details, new),
        }
    }

    /// See [`Backend::read`].
    pub fn read<'a>(
        &'a self,
        query: &'a Query,
        target: Option<&'a str>,
        chunk_size: Option<usize>,
    ) -> BlockingIter<'a, Record> {
        BlockingIter {
            runtime: &self.runtime,
            stream: self.inner.read(query, target, chunk_size),
        }
    }

    /// See [`Backend::write`].
    ///
    /// # Errors
    /// Same as the async write.
    pub fn write<'d, I>(&self, data: I, options: &WriteOptions) -> BackendResult<usize>
    where
        I: IntoIterator<Item = WriteInput>,
        I::IntoIter: Send + 'd,
    {
        let data: BoxStream<'d, WriteInput> = stream::iter(data).boxed();
        self.runtime.block_on(self.inner.write(data, options))
    }

    /// See [`Backend::query_statements`].
    ///
    /// # Errors
    /// Same as the async query.
    pub fn query_statements(
        &self,
        query: &StructuredQuery,
        target: Option<&str>,
    ) -> BackendResult<StatementQueryResult> {
        self.runtime
            .block_on(self.inner.query_statements(query, target))
    }

    /// See [`Backend::close`].
    ///
    /// # Errors
    /// Same as the async close.
    pub fn close(&self) -> BackendResult<()> {
        self.runtime.block_on(self.inner.close())
    }
}

/// Iterator that blocks on the underlying stream.
pub struct BlockingIter<'a, T> {
    runtime: &'a Runtime,
    stream: BoxStream<'a, BackendResult<T>>,
}

impl<T> Iterator for BlockingIter<'_, T> {
    type Item = BackendResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.stream.next())
    }
}
