//! Lazy result streaming over a cursor
//!
//! [`Client::stream`] turns `declare` / `fetch`* / `deallocate` into a lazy
//! finite sequence. The cursor is always released: on exhaustion, on error,
//! on explicit [`QueryStream::close`], and best effort when the stream is
//! dropped mid-way. The only case where `deallocate` does not reach the
//! adapter is a torn-down connection, and the log hook still observes the
//! closure then.
//!
//! Streams may only be opened inside a transaction.

use std::sync::Arc;
use std::time::Duration;

use crate::adapter::Adapter;
use crate::client::{Client, Cursor};
use crate::config::CallOptions;
use crate::error::{BoxError, Error, Result};
use crate::log::{Call, Phase};

/// Hook applied to params before `handle_declare`
pub type EncodeHook<A> =
    Arc<dyn Fn(<A as Adapter>::Params) -> <A as Adapter>::Params + Send + Sync>;

/// Hook applied to every fetched chunk. Receives the possibly-replaced
/// query; an error aborts the stream and closes the cursor.
pub type DecodeHook<A> = Arc<
    dyn Fn(
            &<A as Adapter>::Query,
            <A as Adapter>::Output,
        ) -> std::result::Result<<A as Adapter>::Output, BoxError>
        + Send
        + Sync,
>;

/// Options for one stream
pub struct StreamOptions<A: Adapter> {
    /// Per-call options forwarded to declare/fetch/deallocate
    pub call: CallOptions,
    /// Params hook, applied before `handle_declare`
    pub encode: Option<EncodeHook<A>>,
    /// Result hook, applied to every yielded chunk
    pub decode: Option<DecodeHook<A>>,
}

impl<A: Adapter> Default for StreamOptions<A> {
    fn default() -> Self {
        Self {
            call: CallOptions::default(),
            encode: None,
            decode: None,
        }
    }
}

impl<A: Adapter> Clone for StreamOptions<A> {
    fn clone(&self) -> Self {
        Self {
            call: self.call.clone(),
            encode: self.encode.clone(),
            decode: self.decode.clone(),
        }
    }
}

impl<A: Adapter> StreamOptions<A> {
    /// Options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set per-call options
    pub fn with_call(mut self, call: CallOptions) -> Self {
        self.call = call;
        self
    }

    /// Install a params hook
    pub fn with_encode(mut self, hook: EncodeHook<A>) -> Self {
        self.encode = Some(hook);
        self
    }

    /// Install a result hook
    pub fn with_decode(mut self, hook: DecodeHook<A>) -> Self {
        self.decode = Some(hook);
        self
    }
}

impl<A: Adapter> std::fmt::Debug for StreamOptions<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions")
            .field("call", &self.call)
            .field("encode", &self.encode.as_ref().map(|_| "<hook>"))
            .field("decode", &self.decode.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl<A: Adapter> Client<A> {
    /// Open a lazy stream over `query`; only legal inside a transaction.
    pub async fn stream(
        &mut self,
        query: A::Query,
        params: A::Params,
        opts: StreamOptions<A>,
    ) -> Result<QueryStream<'_, A>> {
        match self.status() {
            crate::client::TxStatus::Transaction => {}
            crate::client::TxStatus::Failed => return Err(Error::rolling_back()),
            crate::client::TxStatus::Idle => {
                return Err(Error::connection(
                    "streams can only be used inside a transaction",
                ))
            }
        }

        let params = match &opts.encode {
            Some(encode) => encode(params),
            None => params,
        };

        let (log_query, log_params) = if self.wants_log() {
            (Some(query.clone()), Some(params.clone()))
        } else {
            (None, None)
        };

        let (declared, connection_time) = self
            .declare_raw(query.clone(), params, opts.call.clone())
            .await;
        let outcome = declared.as_ref().map(|_| ()).map_err(|e| e.to_string());
        self.emit_log(Call::Declare, log_query, log_params, outcome, connection_time, None);

        match declared {
            Ok((replaced, cursor)) => Ok(QueryStream {
                client: self,
                query: replaced.unwrap_or(query),
                cursor: Some(cursor),
                decode: opts.decode,
                call: opts.call,
            }),
            Err(err) => Err(err),
        }
    }
}

/// A lazy finite sequence of fetched chunks
///
/// Drive it with [`next`](Self::next); it ends after the adapter halts, an
/// error surfaces, or [`close`](Self::close) is called. Dropping the stream
/// early still releases the cursor, without blocking.
pub struct QueryStream<'c, A: Adapter> {
    client: &'c mut Client<A>,
    query: A::Query,
    cursor: Option<Cursor>,
    decode: Option<DecodeHook<A>>,
    call: CallOptions,
}

impl<A: Adapter> QueryStream<'_, A> {
    /// The query driving this stream, after any adapter substitution
    pub fn query(&self) -> &A::Query {
        &self.query
    }

    /// Pull the next chunk; `None` once the stream is finished.
    pub async fn next(&mut self) -> Option<Result<A::Output>> {
        let cursor = self.cursor?;

        let log_query = self.client.wants_log().then(|| self.query.clone());
        let (fetched, connection_time) = self.client.fetch_raw(cursor, self.call.clone()).await;

        match fetched {
            Ok(chunk) => {
                let halted = chunk.is_halt();
                let (item, decode_time) = match self.decode_chunk(chunk.into_inner()) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        self.client.emit_log(
                            Call::Fetch,
                            log_query,
                            None,
                            Err(err.to_string()),
                            connection_time,
                            None,
                        );
                        self.close().await;
                        return Some(Err(err));
                    }
                };
                self.client.emit_log(
                    Call::Fetch,
                    log_query,
                    None,
                    Ok(()),
                    connection_time,
                    decode_time,
                );
                if halted {
                    self.close().await;
                }
                Some(Ok(item))
            }
            Err(err) => {
                self.client.emit_log(
                    Call::Fetch,
                    log_query,
                    None,
                    Err(err.to_string()),
                    connection_time,
                    None,
                );
                if err.is_disconnect() {
                    // The cursor died with the connection; the adapter never
                    // sees the deallocate, but the log hook still does.
                    let close_query = self.client.wants_log().then(|| self.query.clone());
                    self.client.emit_log(
                        Call::Deallocate,
                        close_query,
                        None,
                        Err(Error::closed().to_string()),
                        None,
                        None,
                    );
                    self.client.untrack_cursor(cursor);
                    self.cursor = None;
                } else {
                    self.close().await;
                }
                Some(Err(err))
            }
        }
    }

    /// Collect every remaining chunk, stopping at the first error.
    pub async fn try_collect(&mut self) -> Result<Vec<A::Output>> {
        let mut items = Vec::new();
        while let Some(chunk) = self.next().await {
            items.push(chunk?);
        }
        Ok(items)
    }

    /// Release the cursor now. Idempotent.
    pub async fn close(&mut self) {
        let Some(cursor) = self.cursor.take() else {
            return;
        };
        let log_query = self.client.wants_log().then(|| self.query.clone());
        let (result, connection_time) =
            self.client.deallocate_raw(cursor, self.call.clone()).await;
        let outcome = result.map_err(|e| e.to_string());
        self.client.emit_log(
            Call::Deallocate,
            log_query,
            None,
            outcome,
            connection_time,
            Phase::skipped().elapsed(),
        );
    }

    fn decode_chunk(&self, chunk: A::Output) -> Result<(A::Output, Option<Duration>)> {
        let Some(decode) = &self.decode else {
            return Ok((chunk, Phase::skipped().elapsed()));
        };
        let phase = Phase::start();
        match decode(&self.query, chunk) {
            Ok(decoded) => Ok((decoded, phase.elapsed())),
            Err(cause) => Err(Error::database(cause)),
        }
    }
}

impl<A: Adapter> Drop for QueryStream<'_, A> {
    fn drop(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            self.client.orphan_deallocate(cursor);
        }
    }
}

impl<A: Adapter> std::fmt::Debug for QueryStream<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream")
            .field("cursor", &self.cursor)
            .finish()
    }
}
