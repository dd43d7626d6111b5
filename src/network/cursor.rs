//! Streaming result cursor.
//!
//! A [`Cursor`] holds the current batch of a sequence result and fetches
//! further batches on demand. It mutably borrows its [`Connection`], so no
//! other query can use the socket while the cursor is alive; drop or
//! [`Cursor::stop`] it to release the connection.

use std::collections::VecDeque;

use crate::error::Result;
use crate::network::connection::Connection;
use crate::reql::datum::{Datum, FormatOptions};
use crate::reql::protocol::ResponseType;

pub struct Cursor<'a> {
    conn: &'a mut Connection,
    token: u32,
    buffer: VecDeque<Datum>,
    /// Whether the server still holds an open stream for this token.
    more: bool,
    /// Whether the stream is a changefeed (it never completes on its own).
    feed: bool,
    stopped: bool,
    formats: FormatOptions,
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("token", &self.token)
            .field("buffer", &self.buffer)
            .field("more", &self.more)
            .field("feed", &self.feed)
            .field("stopped", &self.stopped)
            .field("formats", &self.formats)
            .finish_non_exhaustive()
    }
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(
        conn: &'a mut Connection,
        token: u32,
        buffer: VecDeque<Datum>,
        more: bool,
        feed: bool,
        formats: FormatOptions,
    ) -> Self {
        Self {
            conn,
            token,
            buffer,
            more,
            feed,
            stopped: false,
            formats,
        }
    }

    /// The query token this cursor streams.
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Whether this stream is a changefeed. A feed follows writes to its
    /// source and only ends when stopped, so draining it with
    /// [`Cursor::to_vec`] would block forever.
    pub fn is_feed(&self) -> bool {
        self.feed
    }

    /// Pull the next item, fetching another batch from the server when the
    /// local buffer runs dry. `None` means the sequence is exhausted.
    pub async fn next(&mut self) -> Result<Option<Datum>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if !self.more || self.stopped {
                return Ok(None);
            }
            self.fetch_batch().await?;
        }
    }

    async fn fetch_batch(&mut self) -> Result<()> {
        let response = self.conn.continue_query(self.token).await?;
        match response.response_type {
            ResponseType::SuccessPartial => {}
            ResponseType::SuccessSequence => self.more = false,
            other => {
                return Err(crate::error::Error::MalformedResponse(format!(
                    "unexpected response type {other:?} to a continue query"
                )));
            }
        }
        for value in response.results {
            self.buffer.push_back(Datum::from_wire(value, self.formats)?);
        }
        Ok(())
    }

    /// Discard the rest of the sequence, telling the server to drop its
    /// stream if one is still open. Idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.buffer.clear();
        if self.more {
            self.more = false;
            self.conn.stop_query(self.token).await?;
        }
        Ok(())
    }

    /// Drain the whole sequence into a vector.
    pub async fn to_vec(mut self) -> Result<Vec<Datum>> {
        let mut items = Vec::with_capacity(self.buffer.len());
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }
}
