// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bookkeeping for requests sent to the peer that have not been answered.
//!
//! Each request kind keeps its own cookie-to-completion map, so cookies only
//! have to be unique within a kind. Every entry resolves exactly once:
//! either with the peer's response or with [`ProxyError::Stopped`] when the
//! engine shuts down while the request is in flight.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::types::{Cookie, CookieCounter, Handle};

struct PendingMap<T> {
    name: &'static str,
    entries: HashMap<Cookie, oneshot::Sender<ProxyResult<T>>>,
}

impl<T> PendingMap<T> {
    fn new(name: &'static str) -> Self {
        PendingMap {
            name,
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, cookie: Cookie, tx: oneshot::Sender<ProxyResult<T>>) {
        self.entries.insert(cookie, tx);
    }

    fn complete(&mut self, cookie: Cookie, result: ProxyResult<T>) {
        match self.entries.remove(&cookie) {
            Some(tx) => {
                if tx.send(result).is_err() {
                    debug!(kind = self.name, %cookie, "request caller went away");
                }
            }
            // Tolerated: late responses after local teardown, or a confused
            // peer. Either way there is nothing to resolve.
            None => warn!(kind = self.name, %cookie, "response for unknown cookie"),
        }
    }

    fn cancel_all(&mut self) {
        for (cookie, tx) in self.entries.drain() {
            debug!(kind = self.name, %cookie, "cancelling in-flight request");
            let _ = tx.send(Err(ProxyError::Stopped));
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// In-flight requests keyed by cookie, one map per request kind.
pub struct PendingRequestTable {
    cookies: CookieCounter,
    connect: PendingMap<Handle>,
    pread: PendingMap<Vec<u8>>,
    fstat: PendingMap<u64>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        PendingRequestTable {
            cookies: CookieCounter::new(),
            connect: PendingMap::new("connect"),
            pread: PendingMap::new("pread"),
            fstat: PendingMap::new("fstat"),
        }
    }

    /// Files a connect completion and returns the cookie to put in the
    /// request message. The entry must exist before the request is on the
    /// wire, otherwise a fast response races the bookkeeping.
    pub fn insert_connect(&mut self, tx: oneshot::Sender<ProxyResult<Handle>>) -> Cookie {
        let cookie = self.cookies.next();
        self.connect.insert(cookie, tx);
        cookie
    }

    pub fn insert_pread(&mut self, tx: oneshot::Sender<ProxyResult<Vec<u8>>>) -> Cookie {
        let cookie = self.cookies.next();
        self.pread.insert(cookie, tx);
        cookie
    }

    pub fn insert_fstat(&mut self, tx: oneshot::Sender<ProxyResult<u64>>) -> Cookie {
        let cookie = self.cookies.next();
        self.fstat.insert(cookie, tx);
        cookie
    }

    pub fn complete_connect(&mut self, cookie: Cookie, result: ProxyResult<Handle>) {
        self.connect.complete(cookie, result);
    }

    pub fn complete_pread(&mut self, cookie: Cookie, result: ProxyResult<Vec<u8>>) {
        self.pread.complete(cookie, result);
    }

    pub fn complete_fstat(&mut self, cookie: Cookie, result: ProxyResult<u64>) {
        self.fstat.complete(cookie, result);
    }

    /// Resolves everything still in flight with [`ProxyError::Stopped`].
    /// Must run before the connection is torn down so no caller is left
    /// waiting on a response that can never arrive.
    pub fn cancel_all(&mut self) {
        self.connect.cancel_all();
        self.pread.cancel_all();
        self.fstat.cancel_all();
    }

    pub fn pending_count(&self) -> usize {
        self.connect.len() + self.pread.len() + self.fstat.len()
    }
}

impl Default for PendingRequestTable {
    fn default() -> Self {
        Self::new()
    }
}
