//! Typed publish/subscribe feeds.
//!
//! A [`Feed`] multicasts events of one type to any number of subscribers.
//! Events published by a single publisher reach every individual subscriber
//! in publication order; no ordering is defined across publishers. A
//! [`Subscription`] is a plain `Stream` that terminates once the feed is
//! closed, which is the shutdown signal for the event loops built on top.

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::prelude::*;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// A multi-producer multicast channel for events of type `T`.
///
/// Cloning the feed yields another handle onto the same subscriber set.
pub struct Feed<T> {
    subscribers: Arc<Mutex<Vec<UnboundedSender<T>>>>,
}

/// The receiving half handed out by [`Feed::subscribe`].
///
/// The stream ends when the feed is dropped or explicitly closed.
pub struct Subscription<T> {
    rx: UnboundedReceiver<T>,
}

impl<T> Feed<T> {
    pub fn new() -> Self {
        Feed {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a new subscriber and returns its event stream.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().unwrap().push(tx);
        Subscription { rx }
    }

    /// Closes the feed: every subscription stream terminates after
    /// draining events already delivered.
    pub fn close(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| !tx.is_closed());
        subs.len()
    }
}

impl<T: Clone> Feed<T> {
    /// Delivers `event` to every live subscriber and returns how many
    /// received it. Dropped subscriptions are pruned on the way.
    ///
    /// The subscriber list lock serializes concurrent publishers, which is
    /// what makes the per-publisher ordering guarantee hold.
    pub fn send(&self, event: T) -> usize {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in subs.iter() {
            if tx.unbounded_send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Feed {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<T> Default for Feed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscription<T> {
    /// Receives the next event, or `None` once the feed has shut down.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.next().await
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}
