/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Log sinks: where every chaos event goes after it lands in the history.
//!
//! A sink sees the wire shape ([`ChaosLogEntry`]), never the interceptor.
//! Sinks are called synchronously from inside the intercepted call, so they
//! must not block; [`ChannelSink`] hands entries to another thread instead.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use faultshell_core::ChaosLogEntry;
use log::{debug, info, warn};

pub trait LogSink: Send + Sync {
    fn record(&self, entry: &ChaosLogEntry);
}

impl<F> LogSink for F
where
    F: Fn(&ChaosLogEntry) + Send + Sync,
{
    fn record(&self, entry: &ChaosLogEntry) {
        self(entry)
    }
}

/// Drops every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn record(&self, _entry: &ChaosLogEntry) {}
}

/// Forwards entries to the `log` facade at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFacadeSink;

impl LogSink for LogFacadeSink {
    fn record(&self, entry: &ChaosLogEntry) {
        info!(
            "chaos: {} {} (impact {:?}, {}ms)",
            entry.kind,
            entry.summary,
            entry.details.impact(),
            entry.details.duration_ms()
        );
    }
}

/// Sends entries over a crossbeam channel. A full or disconnected channel
/// drops the entry; the history still has it.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<ChaosLogEntry>,
}

impl ChannelSink {
    pub fn unbounded() -> (Self, Receiver<ChaosLogEntry>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub fn bounded(capacity: usize) -> (Self, Receiver<ChaosLogEntry>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelSink {
    fn record(&self, entry: &ChaosLogEntry) {
        match self.tx.try_send(entry.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                warn!("diagnostics: log channel full, dropping {}", entry.kind);
            }
            Err(TrySendError::Disconnected(entry)) => {
                debug!("diagnostics: log receiver gone, dropping {}", entry.kind);
            }
        }
    }
}
