//! Clone progress counters.

use bson::{doc, DateTime as BsonDateTime, Document};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::time::Instant;
use tracing::info;

/// Point in time view of one collection clone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClonerStats {
    /// source namespace.
    pub ns: String,
    /// estimated documents to copy, from the donor's count.
    pub documents_to_copy: u64,
    /// documents copied, including the ones found locally on resume.
    pub documents_copied: u64,
    /// index specs found on the donor, `_id` index included.
    pub indexes: usize,
    /// insert tasks which took a batch.
    pub inserted_batches: u64,
    /// network batches received from the donor.
    pub received_batches: u64,
    /// when the first stage started.
    pub start: Option<DateTime<Utc>>,
    /// when the last stage finished.
    pub end: Option<DateTime<Utc>>,
}

impl ClonerStats {
    /// zeroed stats for namespace `ns`.
    pub fn new(ns: impl Into<String>) -> Self {
        ClonerStats {
            ns: ns.into(),
            ..Default::default()
        }
    }

    /// time between start and end, when both are known.
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Render the stats as a document, `start`, `end` and `elapsedMillis` only appear once known.
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "ns": self.ns.clone(),
            "documentsToCopy": self.documents_to_copy as i64,
            "documentsCopied": self.documents_copied as i64,
            "indexes": self.indexes as i64,
            "insertedBatches": self.inserted_batches as i64,
        };
        if let Some(start) = self.start {
            doc.insert("start", BsonDateTime::from_millis(start.timestamp_millis()));
            if let Some(end) = self.end {
                doc.insert("end", BsonDateTime::from_millis(end.timestamp_millis()));
                doc.insert("elapsedMillis", (end - start).num_milliseconds());
            }
        }
        doc.insert("receivedBatches", self.received_batches as i64);
        doc
    }
}

impl fmt::Display for ClonerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_document())
    }
}

const SECONDS_BETWEEN_LOGS: u64 = 60;
const CHECK_INTERVAL: u64 = 128;

/// Logs clone progress now and then, without looking at the clock on every hit.
#[derive(Debug)]
pub struct ProgressMeter {
    name: String,
    units: &'static str,
    total: u64,
    done: u64,
    hits: u64,
    secs_between: u64,
    check_interval: u64,
    last_log: Instant,
}

impl ProgressMeter {
    /// a meter named `name`, the total is unknown (1) until it's replaced.
    pub fn new(name: impl Into<String>, units: &'static str) -> Self {
        ProgressMeter {
            name: name.into(),
            units,
            total: 1,
            done: 0,
            hits: 0,
            secs_between: SECONDS_BETWEEN_LOGS,
            check_interval: CHECK_INTERVAL,
            last_log: Instant::now(),
        }
    }

    /// replace the total once the real estimate is known.
    pub fn set_total_while_running(&mut self, total: u64) {
        self.total = total;
    }

    /// Record `n` more units done.  Returns `true` when a progress line was logged.
    pub fn hit(&mut self, n: u64) -> bool {
        self.done += n;
        self.hits += 1;
        if self.hits % self.check_interval != 0 {
            return false;
        }
        if self.last_log.elapsed().as_secs() < self.secs_between {
            return false;
        }
        self.last_log = Instant::now();
        let percent = if self.total == 0 {
            100
        } else {
            self.done * 100 / self.total
        };
        info!(
            "{}: {}/{} {} ({}%)",
            self.name, self.done, self.total, self.units, percent
        );
        true
    }

    /// units done so far.
    pub fn done(&self) -> u64 {
        self.done
    }

    #[cfg(test)]
    fn with_schedule(mut self, secs_between: u64, check_interval: u64) -> Self {
        self.secs_between = secs_between;
        self.check_interval = check_interval;
        self
    }
}
