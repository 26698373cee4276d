/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Runtime configuration: defaults, JSON documents, SABLE_* overrides.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::gc::GcThresholds;
use crate::logging::{self, LogLevel};
use serde::Deserialize;
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var}: expected a non-negative integer, got {value:?}")]
    BadNumber { var: &'static str, value: String },
    #[error("invalid config document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config document must be a JSON object")]
    NotObject,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub gc_request_threshold: u64,
    pub gc_heap_growth_bytes: u64,
    /// Seconds.
    #[serde(rename = "gc_interval_secs")]
    pub gc_interval: u64,
    /// Store opened before the entry point runs.
    pub database: Option<String>,
    pub log_level: Option<String>,
    pub args: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let gc = GcThresholds::default();
        RuntimeConfig {
            gc_request_threshold: gc.requests,
            gc_heap_growth_bytes: gc.heap_growth_bytes,
            gc_interval: gc.interval.as_secs(),
            database: None,
            log_level: None,
            args: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let doc: serde_json::Value = serde_json::from_str(text)?;
        if !doc.is_object() {
            return Err(ConfigError::NotObject);
        }
        Ok(serde_json::from_value(doc)?)
    }

    /// Defaults with the process environment applied on top.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|var| env::var(var).ok())
    }

    /// Applies `SABLE_*` overrides looked up through `lookup`.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(n) = number(&lookup, "SABLE_GC_REQUESTS")? {
            self.gc_request_threshold = n;
        }
        if let Some(n) = number(&lookup, "SABLE_GC_HEAP_BYTES")? {
            self.gc_heap_growth_bytes = n;
        }
        if let Some(n) = number(&lookup, "SABLE_GC_INTERVAL_SECS")? {
            self.gc_interval = n;
        }
        if let Some(db) = lookup("SABLE_DATABASE") {
            self.database = Some(db);
        }
        if let Some(level) = lookup("SABLE_LOG") {
            self.log_level = Some(level);
        }
        Ok(self)
    }

    pub fn gc_thresholds(&self) -> GcThresholds {
        GcThresholds {
            requests: self.gc_request_threshold,
            heap_growth_bytes: self.gc_heap_growth_bytes,
            interval: Duration::from_secs(self.gc_interval),
        }
    }

    /// Level for the tracing subscriber; unknown names fall back to info.
    pub fn logging_level(&self) -> LogLevel {
        logging::level_from(self.log_level.as_deref())
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

fn number(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::BadNumber { var, value }),
    }
}
