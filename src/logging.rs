//! 日志初始化与敏感信息脱敏
//!
//! The webhook auth key travels in the request URL, so anything that prints
//! a URL or the key itself goes through [`Redacted`] or [`redact_url`].

use std::fmt;
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize tracing/logging
///
/// `RUST_LOG` wins over `logging.level`. Can only be called once per process.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry
            .with(tracing_fmt::layer().json().with_target(true))
            .init();
    } else {
        registry.with(tracing_fmt::layer().with_target(true)).init();
    }
}

/// Secret shown as its first 4 characters followed by `***`
#[derive(Clone, Debug)]
pub struct Redacted<'a> {
    inner: &'a str,
}

impl<'a> Redacted<'a> {
    pub fn new(secret: &'a str) -> Self {
        Self { inner: secret }
    }
}

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 太短的 key 全部脱敏
        if self.inner.chars().count() <= 8 {
            return write!(f, "***");
        }
        let visible: String = self.inner.chars().take(4).collect();
        write!(f, "{}***", visible)
    }
}

/// Replace the value of `param` in `raw_url` with `***`
///
/// Returns the input unchanged if it is not a parseable URL.
pub fn redact_url(raw_url: &str, param: &str) -> String {
    let Ok(mut url) = url::Url::parse(raw_url) else {
        return raw_url.to_string();
    };

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if k == param {
                (k.into_owned(), "***".to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();

    if pairs.is_empty() {
        return url.to_string();
    }

    url.query_pairs_mut().clear().extend_pairs(pairs);
    url.to_string()
}
