//! Engine options.
//!
//! Options come from the options provider: programmatically, as a JSON
//! document (`Options::from_json`), or from `UNLAZY_*` environment variables
//! (`Options::from_env`). Missing values fall back to [`Options::default`].

use core::time::Duration;
use std::env;

use anyhow::{Context as _, Error};
use serde::Deserialize;
use url::Url;

/// Runtime options for discovery, pacing and auto-scroll.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Minimum rendered width for filtered scans, in CSS pixels
    pub min_width: f64,
    /// Minimum rendered height for filtered scans, in CSS pixels
    pub min_height: f64,
    /// Drop SVG sources from scans
    pub exclude_svg: bool,
    /// Initial delay before a mutation-triggered refresh
    pub debounce_ms: u64,
    /// Pause between synthetic scroll steps
    pub throttle_ms: u64,
    /// Maximum wait for resolver progress between auto-scroll steps
    pub auto_scroll_ms: u64,
    /// Hosts allowed to run continuous auto-scroll (suffix match)
    pub auto_scroll_sites: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            min_width: 100.0,
            min_height: 100.0,
            exclude_svg: true,
            debounce_ms: 200,
            throttle_ms: 300,
            auto_scroll_ms: 1000,
            auto_scroll_sites: Vec::new(),
        }
    }
}

fn env_parse<T: core::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

impl Options {
    /// Load options from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `UNLAZY_MIN_WIDTH` / `UNLAZY_MIN_HEIGHT`: minimum rendered size (default: 100)
    /// - `UNLAZY_EXCLUDE_SVG`: set to "0" to keep SVG sources (default: excluded)
    /// - `UNLAZY_DEBOUNCE_MS`: initial refresh backoff (default: 200)
    /// - `UNLAZY_THROTTLE_MS`: pause between sweep steps (default: 300)
    /// - `UNLAZY_AUTO_SCROLL_MS`: auto-scroll progress wait (default: 1000)
    /// - `UNLAZY_AUTO_SCROLL_SITES`: comma-separated host allow-list
    ///
    /// # Returns
    ///
    /// A new `Options` instance populated from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let auto_scroll_sites = env::var("UNLAZY_AUTO_SCROLL_SITES")
            .map(|val| {
                val.split(',')
                    .map(str::trim)
                    .filter(|site| !site.is_empty())
                    .map(str::to_ascii_lowercase)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            min_width: env_parse("UNLAZY_MIN_WIDTH").unwrap_or(defaults.min_width),
            min_height: env_parse("UNLAZY_MIN_HEIGHT").unwrap_or(defaults.min_height),
            exclude_svg: env::var("UNLAZY_EXCLUDE_SVG").ok().as_deref() != Some("0"),
            debounce_ms: env_parse::<u64>("UNLAZY_DEBOUNCE_MS")
                .unwrap_or(defaults.debounce_ms)
                .max(1),
            throttle_ms: env_parse("UNLAZY_THROTTLE_MS").unwrap_or(defaults.throttle_ms),
            auto_scroll_ms: env_parse::<u64>("UNLAZY_AUTO_SCROLL_MS")
                .unwrap_or(defaults.auto_scroll_ms)
                .max(1),
            auto_scroll_sites,
        }
    }

    /// Parse options supplied by the options provider as JSON.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `json` is not a valid options object.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).context("invalid unlazy options")
    }

    /// Initial refresh backoff as a `Duration`.
    #[inline]
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[inline]
    #[must_use]
    pub const fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    #[inline]
    #[must_use]
    pub const fn auto_scroll_period(&self) -> Duration {
        Duration::from_millis(self.auto_scroll_ms)
    }

    /// Whether continuous auto-scroll is allowed for the page at `location`.
    ///
    /// An entry matches its own host and any subdomain of it.
    #[must_use]
    pub fn allows_auto_scroll(&self, location: &str) -> bool {
        let Some(host) = Url::parse(location)
            .ok()
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
        else {
            return false;
        };
        self.auto_scroll_sites.iter().any(|site| {
            let site = site.trim_start_matches("www.");
            host == site
                || host
                    .strip_suffix(site)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}
