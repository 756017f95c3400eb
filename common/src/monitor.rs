//! Staleness sweep and heating-authorization bookkeeping (controller only).

use tracing::{info, warn};

use crate::{heating::Heating, storage::HC_URL_KEY};

/// What the host should do about heating authorization after a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HcPoll {
    /// No URL configured; heating stays authorized.
    #[default]
    Unconfigured,
    /// URL already carrying the heating-requested bit.
    Fetch(String),
    /// The stored URL could not be read; treat as unavailable.
    Unreadable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub erased: Vec<String>,
    pub zones_on: usize,
    pub hc: HcPoll,
}

impl Heating {
    pub fn age_sweep(&self, now_ms: u64) -> SweepReport {
        let stale_after_ms = self.config.stale_after_ms();
        let mut report = SweepReport::default();

        let stale: Vec<String> = self
            .iter()
            .filter(|zone| zone.is_stale(now_ms, stale_after_ms))
            .map(|zone| zone.name)
            .collect();

        for name in stale {
            let erased = self
                .registry
                .update(&name, false, |zone| {
                    let had_value = !zone.value.is_nan() || !zone.samples.is_empty();
                    zone.erase();
                    had_value
                })
                .unwrap_or(false);
            if erased {
                warn!("zone `{name}` went stale, erasing value");
                report.erased.push(name.clone());
            }
            self.evaluate(&name, now_ms);
        }
        if !report.erased.is_empty() {
            self.display_refresh();
        }

        report.zones_on = self
            .iter()
            .filter(|zone| zone.actuation_state.is_on())
            .count();
        report.hc = self.hc_poll(report.zones_on > 0);
        report
    }

    /// Applies the outcome of an authorization poll. Failure fans out OFF to every zone.
    pub fn apply_hc_result(&self, ok: bool, now_ms: u64) {
        let was_ok = self.swap_hc(ok);
        if !ok {
            warn!("heating authorization unavailable, forcing all zones off");
            self.evaluate_all(now_ms);
        } else if !was_ok {
            info!("heating authorization restored");
            self.evaluate_all(now_ms);
        }
    }

    fn hc_poll(&self, heating: bool) -> HcPoll {
        let mut hc = self.hc_url.lock().unwrap_or_else(|err| err.into_inner());
        if hc.reload {
            match self.registry.storage().read_string(HC_URL_KEY) {
                Ok(url) => {
                    hc.url = url.filter(|url| !url.is_empty());
                    hc.reload = false;
                }
                // Retried on the next sweep.
                Err(err) => {
                    warn!("failed to reload hc url: {err}");
                    return HcPoll::Unreadable;
                }
            }
        }
        match hc.url.as_deref() {
            Some(url) => HcPoll::Fetch(with_request_bit(url, heating)),
            None => HcPoll::Unconfigured,
        }
    }
}

/// Replaces the URL's final character with the one-bit heating request.
pub fn with_request_bit(url: &str, heating: bool) -> String {
    let mut chars = url.chars();
    chars.next_back();
    let mut rewritten = chars.as_str().to_string();
    rewritten.push(if heating { '1' } else { '0' });
    rewritten
}
