//! Engine-wide counters, owned by the reactor thread.

use super::metrics::MetricsPayload;
use std::time::{Duration, Instant};

/// Counters updated as channels send and receive.
#[derive(Debug, Clone)]
pub(crate) struct EngineStats {
    since: Instant,
    messages_sent: u64,
    messages_resent: u64,
    messages_received: u64,
    duplicates_received: u64,
    channels_opened: u64,
    channels_closed: u64,
    latency_count: u64,
    latency_total: Duration,
    latency_min: Option<Duration>,
    latency_max: Option<Duration>,
}

impl EngineStats {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            since: now,
            messages_sent: 0,
            messages_resent: 0,
            messages_received: 0,
            duplicates_received: 0,
            channels_opened: 0,
            channels_closed: 0,
            latency_count: 0,
            latency_total: Duration::ZERO,
            latency_min: None,
            latency_max: None,
        }
    }

    pub(crate) fn message_sent(&mut self, resend: bool) {
        if resend {
            self.messages_resent += 1;
        } else {
            self.messages_sent += 1;
        }
    }

    pub(crate) fn message_received(&mut self, duplicate: bool) {
        self.messages_received += 1;
        if duplicate {
            self.duplicates_received += 1;
        }
    }

    pub(crate) fn channel_opened(&mut self) {
        self.channels_opened += 1;
    }

    pub(crate) fn channel_closed(&mut self) {
        self.channels_closed += 1;
    }

    /// Send-to-acknowledgment time of one message.
    pub(crate) fn record_latency(&mut self, latency: Duration) {
        self.latency_count += 1;
        self.latency_total += latency;
        self.latency_min = Some(self.latency_min.map_or(latency, |m| m.min(latency)));
        self.latency_max = Some(self.latency_max.map_or(latency, |m| m.max(latency)));
    }

    /// Copy the counters together with the live gauges, optionally starting
    /// a new interval.
    pub(crate) fn snapshot(&mut self, now: Instant, gauges: Gauges, reset: bool) -> StatsSnapshot {
        let latency_avg = u32::try_from(self.latency_count)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| self.latency_total / n);
        let snapshot = StatsSnapshot {
            interval: now.saturating_duration_since(self.since),
            messages_sent: self.messages_sent,
            messages_resent: self.messages_resent,
            messages_received: self.messages_received,
            duplicates_received: self.duplicates_received,
            channels_opened: self.channels_opened,
            channels_closed: self.channels_closed,
            acknowledged: self.latency_count,
            latency_min: self.latency_min,
            latency_max: self.latency_max,
            latency_avg,
            open_channels: gauges.open_channels,
            retired_channels: gauges.retired_channels,
            aliased_channels: gauges.aliased_channels,
            messages_queued: gauges.messages_queued,
            messages_in_flight: gauges.messages_in_flight,
        };
        if reset {
            *self = Self::new(now);
        }
        snapshot
    }
}

/// Point-in-time values computed from the channel table.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Gauges {
    pub(crate) open_channels: usize,
    pub(crate) retired_channels: usize,
    pub(crate) aliased_channels: usize,
    pub(crate) messages_queued: usize,
    pub(crate) messages_in_flight: usize,
}

/// Statistics for one reporting interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Time covered by the counters.
    pub interval: Duration,
    /// Messages written for the first time.
    pub messages_sent: u64,
    /// Duplicate copies written by the resend timer.
    pub messages_resent: u64,
    /// Messages read.
    pub messages_received: u64,
    /// Messages read with the duplicate flag set.
    pub duplicates_received: u64,
    /// Channels opened.
    pub channels_opened: u64,
    /// Channels closed.
    pub channels_closed: u64,
    /// Messages settled by an acknowledgment.
    pub acknowledged: u64,
    /// Fastest acknowledgment.
    pub latency_min: Option<Duration>,
    /// Slowest acknowledgment.
    pub latency_max: Option<Duration>,
    /// Mean acknowledgment time.
    pub latency_avg: Option<Duration>,
    /// Channels currently open.
    pub open_channels: usize,
    /// Closed channels whose unsent messages are retained.
    pub retired_channels: usize,
    /// Handles redirected to another channel by a transfer.
    pub aliased_channels: usize,
    /// Messages waiting to be written.
    pub messages_queued: usize,
    /// Messages written and awaiting acknowledgment.
    pub messages_in_flight: usize,
}

impl StatsSnapshot {
    /// Export as metrics.
    #[must_use]
    pub fn to_metrics(&self) -> MetricsPayload {
        let mut payload = MetricsPayload::new();
        payload.counter("messages_sent_total", self.messages_sent);
        payload.counter("messages_resent_total", self.messages_resent);
        payload.counter("messages_received_total", self.messages_received);
        payload.counter("duplicates_received_total", self.duplicates_received);
        payload.counter("channels_opened_total", self.channels_opened);
        payload.counter("channels_closed_total", self.channels_closed);
        payload.counter("messages_acknowledged_total", self.acknowledged);

        payload.gauge("open_channels", self.open_channels as f64);
        payload.gauge("retired_channels", self.retired_channels as f64);
        payload.gauge("aliased_channels", self.aliased_channels as f64);
        payload.gauge("messages_queued", self.messages_queued as f64);
        payload.gauge("messages_in_flight", self.messages_in_flight as f64);
        if let Some(avg) = self.latency_avg {
            payload.gauge("ack_latency_avg_seconds", avg.as_secs_f64());
        }
        if let Some(max) = self.latency_max {
            payload.gauge("ack_latency_max_seconds", max.as_secs_f64());
        }
        if let Some(min) = self.latency_min {
            payload.gauge("ack_latency_min_seconds", min.as_secs_f64());
        }
        payload
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent={} resent={} received={} dup={} open={} queued={} in_flight={}",
            self.messages_sent,
            self.messages_resent,
            self.messages_received,
            self.duplicates_received,
            self.open_channels,
            self.messages_queued,
            self.messages_in_flight,
        )?;
        if let (Some(min), Some(avg), Some(max)) = (self.latency_min, self.latency_avg, self.latency_max) {
            write!(f, " latency={min:?}/{avg:?}/{max:?}")?;
        }
        Ok(())
    }
}
