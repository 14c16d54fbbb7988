//! Keep-alive policy, selected by the channel's role.

use crate::packet::{MqttError, MqttResult};
use std::time::{Duration, Instant};

/// Which side of the protocol a channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends CONNECT; probes an idle link with PINGREQ.
    Client,
    /// Receives CONNECT; drops a peer silent for 1.5x its keep-alive.
    Broker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Broker => write!(f, "broker"),
        }
    }
}

/// What the channel should do after a keep-alive check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Queue a PINGREQ, then check again after the given delay.
    SendPing(Duration),
    /// Nothing to do; check again after the delay, or never.
    Wait(Option<Duration>),
}

/// Keep-alive state for one channel.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    role: Role,
    interval: Option<Duration>,
    ping_sent_at: Option<Instant>,
}

impl KeepAlive {
    /// Keep-alive disabled until an interval is negotiated.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            interval: None,
            ping_sent_at: None,
        }
    }

    /// The channel's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiated interval, `None` when disabled.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Apply the interval carried in CONNECT. Zero disables keep-alive.
    pub fn set_interval_secs(&mut self, seconds: u16) {
        self.interval = (seconds > 0).then(|| Duration::from_secs(u64::from(seconds)));
    }

    /// Whether a PINGREQ is awaiting any response.
    #[must_use]
    pub fn ping_outstanding(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// Any inbound traffic answers an outstanding ping.
    pub fn on_received(&mut self) {
        self.ping_sent_at = None;
    }

    /// Run the role's keep-alive rule.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::KeepAliveTimeout`] when the channel must close.
    pub fn poll(
        &mut self,
        now: Instant,
        last_received: Instant,
        last_sent: Instant,
    ) -> MqttResult<KeepAliveAction> {
        let Some(interval) = self.interval else {
            return Ok(KeepAliveAction::Wait(None));
        };

        match self.role {
            Role::Client => {
                if let Some(sent_at) = self.ping_sent_at {
                    let waited = now.saturating_duration_since(sent_at);
                    if waited >= interval {
                        return Err(MqttError::KeepAliveTimeout(interval));
                    }
                    return Ok(KeepAliveAction::Wait(Some(interval - waited)));
                }

                let idle = now.saturating_duration_since(last_sent);
                if idle >= interval {
                    self.ping_sent_at = Some(now);
                    Ok(KeepAliveAction::SendPing(interval))
                } else {
                    Ok(KeepAliveAction::Wait(Some(interval - idle)))
                }
            },
            Role::Broker => {
                let window = interval * 3 / 2;
                let silent = now.saturating_duration_since(last_received);
                if silent >= window {
                    Err(MqttError::KeepAliveTimeout(window))
                } else {
                    Ok(KeepAliveAction::Wait(Some(window - silent)))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_disabled() {
        let mut ka = KeepAlive::new(Role::Client);
        let t0 = Instant::now();
        assert_eq!(
            ka.poll(t0 + secs(1000), t0, t0).unwrap(),
            KeepAliveAction::Wait(None)
        );
        ka.set_interval_secs(0);
        assert_eq!(ka.interval(), None);
    }

    #[test]
    fn test_client_single_ping_then_timeout() {
        let mut ka = KeepAlive::new(Role::Client);
        ka.set_interval_secs(10);
        let t0 = Instant::now();

        assert_eq!(
            ka.poll(t0 + secs(4), t0, t0).unwrap(),
            KeepAliveAction::Wait(Some(secs(6)))
        );
        assert_eq!(
            ka.poll(t0 + secs(10), t0, t0).unwrap(),
            KeepAliveAction::SendPing(secs(10))
        );
        assert!(ka.ping_outstanding());

        // No second ping while the first is outstanding.
        let ping_at = t0 + secs(10);
        assert_eq!(
            ka.poll(t0 + secs(15), t0, ping_at).unwrap(),
            KeepAliveAction::Wait(Some(secs(5)))
        );
        assert!(matches!(
            ka.poll(t0 + secs(20), t0, ping_at),
            Err(MqttError::KeepAliveTimeout(_))
        ));
    }

    #[test]
    fn test_client_traffic_answers_ping() {
        let mut ka = KeepAlive::new(Role::Client);
        ka.set_interval_secs(10);
        let t0 = Instant::now();
        let ping_at = t0 + secs(10);

        assert!(matches!(
            ka.poll(ping_at, t0, t0).unwrap(),
            KeepAliveAction::SendPing(_)
        ));
        // A PUBACK arrives inside the window.
        ka.on_received();
        assert!(!ka.ping_outstanding());
        assert_eq!(
            ka.poll(t0 + secs(19), t0 + secs(12), ping_at).unwrap(),
            KeepAliveAction::Wait(Some(secs(1)))
        );
    }

    #[test]
    fn test_client_recent_send_defers_ping() {
        let mut ka = KeepAlive::new(Role::Client);
        ka.set_interval_secs(10);
        let t0 = Instant::now();
        assert_eq!(
            ka.poll(t0 + secs(12), t0, t0 + secs(8)).unwrap(),
            KeepAliveAction::Wait(Some(secs(6)))
        );
    }

    #[test]
    fn test_broker_window() {
        let mut ka = KeepAlive::new(Role::Broker);
        ka.set_interval_secs(10);
        let t0 = Instant::now();

        assert_eq!(
            ka.poll(t0 + secs(14), t0, t0).unwrap(),
            KeepAliveAction::Wait(Some(secs(1)))
        );
        assert!(matches!(
            ka.poll(t0 + secs(15), t0, t0),
            Err(MqttError::KeepAliveTimeout(d)) if d == secs(15)
        ));
        // Traffic inside the window keeps it open; brokers never ping.
        assert_eq!(
            ka.poll(t0 + secs(15), t0 + secs(5), t0).unwrap(),
            KeepAliveAction::Wait(Some(secs(10)))
        );
    }
}
