//! [`Finder`] – locates a device on the local network.
//!
//! The handshake has two legs:
//!
//! 1. [`Finder::find`] broadcasts a probe, re-sending it every
//!    [`FinderConfig::probe_interval`], until a reply whose app id passes the
//!    filter arrives or the timeout elapses.
//! 2. [`Finder::send_ack`] tells the chosen device to start accepting bridge
//!    connections. It is sent once and not retried.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rmbridge_types::BridgeError;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::wire::{ANY_APP_ID, Announcement, Datagram};

pub const DEFAULT_PROBE_PORT: u16 = 45678;
pub const DEFAULT_ACK_PORT: u16 = 45679;
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

const MAX_DATAGRAM: usize = 512;

#[derive(Debug, Clone)]
pub struct FinderConfig {
    /// Only devices announcing this app id are accepted; [`ANY_APP_ID`]
    /// accepts every device.
    pub app_id: u64,
    /// Where probes are sent.
    pub probe_target: SocketAddr,
    /// Local address the discovery socket binds to.
    pub bind: SocketAddr,
    /// Port the ack is unicast to on the discovered device.
    pub ack_port: u16,
    pub probe_interval: Duration,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            app_id: ANY_APP_ID,
            probe_target: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DEFAULT_PROBE_PORT),
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            ack_port: DEFAULT_ACK_PORT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

/// A device that answered a probe. Valid for one discovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    source: IpAddr,
    announcement: Announcement,
    seen_at: DateTime<Utc>,
}

impl Beacon {
    /// Address the reply came from; this is where the bridge connects.
    pub fn source_ip(&self) -> IpAddr {
        self.source
    }

    pub fn app_id(&self) -> u64 {
        self.announcement.app_id
    }

    /// Address the device announced for itself.
    pub fn announced_ip(&self) -> Ipv4Addr {
        self.announcement.ip
    }

    pub fn mac(&self) -> [u8; 6] {
        self.announcement.mac
    }

    pub fn is_pairing(&self) -> bool {
        self.announcement.pairing
    }

    pub fn seen_at(&self) -> DateTime<Utc> {
        self.seen_at
    }
}

pub struct Finder {
    config: FinderConfig,
}

impl Finder {
    pub fn new(config: FinderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    fn accepts(&self, app_id: u64) -> bool {
        self.config.app_id == ANY_APP_ID || self.config.app_id == app_id
    }

    /// Probe until a matching device answers.
    ///
    /// # Errors
    ///
    /// [`BridgeError::DiscoveryTimeout`] if nothing matching answers within
    /// `timeout`; [`BridgeError::Network`] if the socket cannot be set up or
    /// a probe cannot be sent. Receive errors are logged and the search
    /// goes on.
    pub async fn find(&self, timeout: Duration) -> Result<Beacon, BridgeError> {
        let socket = UdpSocket::bind(self.config.bind).await?;
        socket.set_broadcast(true)?;
        let probe = Datagram::Probe {
            app_id: self.config.app_id,
        }
        .encode();

        info!(app_id = self.config.app_id, target = %self.config.probe_target, ?timeout, "searching for device");

        let deadline = Instant::now() + timeout;
        let mut ticker = time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = [0u8; MAX_DATAGRAM];

        let search = async {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        socket
                            .send_to(&probe, self.config.probe_target)
                            .await
                            .map_err(|e| BridgeError::Network(format!("probe send failed: {e}")))?;
                        trace!(target = %self.config.probe_target, "probe sent");
                    }
                    received = socket.recv_from(&mut buf) => {
                        if let Some(beacon) = self.on_received(received, &buf) {
                            return Ok::<Beacon, BridgeError>(beacon);
                        }
                    }
                }
            }
        };

        match time::timeout_at(deadline, search).await {
            Ok(found) => found,
            Err(_) => Err(BridgeError::DiscoveryTimeout(timeout)),
        }
    }

    // Windows reports an ICMP port-unreachable from an earlier probe as a
    // failed receive; later replies still arrive on the same socket.
    fn on_received(&self, received: io::Result<(usize, SocketAddr)>, buf: &[u8]) -> Option<Beacon> {
        match received {
            Ok((len, from)) => self.evaluate(&buf[..len], from),
            Err(e) => {
                warn!(error = %e, "receive failed, still searching");
                None
            }
        }
    }

    fn evaluate(&self, datagram: &[u8], from: SocketAddr) -> Option<Beacon> {
        match Datagram::decode(datagram) {
            Ok(Datagram::Reply(announcement)) if self.accepts(announcement.app_id) => {
                info!(source = %from.ip(), app_id = announcement.app_id, pairing = announcement.pairing, "device found");
                Some(Beacon {
                    source: from.ip(),
                    announcement,
                    seen_at: Utc::now(),
                })
            }
            Ok(Datagram::Reply(announcement)) => {
                debug!(source = %from, app_id = announcement.app_id, wanted = self.config.app_id, "ignoring device with another app id");
                None
            }
            Ok(other) => {
                trace!(source = %from, ?other, "ignoring non-reply datagram");
                None
            }
            Err(e) => {
                warn!(source = %from, error = %e, "ignoring malformed datagram");
                None
            }
        }
    }

    /// Acknowledge a discovered device so it starts accepting connections.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Network`] if the datagram cannot be sent.
    pub async fn send_ack(&self, target: IpAddr, app_id: u64) -> Result<(), BridgeError> {
        let bind = match target {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind).await?;
        let to = SocketAddr::new(target, self.config.ack_port);
        socket
            .send_to(&Datagram::Ack { app_id }.encode(), to)
            .await
            .map_err(|e| BridgeError::Network(format!("ack send to {to} failed: {e}")))?;
        debug!(%to, app_id, "ack sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    /// Device double: answers every probe with each of `replies` in turn,
    /// repeating the last one.
    async fn fake_device(replies: Vec<Announcement>) -> Result<SocketAddr, Box<dyn Error>> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            let mut next = 0;
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                if !matches!(Datagram::decode(&buf[..len]), Ok(Datagram::Probe { .. })) {
                    continue;
                }
                let reply = replies[next.min(replies.len() - 1)];
                next += 1;
                let _ = socket.send_to(&Datagram::Reply(reply).encode(), from).await;
            }
        });
        Ok(addr)
    }

    fn announcement(app_id: u64) -> Announcement {
        Announcement {
            app_id,
            ip: Ipv4Addr::new(10, 0, 0, 9),
            mac: [1, 2, 3, 4, 5, 6],
            pairing: false,
        }
    }

    fn finder(app_id: u64, device: SocketAddr) -> Finder {
        Finder::new(FinderConfig {
            app_id,
            probe_target: device,
            bind: "127.0.0.1:0".parse().expect("valid addr"),
            probe_interval: Duration::from_millis(20),
            ..FinderConfig::default()
        })
    }

    #[tokio::test]
    async fn matching_reply_populates_source_address() -> Result<(), Box<dyn Error>> {
        let device = fake_device(vec![announcement(99)]).await?;
        let beacon = finder(99, device).find(Duration::from_secs(2)).await?;

        assert_eq!(beacon.source_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(beacon.announced_ip(), Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(beacon.app_id(), 99);
        assert_eq!(beacon.mac(), [1, 2, 3, 4, 5, 6]);
        Ok(())
    }

    #[test]
    fn receive_errors_do_not_end_the_search() {
        let device: SocketAddr = "127.0.0.1:45678".parse().expect("valid addr");
        let finder = finder(5, device);

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(finder.on_received(Err(reset), &[]).is_none());

        let reply = Datagram::Reply(announcement(5)).encode();
        let beacon = finder
            .on_received(Ok((reply.len(), device)), &reply)
            .expect("reply after an error is still accepted");
        assert_eq!(beacon.app_id(), 5);
    }

    #[tokio::test]
    async fn mismatched_app_id_is_skipped() -> Result<(), Box<dyn Error>> {
        let device = fake_device(vec![announcement(7), announcement(42)]).await?;
        let beacon = finder(42, device).find(Duration::from_secs(2)).await?;
        assert_eq!(beacon.app_id(), 42);
        Ok(())
    }

    #[tokio::test]
    async fn only_mismatched_replies_time_out() -> Result<(), Box<dyn Error>> {
        let device = fake_device(vec![announcement(7)]).await?;
        let result = finder(42, device).find(Duration::from_millis(150)).await;
        assert!(matches!(result, Err(BridgeError::DiscoveryTimeout(_))));
        Ok(())
    }

    #[tokio::test]
    async fn wildcard_accepts_any_device() -> Result<(), Box<dyn Error>> {
        let device = fake_device(vec![announcement(1234)]).await?;
        let beacon = finder(ANY_APP_ID, device).find(Duration::from_secs(2)).await?;
        assert_eq!(beacon.app_id(), 1234);
        Ok(())
    }

    #[tokio::test]
    async fn ack_reaches_device() -> Result<(), Box<dyn Error>> {
        let device = UdpSocket::bind("127.0.0.1:0").await?;
        let port = device.local_addr()?.port();
        let finder = Finder::new(FinderConfig {
            ack_port: port,
            ..FinderConfig::default()
        });

        finder.send_ack(IpAddr::V4(Ipv4Addr::LOCALHOST), 5).await?;

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, _) = time::timeout(Duration::from_secs(2), device.recv_from(&mut buf)).await??;
        assert_eq!(Datagram::decode(&buf[..len])?, Datagram::Ack { app_id: 5 });
        Ok(())
    }
}
