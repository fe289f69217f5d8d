use crate::params::TransportParameters;
use crate::shared::Side;
use crate::streams::LocalStreamConfig;
use crate::wire::cid::{ConnectionId, ResetToken};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Parameters governing one connection's transport machinery: the limits we
/// advertise, datagram sizing, and the loss-detection knobs. Defaults suit a
/// local-network path; all fields load from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub initial_max_data: u32,
    pub initial_max_stream_data: u32,
    pub initial_max_bidi_streams: u16,
    pub initial_max_uni_streams: u16,
    /// Seconds; zero disables the idle timer.
    pub idle_timeout_secs: u16,
    /// Largest packet we are willing to receive, advertised to the peer.
    pub max_packet_size: u16,
    /// Largest datagram we emit; also the congestion window unit.
    pub max_datagram_size: u16,
    pub ack_delay_exponent: u8,
    /// Milliseconds, advertised to the peer.
    pub max_ack_delay_ms: u8,
    /// Reordering distance before a packet is declared lost.
    pub packet_threshold: u64,
    /// Multiplier over the RTT for time-based loss.
    pub time_threshold: f32,
    /// Milliseconds assumed before the first RTT sample.
    pub initial_rtt_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            initial_max_data: 1 << 20,
            initial_max_stream_data: 1 << 16,
            initial_max_bidi_streams: 100,
            initial_max_uni_streams: 16,
            idle_timeout_secs: 30,
            max_packet_size: 65527,
            max_datagram_size: 1460,
            ack_delay_exponent: 3,
            max_ack_delay_ms: 25,
            packet_threshold: 3,
            time_threshold: 1.125,
            initial_rtt_ms: 100,
        }
    }
}

impl TransportConfig {
    /// Loads the configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> TransportConfig {
        serdeconv::from_toml_file(path).expect("Error loading transport configuration file")
    }

    #[inline]
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(u64::from(self.idle_timeout_secs)))
        }
    }

    #[inline]
    pub fn initial_rtt(&self) -> Duration {
        Duration::from_millis(self.initial_rtt_ms)
    }

    #[inline]
    pub fn max_ack_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.max_ack_delay_ms))
    }

    /// The transport parameters this configuration advertises. The reset
    /// token and original connection ID are server-side extras.
    pub(crate) fn to_parameters(
        &self,
        side: Side,
        reset_token: Option<ResetToken>,
        original_connection_id: Option<ConnectionId>,
    ) -> TransportParameters {
        let mut params = TransportParameters::default();

        params.initial_max_stream_data_bidi_local = self.initial_max_stream_data;
        params.initial_max_stream_data_bidi_remote = self.initial_max_stream_data;
        params.initial_max_stream_data_uni = self.initial_max_stream_data;
        params.initial_max_data = self.initial_max_data;
        params.initial_max_bidi_streams = self.initial_max_bidi_streams;
        params.initial_max_uni_streams = self.initial_max_uni_streams;
        params.idle_timeout = self.idle_timeout_secs;
        params.max_packet_size = self.max_packet_size;
        params.ack_delay_exponent = self.ack_delay_exponent;
        params.max_ack_delay = self.max_ack_delay_ms;

        if side.is_server() {
            params.stateless_reset_token = reset_token;
            params.original_connection_id = original_connection_id;
        }

        params
    }

    pub(crate) fn stream_config(&self) -> LocalStreamConfig {
        LocalStreamConfig {
            initial_max_data: u64::from(self.initial_max_data),
            initial_max_stream_data: u64::from(self.initial_max_stream_data),
            max_bidi_streams: u64::from(self.initial_max_bidi_streams),
            max_uni_streams: u64::from(self.initial_max_uni_streams),
        }
    }
}

/// Endpoint-wide settings: connection-ID policy and the version set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Length of the connection IDs this endpoint mints for itself.
    pub local_cid_len: usize,
    /// Accepted versions, most preferred first.
    pub supported_versions: Vec<u32>,
}

impl Default for EndpointConfig {
    fn default() -> EndpointConfig {
        EndpointConfig {
            local_cid_len: 8,
            supported_versions: crate::SUPPORTED_VERSIONS.to_vec(),
        }
    }
}

impl EndpointConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> EndpointConfig {
        serdeconv::from_toml_file(path).expect("Error loading endpoint configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();

        assert_eq!(config.max_datagram_size, 1460);
        assert_eq!(config.packet_threshold, 3);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_ack_delay(), Duration::from_millis(25));

        let endpoint = EndpointConfig::default();
        assert_eq!(endpoint.local_cid_len, 8);
        assert_eq!(endpoint.supported_versions, vec![crate::QUIC_VERSION]);
    }

    #[test]
    fn test_zero_idle_timeout_disables_timer() {
        let mut config = TransportConfig::default();
        config.idle_timeout_secs = 0;
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn test_partial_toml_overrides_defaults() {
        let config: TransportConfig = serdeconv::from_toml_str(
            r#"
initial_max_data = 2048
idle_timeout_secs = 5
"#,
        )
        .unwrap();

        assert_eq!(config.initial_max_data, 2048);
        assert_eq!(config.idle_timeout_secs, 5);
        assert_eq!(config.max_datagram_size, 1460);
    }

    #[test]
    fn test_parameters_mapping() {
        let config = TransportConfig::default();
        let token = ResetToken::new([1; 16]);

        let params = config.to_parameters(Side::Server, Some(token), None);
        assert_eq!(params.initial_max_data, config.initial_max_data);
        assert_eq!(params.idle_timeout, config.idle_timeout_secs);
        assert_eq!(params.stateless_reset_token, Some(token));

        let params = config.to_parameters(Side::Client, Some(token), None);
        assert_eq!(params.stateless_reset_token, None);
    }
}
