use crate::Error;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// STUN/TURN servers handed to every ICE gatherer.
    ///
    /// If empty, the [`TransportFactory::default_ice_servers`](crate::TransportFactory::default_ice_servers) are used.
    pub ice_servers: Vec<IceServer>,
    /// Which candidates the ICE gatherers may use
    pub ice_transport_policy: IceTransportPolicy,
    /// Policy to use when assigning media lines to transports
    pub bundle_policy: BundlePolicy,
    /// Policy when negotiating RTP & RTCP multiplexing over the same transport
    pub rtcp_mux_policy: RtcpMuxPolicy,
    /// Number of candidates to pre-gather before any description is created
    pub ice_candidate_pool_size: u8,
    /// How media transports are secured
    pub secure_transport: SecureTransportType,
    /// Accept [`DataChannel::send`](crate::DataChannel::send) while the channel is still connecting, messages are
    /// queued and sent in order once it opens. When disabled sending on a connecting channel is an error.
    pub buffer_data_channel_while_connecting: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceServer {
    /// `stun:`, `stuns:`, `turn:` or `turns:` urls
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceTransportPolicy {
    #[default]
    All,
    /// Only use relayed candidates
    Relay,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    /// One transport per media kind (audio, video, data)
    #[default]
    Balanced,
    /// One transport per media line
    MaxCompat,
    /// Everything over a single transport
    MaxBundle,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RtcpMuxPolicy {
    /// Require RTCP muxing, fail if the peer doesn't support it.
    #[default]
    Require,
    /// Offer multiplexing RTCP on the RTP transport,
    /// but have a separate RTCP transport ready if the peer doesn't support it.
    Negotiate,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecureTransportType {
    /// SRTP using key exchange over DTLS
    #[default]
    DtlsSrtp,
    /// SRTP using key exchange over the signaling channel
    SdesSrtp,
}

impl Configuration {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::InvalidParameters(
                    "ice server without urls".into(),
                ));
            }

            for url in &server.urls {
                let (scheme, _) = url.split_once(':').ok_or_else(|| {
                    Error::InvalidParameters(format!("malformed ice server url {url:?}"))
                })?;

                match scheme {
                    "stun" | "stuns" => {}
                    "turn" | "turns" => {
                        if server.username.is_none() || server.credential.is_none() {
                            return Err(Error::InvalidParameters(format!(
                                "turn server {url:?} requires username and credential"
                            )));
                        }
                    }
                    _ => {
                        return Err(Error::InvalidParameters(format!(
                            "unsupported ice server url {url:?}"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Check that `new` only changes settings which may be changed on a running connection
    pub(crate) fn validate_update(&self, new: &Configuration) -> Result<(), Error> {
        new.validate()?;

        if self.bundle_policy != new.bundle_policy {
            return Err(Error::InvalidParameters(
                "bundle policy cannot be changed".into(),
            ));
        }

        if self.rtcp_mux_policy != new.rtcp_mux_policy {
            return Err(Error::InvalidParameters(
                "rtcp mux policy cannot be changed".into(),
            ));
        }

        if self.secure_transport != new.secure_transport {
            return Err(Error::InvalidParameters(
                "secure transport type cannot be changed".into(),
            ));
        }

        Ok(())
    }
}
