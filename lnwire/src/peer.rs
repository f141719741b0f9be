// LNP Node Core Library implementing Lightning network channels
// and HTLC switching.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! BOLT-1 connection-level messages: feature negotiation, diagnostics and
//! keepalive.

use std::fmt::{self, Display, Formatter};

use internet2::tlv;

use super::{ChannelId, InitFeatures};

/// Once authentication is complete, the first message reveals the features
/// supported or required by this node, even if this is a reconnection.
///
/// # Specification
/// <https://github.com/lightning/bolts/blob/master/01-messaging.md#the-init-message>
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
#[network_encoding(use_tlv)]
#[lightning_encoding(use_tlv)]
#[display("init({global_features}, {local_features})")]
pub struct Init {
    pub global_features: InitFeatures,
    pub local_features: InitFeatures,

    #[lightning_encoding(unknown_tlvs)]
    #[network_encoding(unknown_tlvs)]
    pub unknown_tlvs: tlv::Stream,
}

impl Init {
    /// Combined feature vector: BOLT-9 obsoleted the global/local distinction
    /// by merging both ranges, with the global vector kept for backwards
    /// compatibility.
    pub fn features(&self) -> InitFeatures {
        self.local_features.clone() | self.global_features.clone()
    }
}

/// In order to allow for the existence of long-lived TCP connections, at
/// times it may be required that both ends keep alive the TCP connection
/// at the application level. Such messages also allow obfuscation of
/// traffic patterns.
///
/// # Specification
/// <https://github.com/lightning/bolts/blob/master/01-messaging.md#the-ping-and-pong-messages>
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
#[display("ping({pong_size})")]
pub struct Ping {
    /// Number of bytes the receiver should include within the data payload of
    /// the reply pong message
    pub pong_size: u16,

    /// Ignored padding used for traffic pattern obfuscation
    pub ignored: Vec<u8>,
}

/// The pong message is to be sent whenever a ping message is received. It
/// serves as a reply and also serves to keep the connection alive, while
/// explicitly notifying the other end that the receiver is still active.
#[derive(Wrapper, Clone, PartialEq, Eq, Debug, Default, From)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
pub struct Pong(Vec<u8>);

impl Pong {
    /// Constructs pong reply with the number of bytes requested by the
    /// received ping message
    pub fn with(pong_size: u16) -> Pong {
        Pong(vec![0u8; pong_size as usize])
    }
}

impl Display for Pong {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "pong({})", self.0.len())
    }
}

/// For simplicity of diagnosis, it's often useful to tell a peer that
/// something is incorrect.
///
/// # Specification
/// <https://github.com/lightning/bolts/blob/master/01-messaging.md#the-error-message>
#[derive(Clone, PartialEq, Eq, Debug, Error)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
pub struct Error {
    /// The channel is referred to by channel_id, unless channel_id is 0 (i.e.
    /// all bytes are 0), in which case it refers to all channels.
    pub channel_id: ChannelId,

    /// Any specific error details, either as string or binary data
    pub data: Vec<u8>,
}

impl Error {
    /// Constructs error message addressed to a specific channel
    pub fn with(channel_id: ChannelId, message: impl ToString) -> Error {
        Error {
            channel_id,
            data: message.to_string().into_bytes(),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("error")?;
        if self.channel_id.is_wildcard() {
            f.write_str(" on all channels")?;
        } else {
            write!(f, " on channel {}", self.channel_id)?;
        }
        // NB: if data is not composed solely of printable ASCII characters
        // (byte values 32 through 126, inclusive) it should not be printed out
        // verbatim.
        if self.data.iter().all(|byte| (32..=126).contains(byte)) {
            if let Ok(msg) = String::from_utf8(self.data.clone()) {
                write!(f, ": {}", msg)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use amplify::hex::FromHex;
    use amplify::Wrapper;
    use lightning_encoding::{LightningDecode, LightningEncode};

    use super::*;
    use crate::Messages;

    #[test]
    fn init_testvec() {
        let init_msg = Messages::Init(Init {
            global_features: InitFeatures::default(),
            local_features: InitFeatures::default(),
            unknown_tlvs: none!(),
        });
        assert_eq!(
            init_msg.lightning_serialize().unwrap(),
            Vec::<u8>::from_hex("001000000000").unwrap()
        );
    }

    #[test]
    fn init_lnd_testvec() {
        // Real init message sent by lnd
        let init_recv = Vec::<u8>::from_hex(
            "001000021200000253ea",
        )
        .unwrap();
        let msg = Messages::lightning_deserialize(&init_recv);
        assert!(msg.is_ok());
    }

    #[test]
    fn error_display() {
        let err = Error::with(ChannelId::default(), "permission denied");
        assert_eq!(
            err.to_string(),
            "error on all channels: permission denied"
        );
    }

    #[test]
    fn pong_sizing() {
        let ping = Ping {
            pong_size: 4,
            ignored: vec![0u8; 2],
        };
        let pong = Pong::with(ping.pong_size);
        assert_eq!(pong.as_inner().len(), 4);
    }
}
