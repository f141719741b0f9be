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

//! BOLT-11 invoice decoding, consumer side.
//!
//! The switch consumes decoded invoices for final-hop validation (amount,
//! payment secret, minimal final CLTV delta); invoice *production* is the
//! job of an external component. Only the fields the node core acts upon
//! are surfaced; unknown tagged fields are skipped as the specification
//! requires.

use amplify::Slice32;
use bitcoin::bech32::{self, u5, FromBase32};
use bitcoin_scripts::hlc::HashLock;
use secp256k1::PublicKey;

use crate::htlcswitch::InvoiceTerms;

/// Default `min_final_cltv_expiry` when the `c` field is absent, BOLT-11
pub const DEFAULT_MIN_FINAL_CLTV: u32 = 18;

/// Default expiry when the `x` field is absent, BOLT-11
pub const DEFAULT_EXPIRY_SECS: u64 = 3600;

/// Length of one route-hint hop: pubkey(33) + short_channel_id(8) +
/// fee_base(4) + fee_ppm(4) + cltv_delta(2)
const ROUTE_HINT_HOP_LEN: usize = 51;

/// Invoice decoding errors
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// invalid bech32 encoding: {0}
    #[from]
    Bech32(bech32::Error),

    /// the human-readable part `{0}` does not carry the `ln` prefix
    WrongPrefix(String),

    /// unparsable amount `{0}` in the human-readable part
    WrongAmount(String),

    /// invoice data part is too short to carry timestamp and signature
    TooShort,

    /// tagged field `{0}` is truncated
    TruncatedField(char),

    /// invoice carries no payment hash
    NoPaymentHash,

    /// invalid destination node key
    WrongNodeId,
}

/// One route hint hop from an `r` field
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RouteHintHop {
    pub node_id: PublicKey,
    pub short_channel_id: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
}

/// Decoded BOLT-11 invoice
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Invoice {
    /// Network part of the human-readable prefix (`bc`, `tb`, `bcrt`...)
    pub network: String,

    /// Invoiced amount; `None` for "any amount" invoices
    pub amount_msat: Option<u64>,

    /// Invoice creation timestamp, unix seconds
    pub timestamp: u64,

    /// Payment hash (`p` field)
    pub payment_hash: HashLock,

    /// Payment secret (`s` field)
    pub payment_secret: Option<Slice32>,

    /// Human-readable description (`d` field)
    pub description: Option<String>,

    /// Hash of a longer description (`h` field)
    pub description_hash: Option<Slice32>,

    /// Expiry in seconds since the timestamp (`x` field)
    pub expiry_secs: u64,

    /// Minimal final CLTV delta (`c` field)
    pub min_final_cltv_delta: u32,

    /// Destination node (`n` field); absent invoices identify the payee
    /// through signature recovery performed by the payment layer
    pub node_id: Option<PublicKey>,

    /// Route hints (`r` fields)
    pub route_hints: Vec<Vec<RouteHintHop>>,

    /// Raw feature bits (`9` field)
    pub features: Vec<u8>,

    /// Recoverable signature over the invoice (64 + 1 bytes)
    pub signature: Vec<u8>,
}

impl Invoice {
    /// Final-hop validation terms for the switch
    pub fn terms(&self) -> InvoiceTerms {
        InvoiceTerms {
            amount_msat: self.amount_msat,
            min_final_cltv_delta: self.min_final_cltv_delta,
            payment_secret: self.payment_secret,
        }
    }

    /// Detects whether the invoice expired at the given unix time
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.timestamp + self.expiry_secs
    }
}

fn parse_hrp(hrp: &str) -> Result<(String, Option<u64>), Error> {
    let rest = hrp
        .strip_prefix("ln")
        .ok_or_else(|| Error::WrongPrefix(hrp.to_owned()))?;

    // The network part is the maximal leading run without digits
    let split = rest
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(rest.len());
    let (network, amount) = rest.split_at(split);
    if amount.is_empty() {
        return Ok((network.to_owned(), None));
    }

    let (digits, multiplier) = match amount.chars().last() {
        Some(suffix @ ('m' | 'u' | 'n' | 'p')) => {
            (&amount[..amount.len() - 1], Some(suffix))
        }
        _ => (amount, None),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::WrongAmount(amount.to_owned()))?;
    // Amounts are in bitcoin units scaled by the multiplier; one bitcoin
    // is 10^11 millisatoshi
    let msat = match multiplier {
        None => value.checked_mul(100_000_000_000),
        Some('m') => value.checked_mul(100_000_000),
        Some('u') => value.checked_mul(100_000),
        Some('n') => value.checked_mul(100),
        Some('p') => {
            // Pico-bitcoin must be divisible by 10 to express msat
            if value % 10 != 0 {
                return Err(Error::WrongAmount(amount.to_owned()));
            }
            Some(value / 10)
        }
        Some(_) => unreachable!("filtered by the match above"),
    }
    .ok_or_else(|| Error::WrongAmount(amount.to_owned()))?;
    Ok((network.to_owned(), Some(msat)))
}

fn field_u64(data: &[u5]) -> u64 {
    data.iter()
        .fold(0u64, |acc, value| (acc << 5) | value.to_u8() as u64)
}

fn field_bytes(data: &[u5]) -> Option<Vec<u8>> {
    Vec::<u8>::from_base32(data).ok()
}

fn field_slice32(data: &[u5]) -> Option<Slice32> {
    let bytes = field_bytes(data)?;
    if bytes.len() != 32 {
        return None;
    }
    let mut slice = [0u8; 32];
    slice.copy_from_slice(&bytes);
    Some(Slice32::from_inner(slice))
}

/// Decodes a BOLT-11 invoice string.
///
/// Unknown fields and fields with unexpected lengths are skipped, as the
/// specification mandates.
pub fn decode(invoice: &str) -> Result<Invoice, Error> {
    let (hrp, data, _variant) = bech32::decode(invoice)?;
    let (network, amount_msat) = parse_hrp(&hrp)?;

    // timestamp (7 groups) + signature (104 groups)
    if data.len() < 7 + 104 {
        return Err(Error::TooShort);
    }
    let timestamp = field_u64(&data[..7]);
    let (mut fields, signature) = data[7..].split_at(data.len() - 7 - 104);
    let signature =
        Vec::<u8>::from_base32(signature).map_err(Error::from)?;

    let mut payment_hash = None;
    let mut payment_secret = None;
    let mut description = None;
    let mut description_hash = None;
    let mut expiry_secs = DEFAULT_EXPIRY_SECS;
    let mut min_final_cltv_delta = DEFAULT_MIN_FINAL_CLTV;
    let mut node_id = None;
    let mut route_hints = vec![];
    let mut features = vec![];

    while !fields.is_empty() {
        if fields.len() < 3 {
            return Err(Error::TruncatedField('?'));
        }
        let tag = fields[0].to_u8();
        let length =
            ((fields[1].to_u8() as usize) << 5) | fields[2].to_u8() as usize;
        if fields.len() < 3 + length {
            return Err(Error::TruncatedField(tag_char(tag)));
        }
        let payload = &fields[3..3 + length];
        fields = &fields[3 + length..];

        match tag {
            // p: payment hash, exactly 52 groups
            1 if length == 52 => {
                payment_hash = field_slice32(payload).map(HashLock::from);
            }
            // s: payment secret
            16 if length == 52 => {
                payment_secret = field_slice32(payload);
            }
            // d: short description
            13 => {
                description = field_bytes(payload)
                    .and_then(|bytes| String::from_utf8(bytes).ok());
            }
            // h: description hash
            23 if length == 52 => {
                description_hash = field_slice32(payload);
            }
            // x: expiry seconds
            6 => expiry_secs = field_u64(payload),
            // c: min final cltv delta
            24 => min_final_cltv_delta = field_u64(payload) as u32,
            // n: destination node id
            19 if length == 53 => {
                let bytes =
                    field_bytes(payload).ok_or(Error::WrongNodeId)?;
                node_id = Some(
                    PublicKey::from_slice(&bytes)
                        .map_err(|_| Error::WrongNodeId)?,
                );
            }
            // r: route hint list, 51 bytes per hop
            3 => {
                if let Some(bytes) = field_bytes(payload) {
                    let mut hops = vec![];
                    for chunk in bytes.chunks_exact(ROUTE_HINT_HOP_LEN) {
                        let hop_node =
                            match PublicKey::from_slice(&chunk[..33]) {
                                Ok(key) => key,
                                Err(_) => continue,
                            };
                        let mut scid = [0u8; 8];
                        scid.copy_from_slice(&chunk[33..41]);
                        let mut base = [0u8; 4];
                        base.copy_from_slice(&chunk[41..45]);
                        let mut rate = [0u8; 4];
                        rate.copy_from_slice(&chunk[45..49]);
                        let mut delta = [0u8; 2];
                        delta.copy_from_slice(&chunk[49..51]);
                        hops.push(RouteHintHop {
                            node_id: hop_node,
                            short_channel_id: u64::from_be_bytes(scid),
                            fee_base_msat: u32::from_be_bytes(base),
                            fee_proportional_millionths: u32::from_be_bytes(
                                rate,
                            ),
                            cltv_expiry_delta: u16::from_be_bytes(delta),
                        });
                    }
                    if !hops.is_empty() {
                        route_hints.push(hops);
                    }
                }
            }
            // 9: feature bits
            5 => {
                if let Some(bytes) = field_bytes(payload) {
                    features = bytes;
                }
            }
            // f (fallback address, tag 9) and anything unknown: skipped
            _ => {}
        }
    }

    Ok(Invoice {
        network,
        amount_msat,
        timestamp,
        payment_hash: payment_hash.ok_or(Error::NoPaymentHash)?,
        payment_secret,
        description,
        description_hash,
        expiry_secs,
        min_final_cltv_delta,
        node_id,
        route_hints,
        features,
        signature,
    })
}

fn tag_char(tag: u8) -> char {
    const CHARSET: &[u8] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
    CHARSET.get(tag as usize).map(|b| *b as char).unwrap_or('?')
}

#[cfg(test)]
mod test {
    use amplify::Wrapper;

    use super::*;

    // Test vector from BOLT-11: donation invoice without an amount
    const DONATION: &str =
        "lnbc1pvjluezpp5qqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqypqdpl\
         2pkx2ctnv5sxxmmwwd5kgetjypeh2ursdae8g6twvus8g6rfwvs8qun0dfjkxaq8rkx3yf\
         5tcsyz3d73gafnh3cax9rn449d9p5uxz9ezhhypd0elx87sjle52x86fux2ypatgddc6k6\
         3n7erqz25le42c4u4ecky03ylcqca784w";

    #[test]
    fn donation_invoice() {
        let invoice = decode(DONATION).unwrap();
        assert_eq!(invoice.network, "bc");
        assert_eq!(invoice.amount_msat, None);
        assert_eq!(invoice.timestamp, 1496314658);
        assert_eq!(
            invoice.payment_hash.as_inner().to_inner(),
            [
                0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09,
                0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09,
                0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09,
                0x01, 0x02
            ]
        );
        assert_eq!(
            invoice.description.as_deref(),
            Some("Please consider supporting this project")
        );
        // No explicit expiry or cltv fields in this vector
        assert_eq!(invoice.expiry_secs, DEFAULT_EXPIRY_SECS);
        assert_eq!(invoice.min_final_cltv_delta, DEFAULT_MIN_FINAL_CLTV);
        assert_eq!(invoice.signature.len(), 65);
    }

    #[test]
    fn hrp_amounts() {
        assert_eq!(parse_hrp("lnbc").unwrap(), ("bc".to_owned(), None));
        assert_eq!(
            parse_hrp("lnbc20m").unwrap(),
            ("bc".to_owned(), Some(2_000_000_000))
        );
        assert_eq!(
            parse_hrp("lnbc2500u").unwrap(),
            ("bc".to_owned(), Some(250_000_000))
        );
        assert_eq!(
            parse_hrp("lntb1n").unwrap(),
            ("tb".to_owned(), Some(100))
        );
        assert_eq!(
            parse_hrp("lnbcrt10p").unwrap(),
            ("bcrt".to_owned(), Some(1))
        );
        // Sub-millisatoshi pico amounts are invalid
        assert!(parse_hrp("lnbc1p").is_err());
        assert!(parse_hrp("bc1").is_err());
    }

    #[test]
    fn expiry_check() {
        let invoice = decode(DONATION).unwrap();
        assert!(!invoice.is_expired(invoice.timestamp + 60));
        assert!(invoice.is_expired(invoice.timestamp + DEFAULT_EXPIRY_SECS + 1));
    }

    #[test]
    fn terms_for_switch() {
        let invoice = decode(DONATION).unwrap();
        let terms = invoice.terms();
        assert_eq!(terms.amount_msat, None);
        assert_eq!(terms.min_final_cltv_delta, DEFAULT_MIN_FINAL_CLTV);
    }
}
