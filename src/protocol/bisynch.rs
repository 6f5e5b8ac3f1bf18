//! Checksum-framed (bisynchronous) controller protocol
//!
//! Protocol Overview:
//! - Query:  `EOT GGUU C1 C2 ENQ`
//! - Set:    `EOT GGUU STX C1 C2 <value> ETX BCC`
//! - Reply:  `STX C1 C2 <data> ETX BCC`, or a single `ACK` / `NAK`
//! - BCC:    XOR of every byte after STX up to and including ETX
//! - Address digits are repeated: group 1, unit 2 is sent as `1122`
//!
//! The codec is pure; [`BisynchClient`] composes it with an [`AsyncLinkTransceiver`] configured
//! with [`frame_complete`] as its completion predicate and no command terminator.

use crate::error::{AppResult, ThermoError};
use crate::link::reply_buffer::{string_to_units, ReplyChecker};
use crate::link::{AsyncLinkTransceiver, LinkChannel, TransceiverBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Start of text
pub const STX: u8 = 0x02;
/// End of text
pub const ETX: u8 = 0x03;
/// End of transmission (frame start)
pub const EOT: u8 = 0x04;
/// Enquiry (query terminator)
pub const ENQ: u8 = 0x05;
/// Positive acknowledgement
pub const ACK: u8 = 0x06;
/// Negative acknowledgement
pub const NAK: u8 = 0x15;

/// Longest value text sent in a set frame.
pub const MAX_VALUE_LEN: usize = 7;

/// Group/unit address of a controller on the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BisynchAddress {
    /// Group identifier (0-9)
    pub group_id: u8,
    /// Unit identifier (0-9)
    pub unit_id: u8,
}

impl BisynchAddress {
    /// Create a validated address.
    pub fn new(group_id: u8, unit_id: u8) -> AppResult<Self> {
        if group_id > 9 || unit_id > 9 {
            return Err(ThermoError::Configuration(format!(
                "bisynch address ({group_id}, {unit_id}) must use digits 0-9"
            )));
        }
        Ok(Self { group_id, unit_id })
    }

    /// Wire form: each digit repeated, group first.
    pub fn to_wire(&self) -> String {
        format!(
            "{g}{g}{u}{u}",
            g = self.group_id % 10,
            u = self.unit_id % 10
        )
    }
}

/// Classification of a raw reply by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `ACK`
    Ack,
    /// `NAK`
    Nak,
    /// `STX`-framed data
    Data,
}

/// XOR block check character.
pub fn bcc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Completion predicate for framed replies.
///
/// Complete once the first byte is `ACK` or `NAK`, or the buffer starts with `STX` and its
/// second-to-last byte is `ETX` (the last byte being the BCC).
pub fn frame_complete(buffer: &[u8]) -> bool {
    match buffer.first() {
        Some(&ACK) | Some(&NAK) => true,
        Some(&STX) => buffer.len() >= 2 && buffer[buffer.len() - 2] == ETX,
        _ => false,
    }
}

/// Shareable [`ReplyChecker`] wrapping [`frame_complete`].
pub fn reply_checker() -> Arc<dyn ReplyChecker> {
    Arc::new(frame_complete)
}

/// Device-side reply frame `STX + mnemonic + data + ETX + BCC`.
///
/// Inverse of [`BisynchCodec::decode_reply`] for data made of link units.
pub fn encode_reply(mnemonic: &str, data: &str) -> AppResult<String> {
    let mut body = string_to_units(mnemonic)?;
    body.extend(string_to_units(data)?);
    body.push(ETX);
    let check = bcc(&body);

    let mut frame = String::with_capacity(body.len() + 2);
    frame.push(char::from(STX));
    frame.extend(body.iter().copied().map(char::from));
    frame.push(char::from(check));
    Ok(frame)
}

fn validate_mnemonic(mnemonic: &str) -> AppResult<()> {
    if mnemonic.len() == 2 && mnemonic.bytes().all(|b| b.is_ascii_graphic()) {
        Ok(())
    } else {
        Err(ThermoError::Configuration(format!(
            "mnemonic {mnemonic:?} must be two printable ASCII characters"
        )))
    }
}

fn format_value(value: f64) -> AppResult<String> {
    if !value.is_finite() {
        return Err(ThermoError::Hardware(format!(
            "cannot encode non-finite value {value}"
        )));
    }
    let mut text = value.to_string();
    if !text.contains('.') {
        text.push_str(".0");
    }
    text.truncate(MAX_VALUE_LEN);
    Ok(text)
}

/// Encoder/decoder for one addressed controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct BisynchCodec {
    address: BisynchAddress,
}

impl BisynchCodec {
    /// Codec for the given address.
    pub fn new(address: BisynchAddress) -> Self {
        Self { address }
    }

    /// Address this codec frames for.
    pub fn address(&self) -> BisynchAddress {
        self.address
    }

    /// `EOT + GGUU + mnemonic + ENQ`
    pub fn encode_query(&self, mnemonic: &str) -> AppResult<String> {
        validate_mnemonic(mnemonic)?;
        let mut frame = String::with_capacity(8);
        frame.push(char::from(EOT));
        frame.push_str(&self.address.to_wire());
        frame.push_str(mnemonic);
        frame.push(char::from(ENQ));
        Ok(frame)
    }

    /// `EOT + GGUU + STX + mnemonic + value + ETX + BCC`
    ///
    /// The value text is truncated to [`MAX_VALUE_LEN`] characters.
    pub fn encode_set(&self, mnemonic: &str, value: f64) -> AppResult<String> {
        validate_mnemonic(mnemonic)?;
        let value = format_value(value)?;

        let mut body = Vec::with_capacity(mnemonic.len() + value.len() + 1);
        body.extend_from_slice(mnemonic.as_bytes());
        body.extend_from_slice(value.as_bytes());
        body.push(ETX);
        let check = bcc(&body);

        let mut frame = String::with_capacity(body.len() + 7);
        frame.push(char::from(EOT));
        frame.push_str(&self.address.to_wire());
        frame.push(char::from(STX));
        frame.extend(body.iter().copied().map(char::from));
        frame.push(char::from(check));
        Ok(frame)
    }

    /// Verify the BCC of a data reply and return the data after the mnemonic.
    ///
    /// # Errors
    /// - [`ThermoError::Checksum`] if the byte after `ETX` is not the XOR of bytes 1..=ETX
    /// - [`ThermoError::MalformedReply`] if there is no `ETX`, no BCC, or no room for a mnemonic
    pub fn decode_reply(&self, raw: &str) -> AppResult<String> {
        let bytes = string_to_units(raw)
            .map_err(|_| ThermoError::MalformedReply(format!("{raw:?}")))?;

        let mut acc = 0u8;
        let mut etx_index = None;
        for (index, byte) in bytes.iter().enumerate().skip(1) {
            acc ^= byte;
            if *byte == ETX {
                etx_index = Some(index);
                break;
            }
        }

        let etx_index = etx_index
            .ok_or_else(|| ThermoError::MalformedReply(format!("no ETX in {raw:?}")))?;
        let received = *bytes
            .get(etx_index + 1)
            .ok_or_else(|| ThermoError::MalformedReply(format!("no BCC in {raw:?}")))?;
        if received != acc {
            return Err(ThermoError::Checksum {
                computed: acc,
                received,
            });
        }
        if etx_index < 3 {
            return Err(ThermoError::MalformedReply(format!(
                "reply too short for a mnemonic: {raw:?}"
            )));
        }

        Ok(bytes[3..etx_index].iter().copied().map(char::from).collect())
    }

    /// Classify a raw reply by its first byte.
    ///
    /// # Errors
    /// [`ThermoError::SpuriousReply`] for any leading byte other than `ACK`, `NAK` or `STX`.
    pub fn classify(&self, raw: &str) -> AppResult<ReplyKind> {
        match raw.chars().next().map(u32::from) {
            Some(c) if c == u32::from(ACK) => Ok(ReplyKind::Ack),
            Some(c) if c == u32::from(NAK) => Ok(ReplyKind::Nak),
            Some(c) if c == u32::from(STX) => Ok(ReplyKind::Data),
            Some(c) => Err(ThermoError::SpuriousReply(u8::try_from(c).unwrap_or(u8::MAX))),
            None => Err(ThermoError::MalformedReply("empty reply".to_string())),
        }
    }

    /// True if the first byte is `ACK`.
    pub fn is_acknowledgement(&self, raw: &str) -> bool {
        raw.starts_with(char::from(ACK))
    }

    /// True if the first byte is `NAK`.
    pub fn is_negative_acknowledgement(&self, raw: &str) -> bool {
        raw.starts_with(char::from(NAK))
    }

    /// `Ok` for `ACK`, [`ThermoError::NegativeAcknowledgement`] for `NAK`,
    /// [`ThermoError::SpuriousReply`] otherwise.
    pub fn check_acknowledgement(&self, raw: &str) -> AppResult<()> {
        match self.classify(raw)? {
            ReplyKind::Ack => Ok(()),
            ReplyKind::Nak => Err(ThermoError::NegativeAcknowledgement),
            ReplyKind::Data => Err(ThermoError::SpuriousReply(STX)),
        }
    }
}

/// Framed protocol client over one transceiver.
pub struct BisynchClient {
    codec: BisynchCodec,
    link: AsyncLinkTransceiver,
}

impl BisynchClient {
    /// Build a transceiver for the framed protocol on `link`.
    pub fn connect<L: LinkChannel>(
        link: L,
        address: BisynchAddress,
        timeout: Duration,
    ) -> AppResult<Self> {
        let transceiver = TransceiverBuilder::new()
            .with_name(format!("bisynch-{}", address.to_wire()))
            .with_timeout(timeout)
            .with_command_terminator("")
            .with_capacity(64)
            .with_reply_checker(reply_checker())
            .build(link)?;
        Ok(Self::new(BisynchCodec::new(address), transceiver))
    }

    /// Wrap an already configured transceiver.
    pub fn new(codec: BisynchCodec, link: AsyncLinkTransceiver) -> Self {
        Self { codec, link }
    }

    /// Read a parameter as text.
    pub async fn query(&self, mnemonic: &str) -> AppResult<String> {
        let frame = self.codec.encode_query(mnemonic)?;
        let raw = self.link.send_and_receive(&frame).await?;
        match self.codec.classify(&raw)? {
            ReplyKind::Data => {}
            ReplyKind::Nak => return Err(ThermoError::NegativeAcknowledgement),
            ReplyKind::Ack => return Err(ThermoError::SpuriousReply(ACK)),
        }

        let data = self.codec.decode_reply(&raw)?;
        if raw.get(1..3) != Some(mnemonic) {
            return Err(ThermoError::MalformedReply(format!(
                "reply {raw:?} does not answer {mnemonic}"
            )));
        }
        debug!(mnemonic, data = %data, "bisynch query");
        Ok(data)
    }

    /// Read a numeric parameter.
    pub async fn query_f64(&self, mnemonic: &str) -> AppResult<f64> {
        let data = self.query(mnemonic).await?;
        data.trim()
            .parse()
            .map_err(|_| ThermoError::MalformedReply(format!("{mnemonic} value {data:?}")))
    }

    /// Write a numeric parameter and require an acknowledgement.
    pub async fn set(&self, mnemonic: &str, value: f64) -> AppResult<()> {
        let frame = self.codec.encode_set(mnemonic, value)?;
        let raw = self.link.send_and_receive(&frame).await?;
        self.codec.check_acknowledgement(&raw)?;
        debug!(mnemonic, value, "bisynch set acknowledged");
        Ok(())
    }

    /// Codec in use.
    pub fn codec(&self) -> &BisynchCodec {
        &self.codec
    }

    /// Underlying transceiver.
    pub fn transceiver(&self) -> &AsyncLinkTransceiver {
        &self.link
    }
}
