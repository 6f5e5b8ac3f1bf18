//! Wire-level simulator of a bisynch furnace controller.
//!
//! Serves the device side of the framed protocol on any byte stream, answering queries and set
//! frames from a shared [`FurnaceModel`]. Used by integration tests and the `simulate --wire`
//! command to exercise the full transceiver/codec/controller stack without hardware.

use crate::error::AppResult;
use crate::hardware::bisynch_furnace::{STATUS_HOLD, STATUS_RUN};
use crate::hardware::mock::FurnaceModel;
use crate::link::reply_buffer::string_to_units;
use crate::protocol::bisynch::{bcc, encode_reply, BisynchAddress, ACK, ENQ, EOT, ETX, NAK, STX};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Frames longer than this are treated as line noise and discarded.
const MAX_FRAME_LEN: usize = 32;

enum FrameOutcome {
    Incomplete,
    Discard,
    Reply(Vec<u8>),
}

/// Simulated controller at one bus address.
#[derive(Clone)]
pub struct BisynchDeviceSim {
    address: BisynchAddress,
    model: Arc<RwLock<FurnaceModel>>,
}

impl BisynchDeviceSim {
    /// Simulator answering at `address` from the shared model.
    pub fn new(address: BisynchAddress, model: Arc<RwLock<FurnaceModel>>) -> Self {
        Self { address, model }
    }

    /// Shared handle to the simulated furnace state.
    pub fn model(&self) -> Arc<RwLock<FurnaceModel>> {
        Arc::clone(&self.model)
    }

    /// Serve on a background task until the stream closes.
    pub fn spawn<S>(self, stream: S) -> JoinHandle<AppResult<()>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tokio::spawn(async move { self.serve(stream).await })
    }

    /// Serve frames until end of stream.
    pub async fn serve<S>(&self, stream: S) -> AppResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut frame = Vec::with_capacity(MAX_FRAME_LEN);
        loop {
            let byte = match reader.read_u8().await {
                Ok(byte) => byte,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("bisynch simulator: link closed");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            frame.push(byte);

            // A BCC may itself be EOT, so completion is checked before EOT restarts a frame.
            match self.handle_frame(&frame).await {
                FrameOutcome::Incomplete | FrameOutcome::Discard if byte == EOT => {
                    frame.clear();
                    frame.push(EOT);
                }
                FrameOutcome::Incomplete => {}
                FrameOutcome::Discard => frame.clear(),
                FrameOutcome::Reply(reply) => {
                    frame.clear();
                    writer.write_all(&reply).await?;
                    writer.flush().await?;
                }
            }
        }
    }

    async fn handle_frame(&self, frame: &[u8]) -> FrameOutcome {
        if frame.first() != Some(&EOT) || frame.len() > MAX_FRAME_LEN {
            return FrameOutcome::Discard;
        }
        if frame.len() < 8 {
            return FrameOutcome::Incomplete;
        }

        let is_query = frame.len() == 8 && frame[7] == ENQ;
        let is_set = frame[5] == STX && frame[frame.len() - 2] == ETX;
        if !is_query && !is_set {
            return FrameOutcome::Incomplete;
        }
        if frame[1..5] != *self.address.to_wire().as_bytes() {
            trace!("bisynch simulator: frame for another address");
            return FrameOutcome::Discard;
        }

        if is_query {
            let mnemonic: String = frame[5..7].iter().copied().map(char::from).collect();
            return FrameOutcome::Reply(self.answer_query(&mnemonic).await);
        }

        let body = &frame[6..frame.len() - 1];
        if bcc(body) != frame[frame.len() - 1] || body.len() < 3 {
            debug!("bisynch simulator: bad checksum");
            return FrameOutcome::Reply(vec![NAK]);
        }
        let mnemonic: String = body[..2].iter().copied().map(char::from).collect();
        let value: String = body[2..body.len() - 1]
            .iter()
            .copied()
            .map(char::from)
            .collect();
        match value.parse::<f64>() {
            Ok(value) if self.apply_set(&mnemonic, value).await => FrameOutcome::Reply(vec![ACK]),
            _ => FrameOutcome::Reply(vec![NAK]),
        }
    }

    async fn answer_query(&self, mnemonic: &str) -> Vec<u8> {
        let value = {
            let mut model = self.model.write().await;
            match mnemonic {
                "PV" => Some(model.advance()),
                "SL" => Some(model.set_point),
                "RR" => Some(model.rate),
                "PS" => Some(if model.running { STATUS_RUN } else { STATUS_HOLD }),
                _ => None,
            }
        };
        let reply = value.and_then(|v| encode_reply(mnemonic, &format!("{v:.2}")).ok());
        match reply.and_then(|frame| string_to_units(&frame).ok()) {
            Some(bytes) => bytes,
            None => vec![NAK],
        }
    }

    async fn apply_set(&self, mnemonic: &str, value: f64) -> bool {
        let mut model = self.model.write().await;
        match mnemonic {
            "SL" => model.set_point = value,
            "RR" => model.rate = value,
            "PS" => model.running = value == STATUS_RUN,
            _ => return false,
        }
        debug!(mnemonic, value, "bisynch simulator: parameter set");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::bisynch::BisynchCodec;

    async fn exchange(sim: &BisynchDeviceSim, frame: &str) -> Vec<u8> {
        let bytes = string_to_units(frame).unwrap();
        let mut last = Vec::new();
        for end in 1..=bytes.len() {
            if let FrameOutcome::Reply(reply) = sim.handle_frame(&bytes[..end]).await {
                last = reply;
            }
        }
        last
    }

    fn sim() -> BisynchDeviceSim {
        BisynchDeviceSim::new(
            BisynchAddress::default(),
            Arc::new(RwLock::new(FurnaceModel::new(21.0))),
        )
    }

    #[tokio::test]
    async fn test_query_and_set() {
        let sim = sim();
        let codec = BisynchCodec::default();

        let reply = exchange(&sim, &codec.encode_query("PV").unwrap()).await;
        let reply: String = reply.into_iter().map(char::from).collect();
        assert_eq!(codec.decode_reply(&reply).unwrap(), "21.00");

        let ack = exchange(&sim, &codec.encode_set("SL", 60.0).unwrap()).await;
        assert_eq!(ack, vec![ACK]);
        assert_eq!(sim.model().read().await.set_point, 60.0);
    }

    #[tokio::test]
    async fn test_rejects_bad_checksum_and_unknown_mnemonic() {
        let sim = sim();
        let codec = BisynchCodec::default();

        let mut frame = string_to_units(&codec.encode_set("SL", 60.0).unwrap()).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let frame: String = frame.into_iter().map(char::from).collect();
        assert_eq!(exchange(&sim, &frame).await, vec![NAK]);

        assert_eq!(
            exchange(&sim, &codec.encode_query("XX").unwrap()).await,
            vec![NAK]
        );
        assert_eq!(
            exchange(&sim, &codec.encode_set("PV", 1.0).unwrap()).await,
            vec![NAK]
        );
    }

    #[tokio::test]
    async fn test_ignores_other_addresses() {
        let sim = sim();
        let other = BisynchCodec::new(BisynchAddress::new(1, 2).unwrap());
        assert!(exchange(&sim, &other.encode_query("PV").unwrap())
            .await
            .is_empty());
    }
}
