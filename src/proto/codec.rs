//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use anyhow::Error;
use anyhow::anyhow;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

/// Codec for multipart messages: a u32-BE frame count followed by, per
/// frame, a u32-BE length and the frame bytes.
///
/// One multipart message maps to one socket exchange, mirroring the frame
/// lists the rest of the code passes around (`[tag, body]`,
/// `[command, arg]`, ...).
#[derive(Debug, Clone, Default)]
pub struct MultipartCodec;

/// Chunk payloads are 32 KiB; everything else is far smaller. A frame
/// larger than this indicates a broken or hostile peer.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const MAX_FRAMES: usize = 16;

impl Decoder for MultipartCodec {
    type Item = Vec<Bytes>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let count = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if count > MAX_FRAMES {
            return Err(anyhow!("Multipart message with {} frames refused", count));
        }

        let mut offset = 4;
        let mut spans = Vec::with_capacity(count);
        for _ in 0..count {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([
                src[offset],
                src[offset + 1],
                src[offset + 2],
                src[offset + 3],
            ]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(anyhow!("Frame of {} bytes refused", len));
            }
            offset += 4;
            if src.len() < offset + len {
                src.reserve(offset + len - src.len());
                return Ok(None);
            }
            spans.push((offset, len));
            offset += len;
        }

        let message = src.split_to(offset).freeze();
        Ok(Some(
            spans
                .into_iter()
                .map(|(start, len)| message.slice(start..start + len))
                .collect(),
        ))
    }
}

impl Encoder<Vec<Bytes>> for MultipartCodec {
    type Error = Error;

    fn encode(&mut self, frames: Vec<Bytes>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frames.len() > MAX_FRAMES {
            return Err(anyhow!("Refusing to encode {} frames", frames.len()));
        }
        let total: usize = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
        dst.reserve(total);
        dst.put_u32(frames.len() as u32);
        for frame in frames {
            if frame.len() > MAX_FRAME_LEN {
                return Err(anyhow!("Refusing to encode frame of {} bytes", frame.len()));
            }
            dst.put_u32(frame.len() as u32);
            dst.put_slice(&frame);
        }
        Ok(())
    }
}

/// A reply whose single frame is empty; used as the dispatch heartbeat.
pub fn is_heartbeat(frames: &[Bytes]) -> bool {
    frames.iter().all(|f| f.is_empty())
}

pub fn heartbeat() -> Vec<Bytes> {
    vec![Bytes::new()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frames: Vec<Bytes>) -> Vec<Bytes> {
        let mut codec = MultipartCodec;
        let mut buf = BytesMut::new();
        codec.encode(frames, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_roundtrip_two_frames() {
        let frames = vec![Bytes::from_static(b"chunk"), Bytes::from_static(b"payload")];
        assert_eq!(roundtrip(frames.clone()), frames);
    }

    #[test]
    fn test_roundtrip_empty_frame() {
        let frames = heartbeat();
        let decoded = roundtrip(frames);
        assert!(is_heartbeat(&decoded));
    }

    #[test]
    fn test_partial_input_yields_none() {
        let mut codec = MultipartCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(vec![Bytes::from_static(b"0123456789")], &mut buf)
            .unwrap();
        let full = buf.clone();

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(codec.decode(&mut partial).unwrap().is_none(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_two_messages_in_one_buffer() {
        let mut codec = MultipartCodec;
        let mut buf = BytesMut::new();
        codec.encode(vec![Bytes::from_static(b"one")], &mut buf).unwrap();
        codec.encode(vec![Bytes::from_static(b"two")], &mut buf).unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            vec![Bytes::from_static(b"one")]
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            vec![Bytes::from_static(b"two")]
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
