//! Length-prefixed framing over a byte buffer.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{WireError, WireResult};
use crate::message::Message;

/// Size of the frame header: a big-endian u32 payload length.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest payload either side will accept.
///
/// A replicated entry is bounded by the storage engine's record size limit,
/// which is far below this; anything bigger indicates a corrupt or hostile
/// peer.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Encodes a message as one frame appended to `buf`.
pub fn encode_message(message: &Message, buf: &mut BytesMut) -> WireResult<()> {
    let payload = postcard::to_allocvec(message).map_err(WireError::Encode)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            got: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    buf.reserve(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(())
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a full frame; the
/// caller should read more bytes and try again. On success the frame's
/// bytes are consumed from `buf`.
pub fn decode_message(buf: &mut BytesMut) -> WireResult<Option<Message>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            got: len,
            max: MAX_FRAME_SIZE,
        });
    }
    if buf.len() < FRAME_HEADER_SIZE + len {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_SIZE);
    let payload = buf.split_to(len);
    let message = postcard::from_bytes(&payload).map_err(WireError::Decode)?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rhyolite_types::{EntryKind, MasterTerm, NodeId, TxnId, Vlsn};

    use super::*;
    use crate::message::{Entry, HandshakeOutcome, HandshakeRejection, Heartbeat};

    fn sample_entry() -> Entry {
        Entry {
            vlsn: Vlsn::new(11),
            txn_id: TxnId::new(7),
            db_id: 1,
            kind: EntryKind::Put,
            dtvlsn: Vlsn::new(9),
            master_term: MasterTerm::new(3),
            timestamp_ms: 1_000,
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"A"),
            needs_group_ack: false,
        }
    }

    #[test]
    fn roundtrip_single_frame() {
        let mut buf = BytesMut::new();
        let msg = Message::Entry(sample_entry());
        encode_message(&msg, &mut buf).unwrap();

        let decoded = decode_message(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_returns_none() {
        let mut buf = BytesMut::new();
        encode_message(&Message::SyncupDone, &mut buf).unwrap();

        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(decode_message(&mut partial).unwrap().is_none());
        // Nothing consumed while incomplete.
        assert_eq!(partial.len(), buf.len() - 1);
    }

    #[test]
    fn multiple_frames_decode_in_order() {
        let mut buf = BytesMut::new();
        let first = Message::Heartbeat(Heartbeat {
            master_now_ms: 1_000,
            master_txn_end_vlsn: Vlsn::new(10),
            heartbeat_id: 1,
        });
        let second = Message::Entry(sample_entry());
        encode_message(&first, &mut buf).unwrap();
        encode_message(&second, &mut buf).unwrap();

        assert_eq!(decode_message(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decode_message(&mut buf).unwrap().unwrap(), second);
        assert!(decode_message(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(&[0u8; 8]);
        assert!(matches!(
            decode_message(&mut buf),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn handshake_rejection_roundtrip() {
        let mut buf = BytesMut::new();
        let msg = Message::HandshakeResult(HandshakeOutcome::Rejected(
            HandshakeRejection::DuplicateNode,
        ));
        encode_message(&msg, &mut buf).unwrap();
        assert_eq!(decode_message(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn handshake_frame_roundtrip() {
        let mut buf = BytesMut::new();
        let msg = Message::Handshake {
            node_name: "replica-2".into(),
            node_id: NodeId::new(2),
            group_name: "orders".into(),
        };
        encode_message(&msg, &mut buf).unwrap();
        assert_eq!(decode_message(&mut buf).unwrap().unwrap(), msg);
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn arb_message() -> impl Strategy<Value = Message> {
            prop_oneof![
                (any::<u64>(), 1u64..u64::MAX - 2, any::<u64>()).prop_map(|(now, vlsn, id)| {
                    Message::Heartbeat(Heartbeat {
                        master_now_ms: now,
                        master_txn_end_vlsn: Vlsn::new(vlsn),
                        heartbeat_id: id,
                    })
                }),
                (1u64..u64::MAX - 2, any::<u64>(), any::<Vec<u8>>(), any::<Vec<u8>>()).prop_map(
                    |(vlsn, txn, key, value)| {
                        Message::Entry(Entry {
                            vlsn: Vlsn::new(vlsn),
                            txn_id: TxnId::new(txn),
                            db_id: 0,
                            kind: EntryKind::Put,
                            dtvlsn: Vlsn::NULL,
                            master_term: MasterTerm::new(1),
                            timestamp_ms: 0,
                            key: Bytes::from(key),
                            value: Bytes::from(value),
                            needs_group_ack: false,
                        })
                    }
                ),
                any::<u64>().prop_map(|t| Message::ShutdownRequest { shutdown_time_ms: t }),
                ".*".prop_map(|text| Message::ProtocolError { text }),
            ]
        }

        proptest! {
            #[test]
            fn any_message_roundtrips(msg in arb_message()) {
                let mut buf = BytesMut::new();
                encode_message(&msg, &mut buf).unwrap();
                let decoded = decode_message(&mut buf).unwrap().unwrap();
                prop_assert_eq!(decoded, msg);
                prop_assert!(buf.is_empty());
            }
        }
    }
}
