//! Wire encoding for a single Hue Entertainment streaming update.

const MAGIC: &[u8; 9] = b"HueStream";
const MAJOR_VERSION: u8 = 0x02;
const MINOR_VERSION: u8 = 0x00;
const COLOR_SPACE_RGB: u8 = 0x00;
const UUID_LEN: usize = 36;
const HEADER_LEN: usize = 16 + UUID_LEN;
const RECORD_LEN: usize = 7;

/// One channel's worth of color, ready to go on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorUpdate {
    pub channel_id: u8,
    pub rgb16: [u16; 3],
}

/// Encodes one streaming packet for `entertainment_configuration_id`
/// carrying `updates` in the order given (duplicate channel ids are not
/// rejected here; producers are responsible for not emitting them).
///
/// Panics if `entertainment_configuration_id` is not exactly 36 ASCII
/// bytes — callers must validate the UUID shape before constructing a
/// controller — the UUID shape is enforced on accept, before a
/// controller is ever constructed.
pub fn encode_update_packet(entertainment_configuration_id: &str, updates: &[ColorUpdate]) -> Vec<u8> {
    assert_eq!(
        entertainment_configuration_id.len(),
        UUID_LEN,
        "entertainment configuration id must be 36 ASCII characters"
    );

    let mut buf = Vec::with_capacity(HEADER_LEN + RECORD_LEN * updates.len());
    buf.extend_from_slice(MAGIC);
    buf.push(MAJOR_VERSION);
    buf.push(MINOR_VERSION);
    buf.push(0x00); // sequence, unused
    buf.extend_from_slice(&[0x00, 0x00]); // reserved
    buf.push(COLOR_SPACE_RGB);
    buf.push(0x00); // reserved
    buf.extend_from_slice(entertainment_configuration_id.as_bytes());

    for update in updates {
        buf.push(update.channel_id);
        for component in update.rgb16 {
            buf.extend_from_slice(&component.to_be_bytes());
        }
    }

    buf
}

/// Inverse of [`encode_update_packet`], used for round-trip testing.
pub fn decode_update_packet(data: &[u8]) -> Option<(String, Vec<ColorUpdate>)> {
    if data.len() < HEADER_LEN || &data[0..9] != MAGIC {
        return None;
    }
    let id = String::from_utf8(data[16..16 + UUID_LEN].to_vec()).ok()?;
    let body = &data[HEADER_LEN..];
    if body.len() % RECORD_LEN != 0 {
        return None;
    }
    let updates = body
        .chunks_exact(RECORD_LEN)
        .map(|rec| ColorUpdate {
            channel_id: rec[0],
            rgb16: [
                u16::from_be_bytes([rec[1], rec[2]]),
                u16::from_be_bytes([rec[3], rec[4]]),
                u16::from_be_bytes([rec[5], rec[6]]),
            ],
        })
        .collect();
    Some((id, updates))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "01234567-89ab-cdef-0123-456789abcdef";

    #[test]
    fn length_and_magic() {
        let updates = vec![
            ColorUpdate {
                channel_id: 0,
                rgb16: [1, 2, 3],
            },
            ColorUpdate {
                channel_id: 1,
                rgb16: [4, 5, 6],
            },
        ];
        let bytes = encode_update_packet(UUID, &updates);
        assert_eq!(bytes.len(), 52 + 7 * updates.len());
        assert_eq!(&bytes[0..9], b"HueStream");
    }

    #[test]
    fn solid_red_bytes_match_scenario_1() {
        let updates = vec![ColorUpdate {
            channel_id: 0,
            rgb16: [0xFFFF, 0x0000, 0x0000],
        }];
        let bytes = encode_update_packet(UUID, &updates);
        assert_eq!(
            &bytes[0..16],
            &[
                0x48, 0x75, 0x65, 0x53, 0x74, 0x72, 0x65, 0x61, 0x6d, 0x02, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x00
            ]
        );
        assert_eq!(&bytes[16..52], UUID.as_bytes());
        assert_eq!(&bytes[52..], &[0x00, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn round_trip() {
        let updates = vec![
            ColorUpdate {
                channel_id: 9,
                rgb16: [0x1234, 0xABCD, 0xFFFF],
            },
            ColorUpdate {
                channel_id: 200,
                rgb16: [0, 0, 0],
            },
        ];
        let bytes = encode_update_packet(UUID, &updates);
        let (id, decoded) = decode_update_packet(&bytes).unwrap();
        assert_eq!(id, UUID);
        assert_eq!(decoded, updates);
    }

    #[test]
    #[should_panic]
    fn rejects_malformed_uuid_length() {
        encode_update_packet("too-short", &[]);
    }
}
