//! Start/end marker scan over a raw frame.

use super::payload::ExtractedPayload;
use super::ExtractionError;

/// JPEG start-of-image marker followed by the first segment's 0xFF.
pub const START_MARKER: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// JPEG end-of-image marker.
pub const END_MARKER: [u8; 2] = [0xFF, 0xD9];

/// Locates the compressed payload inside a raw frame.
///
/// The first start marker fixes the offset; the first end marker after
/// it closes the payload, end marker included. The start marker's last
/// byte may double as the first byte of the end marker. Later start
/// markers are ignored. Marker windows never extend past the end of
/// `data`, so a marker truncated by the buffer end does not match.
pub fn extract_payload(data: &[u8]) -> Result<ExtractedPayload, ExtractionError> {
    let start = find(data, &START_MARKER, 0).ok_or(ExtractionError::MissingStartMarker)?;
    let end = find(data, &END_MARKER, start + START_MARKER.len() - 1)
        .ok_or(ExtractionError::MissingEndMarker { start })?;

    Ok(ExtractedPayload::new(start, end - start + END_MARKER.len()))
}

fn find(data: &[u8], marker: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame_with(lead: usize, body: &[u8], tail: usize) -> Vec<u8> {
        let mut data = vec![0u8; lead];
        data.extend_from_slice(&START_MARKER);
        data.extend_from_slice(body);
        data.extend_from_slice(&END_MARKER);
        data.extend(std::iter::repeat(0u8).take(tail));
        data
    }

    #[test]
    fn test_reference_frame() {
        let body: Vec<u8> = (1..=10).collect();
        let data = frame_with(1, &body, 20);

        let payload = extract_payload(&data).unwrap();
        assert_eq!(payload.offset(), 1);
        assert_eq!(payload.len(), 15);
        assert_eq!(&data[payload.range()][..3], &START_MARKER);
        assert_eq!(&data[payload.range()][13..], &END_MARKER);
    }

    #[test]
    fn test_no_start_marker() {
        let data = [0x00, 0xFF, 0xD9, 0x12, 0xFF, 0xD8];
        assert!(matches!(
            extract_payload(&data),
            Err(ExtractionError::MissingStartMarker)
        ));
    }

    #[test]
    fn test_start_without_end() {
        let data = [0x00, 0xFF, 0xD8, 0xFF, 0x01, 0x02, 0x03];
        assert!(matches!(
            extract_payload(&data),
            Err(ExtractionError::MissingEndMarker { start: 1 })
        ));
    }

    #[test]
    fn test_end_marker_before_start_is_ignored() {
        let mut data = vec![0xFF, 0xD9, 0x00];
        data.extend(frame_with(2, &[0x42; 4], 0));

        let payload = extract_payload(&data).unwrap();
        assert_eq!(payload.offset(), 5);
        assert_eq!(payload.len(), 3 + 4 + 2);
    }

    #[test]
    fn test_first_start_marker_wins() {
        let mut data = vec![0x00; 3];
        data.extend_from_slice(&START_MARKER);
        data.extend_from_slice(&[0x10, 0x20]);
        data.extend_from_slice(&START_MARKER);
        data.extend_from_slice(&[0x30]);
        data.extend_from_slice(&END_MARKER);

        let payload = extract_payload(&data).unwrap();
        assert_eq!(payload.offset(), 3);
        assert_eq!(payload.len(), data.len() - 3);
    }

    #[test]
    fn test_start_marker_tail_shared_with_end_marker() {
        let data = [0x00, 0xFF, 0xD8, 0xFF, 0xD9, 0x00];
        let payload = extract_payload(&data).unwrap();
        assert_eq!(payload.offset(), 1);
        assert_eq!(payload.len(), 4);
    }

    #[test]
    fn test_truncated_markers_at_buffer_end() {
        // Start marker cut off by the end of the buffer.
        assert!(matches!(
            extract_payload(&[0x00, 0x00, 0xFF, 0xD8]),
            Err(ExtractionError::MissingStartMarker)
        ));
        // End marker cut off by the end of the buffer.
        assert!(matches!(
            extract_payload(&[0xFF, 0xD8, 0xFF, 0x01, 0xFF]),
            Err(ExtractionError::MissingEndMarker { start: 0 })
        ));
        // End marker occupying the last two bytes still counts.
        let payload = extract_payload(&[0xFF, 0xD8, 0xFF, 0x01, 0xFF, 0xD9]).unwrap();
        assert_eq!(payload.len(), 6);
    }

    #[test]
    fn test_tiny_buffers() {
        assert!(extract_payload(&[]).is_err());
        assert!(extract_payload(&[0xFF]).is_err());
        assert!(extract_payload(&[0xFF, 0xD8]).is_err());
    }

    fn body_strategy() -> impl Strategy<Value = Vec<u8>> {
        // Bytes below 0xD9 never form a marker, even right after the start marker's 0xFF.
        proptest::collection::vec(0u8..0xD9, 0..256)
    }

    proptest! {
        #[test]
        fn prop_single_pair_is_found(
            lead in proptest::collection::vec(0u8..0xFF, 0..128),
            body in body_strategy(),
            tail in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut data = lead.clone();
            data.extend_from_slice(&START_MARKER);
            data.extend_from_slice(&body);
            data.extend_from_slice(&END_MARKER);
            data.extend_from_slice(&tail);

            let payload = extract_payload(&data).unwrap();
            prop_assert_eq!(payload.offset(), lead.len());
            prop_assert_eq!(payload.len(), START_MARKER.len() + body.len() + END_MARKER.len());
        }

        #[test]
        fn prop_missing_end_marker_fails(
            lead in proptest::collection::vec(0u8..0xFF, 0..128),
            body in body_strategy(),
        ) {
            let mut data = lead.clone();
            data.extend_from_slice(&START_MARKER);
            data.extend_from_slice(&body);

            prop_assert!(
                matches!(
                    extract_payload(&data),
                    Err(ExtractionError::MissingEndMarker { start }) if start == lead.len()
                ),
                "expected missing end marker"
            );
        }

        #[test]
        fn prop_never_panics(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            if let Ok(payload) = extract_payload(&data) {
                prop_assert!(payload.range().end <= data.len());
                prop_assert!(!payload.is_empty());
            }
        }
    }
}
