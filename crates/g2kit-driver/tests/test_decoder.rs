use g2kit_driver::{DecodedUnit, FrameDecoder};
use proptest::prelude::*;

fn decode_all(input: &str, splits: &[usize]) -> Vec<DecodedUnit> {
    let mut decoder = FrameDecoder::new();
    let mut units = Vec::new();
    let bytes = input.as_bytes();
    let mut at = 0;
    for &cut in splits {
        let cut = cut.min(bytes.len());
        if cut > at {
            // Keep splits on char boundaries; the corpus below is ASCII.
            units.extend(decoder.feed(&bytes[at..cut]));
            at = cut;
        }
    }
    units.extend(decoder.feed(&bytes[at..]));
    units
}

proptest! {
    // Chunk boundaries must never change what comes out.
    #[test]
    fn decoding_is_chunk_boundary_insensitive(
        lines in proptest::collection::vec("[ -~]{0,30}", 0..12),
        splits in proptest::collection::vec(0usize..400, 0..8),
    ) {
        let input: String = lines.iter().map(|l| format!("{l}\n")).collect();
        let mut splits = splits;
        splits.sort_unstable();

        let whole = decode_all(&input, &[]);
        let chunked = decode_all(&input, &splits);
        prop_assert_eq!(whole, chunked);
    }

    #[test]
    fn json_frames_survive_arbitrary_splits(
        n in 0u64..100_000,
        split in 0usize..40,
    ) {
        let frame = format!("{{\"r\":{{\"n\":{n}}},\"f\":[1,0,9]}}\n");
        let units = decode_all(&frame, &[split]);
        prop_assert_eq!(units.len(), 1);
        match &units[0] {
            DecodedUnit::Json(v) => prop_assert_eq!(v["r"]["n"].as_u64(), Some(n)),
            other => prop_assert!(false, "expected json, got {:?}", other),
        }
    }
}

#[test]
fn mixed_traffic_keeps_order() {
    let mut decoder = FrameDecoder::new();
    let mut units = decoder.feed(b"SYSTEM READY\r\n{\"sr\":{\"stat\":3}}\n");
    units.extend(decoder.feed(b"{\"r\":{},\"f\":[1,0,2]}\n"));
    assert_eq!(units.len(), 3);
    assert!(matches!(units[0], DecodedUnit::Text(_)));
    assert!(matches!(units[1], DecodedUnit::Json(_)));
    assert!(matches!(units[2], DecodedUnit::Json(_)));
}
