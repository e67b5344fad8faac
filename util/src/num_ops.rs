//! Small bit-twiddling helpers shared by the transport and virtqueue code.

/// Fold a 32-bit register value into the given half (`page`) of a 64-bit
/// feature word. `page` is either 0 (low half) or 1 (high half), matching
/// virtio's `*_FEATURES_SEL` convention.
pub fn write_u32(value: u32, page: u32) -> u64 {
    if page == 0 {
        value as u64
    } else {
        (value as u64) << 32
    }
}

/// Inverse of [`write_u32`]: read the half of a 64-bit feature word selected
/// by `page`.
pub fn read_u32(value: u64, page: u32) -> u32 {
    if page == 0 {
        value as u32
    } else {
        (value >> 32) as u32
    }
}

/// The standard `vring_need_event` predicate (virtio 1.x, event-idx
/// optimisation): whether the consumer side should be notified given the
/// index it last promised to wake at (`event_idx`), the new published index
/// and the previously observed index. All arithmetic wraps at 16 bits, which
/// is why this cannot be expressed as a plain signed comparison.
pub fn vring_need_event(event_idx: u16, new_idx: u16, old_idx: u16) -> bool {
    new_idx
        .wrapping_sub(event_idx)
        .wrapping_sub(1)
        < new_idx.wrapping_sub(old_idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_word_halves_round_trip() {
        let word = write_u32(0xdead_beef, 0) | write_u32(0x1234_5678, 1);
        assert_eq!(read_u32(word, 0), 0xdead_beef);
        assert_eq!(read_u32(word, 1), 0x1234_5678);
    }

    #[test]
    fn need_event_fires_when_crossing_the_watermark() {
        // Driver asked to be told at idx 5; device has gone from 4 to 6.
        assert!(vring_need_event(5, 6, 4));
        // Device only advanced to 5, hasn't crossed the watermark yet.
        assert!(!vring_need_event(5, 5, 4));
    }

    #[test]
    fn need_event_handles_16_bit_wraparound() {
        let old_idx: u16 = 0xfffe;
        let new_idx: u16 = 0x0002;
        let event_idx: u16 = 0xffff;
        assert!(vring_need_event(event_idx, new_idx, old_idx));
    }
}
