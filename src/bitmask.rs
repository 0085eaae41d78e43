//! Token bitmask utilities.
//!
//! A bitmask row is a run of `u32` words where bit `i % 32` of word `i / 32`
//! says whether token `i` is allowed. Bit 1 = allowed, bit 0 = rejected.
//! Batched buffers hold rows back to back; row `b` starts at word
//! `b * get_bitmask_size(vocab_size)`.

/// Number of `u32` words needed for a bitmask of `vocab_size` tokens.
pub fn get_bitmask_size(vocab_size: usize) -> usize {
    vocab_size.div_ceil(32)
}

/// The words of row `batch_index`, or `None` when the buffer is too short.
pub fn bitmask_row(buf: &mut [u32], vocab_size: usize, batch_index: usize) -> Option<&mut [u32]> {
    let row_len = get_bitmask_size(vocab_size);
    let start = batch_index.checked_mul(row_len)?;
    let end = start.checked_add(row_len)?;
    if row_len == 0 || end > buf.len() {
        return None;
    }
    Some(&mut buf[start..end])
}

/// Set bit `i` in the bitmask (mark token as allowed).
#[inline]
pub fn set_bit(bitmask: &mut [u32], i: usize) {
    bitmask[i / 32] |= 1 << (i % 32);
}

/// Clear bit `i` in the bitmask (mark token as rejected).
#[inline]
pub fn clear_bit(bitmask: &mut [u32], i: usize) {
    bitmask[i / 32] &= !(1 << (i % 32));
}

/// Get bit `i` from the bitmask. Returns true if the token is allowed.
#[inline]
pub fn get_bit(bitmask: &[u32], i: usize) -> bool {
    (bitmask[i / 32] >> (i % 32)) & 1 == 1
}

/// Reset the bitmask to all-zeros (all tokens rejected).
pub fn clear_bitmask(bitmask: &mut [u32]) {
    bitmask.fill(0);
}

/// OR `src` into `dst` word by word.
#[inline]
pub fn union_into(dst: &mut [u32], src: &[u32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d |= *s;
    }
}

/// Number of allowed tokens in the row.
pub fn count_ones(bitmask: &[u32]) -> usize {
    bitmask.iter().map(|w| w.count_ones() as usize).sum()
}

/// Apply the token bitmask to logits in-place.
/// Sets logits to `-inf` for rejected tokens; logits past the mask are rejected too.
pub fn apply_token_bitmask_inplace(logits: &mut [f32], bitmask: &[u32]) {
    let limit = bitmask.len() * 32;
    for (i, logit) in logits.iter_mut().enumerate() {
        if i >= limit || !get_bit(bitmask, i) {
            *logit = f32::NEG_INFINITY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmask_size() {
        assert_eq!(get_bitmask_size(0), 0);
        assert_eq!(get_bitmask_size(1), 1);
        assert_eq!(get_bitmask_size(31), 1);
        assert_eq!(get_bitmask_size(32), 1);
        assert_eq!(get_bitmask_size(33), 2);
        assert_eq!(get_bitmask_size(64), 2);
        assert_eq!(get_bitmask_size(65), 3);
        assert_eq!(get_bitmask_size(128_000), 4000);
    }

    #[test]
    fn test_set_get_clear_bit() {
        let mut bm = vec![0u32; 2];

        set_bit(&mut bm, 0);
        assert!(get_bit(&bm, 0));
        assert!(!get_bit(&bm, 1));

        set_bit(&mut bm, 31);
        assert!(get_bit(&bm, 31));

        set_bit(&mut bm, 32);
        assert!(get_bit(&bm, 32));
        assert_eq!(bm[1], 1);

        clear_bit(&mut bm, 0);
        assert!(!get_bit(&bm, 0));
        assert!(get_bit(&bm, 31));
        assert_eq!(count_ones(&bm), 2);
    }

    #[test]
    fn test_bitmask_row() {
        let mut buf = vec![0u32; 6];
        // vocab 70 -> 3 words per row
        set_bit(bitmask_row(&mut buf, 70, 1).unwrap(), 0);
        assert_eq!(buf[3], 1);
        assert!(bitmask_row(&mut buf, 70, 2).is_none());
        assert!(bitmask_row(&mut [], 70, 0).is_none());
        assert!(bitmask_row(&mut buf, 0, 0).is_none());
    }

    #[test]
    fn test_union_into() {
        let mut a = vec![0b0101u32, 0];
        union_into(&mut a, &[0b0010, 0x8000_0000]);
        assert_eq!(a, vec![0b0111, 0x8000_0000]);
    }

    #[test]
    fn test_apply_token_bitmask() {
        let mut logits = vec![1.0, 2.0, 3.0, 4.0];
        let mut bm = vec![0u32; get_bitmask_size(4)];
        set_bit(&mut bm, 0);
        set_bit(&mut bm, 2);

        apply_token_bitmask_inplace(&mut logits, &bm);

        assert_eq!(logits[0], 1.0);
        assert_eq!(logits[1], f32::NEG_INFINITY);
        assert_eq!(logits[2], 3.0);
        assert_eq!(logits[3], f32::NEG_INFINITY);
    }
}
