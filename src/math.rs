use num_traits::PrimInt;

/// Integer division rounding up.
pub fn ceil<T: PrimInt>(value: T, divisor: T) -> T {
    (value + divisor - T::one()) / divisor
}

/// Rounds `value` up to a multiple of `alignment`.
pub fn round_up<T: PrimInt>(value: T, alignment: T) -> T {
    ceil(value, alignment) * alignment
}

/// Like [`round_up`] but reports overflow instead of wrapping.
pub fn checked_round_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 {
        return None;
    }
    match value % alignment {
        0 => Some(value),
        rem => value.checked_add(alignment - rem),
    }
}

/// Clamps an access of `len` bytes at `offset` to `capacity`.
/// Returns `None` when `offset` itself lies past the end.
pub fn bound_to(capacity: u64, offset: u64, len: usize) -> Option<usize> {
    if offset > capacity || (offset == capacity && len > 0) {
        return None;
    }

    let available = capacity - offset;
    Some((len as u64).min(available) as usize)
}
