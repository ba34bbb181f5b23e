//! Integer alignment helpers used by page and region arithmetic.

/// Generate the alignment family for one integer type.
///
/// `alignment` must be a power of two; zero leaves the value unchanged.
macro_rules! impl_align_fns {
    ($ty:ty, $suffix:ident) => {
        paste::paste! {
            #[inline(always)]
            pub const fn [<align_down_ $suffix>](value: $ty, alignment: $ty) -> $ty {
                if alignment == 0 {
                    return value;
                }
                value & !(alignment - 1)
            }

            /// Saturates at the highest aligned value instead of wrapping.
            #[inline(always)]
            pub const fn [<align_up_ $suffix>](value: $ty, alignment: $ty) -> $ty {
                if alignment == 0 {
                    return value;
                }
                value.saturating_add(alignment - 1) & !(alignment - 1)
            }

            /// `None` when rounding up would leave the type's range.
            #[inline(always)]
            pub const fn [<checked_align_up_ $suffix>](value: $ty, alignment: $ty) -> Option<$ty> {
                if alignment == 0 {
                    return Some(value);
                }
                match value.checked_add(alignment - 1) {
                    Some(v) => Some(v & !(alignment - 1)),
                    None => None,
                }
            }

            /// Number of `page_size` pages needed to hold `bytes`.
            #[inline(always)]
            pub const fn [<pages_for_ $suffix>](bytes: $ty, page_size: $ty) -> $ty {
                bytes / page_size + if bytes % page_size == 0 { 0 } else { 1 }
            }
        }
    };
}

impl_align_fns!(u64, u64);
impl_align_fns!(usize, usize);
