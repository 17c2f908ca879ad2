//! Single-slot cross-thread cells and fixed-capacity text buffers.

use std::ffi::CStr;
use std::fmt;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A single-slot mailbox holding the latest unconsumed value.
///
/// `post` replaces whatever is in the slot (last write wins), `take` is an
/// atomic test-and-clear that hands the value out together with the flag, so
/// a drained payload always belongs to the occurrence that set the flag.
pub struct Mailbox<T> {
    slot: AtomicPtr<T>,
}

unsafe impl<T: Send> Send for Mailbox<T> {}
unsafe impl<T: Send> Sync for Mailbox<T> {}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub const fn new() -> Self {
        Self {
            slot: AtomicPtr::new(null_mut()),
        }
    }

    /// Returns `true` when an older, undrained value was replaced.
    pub fn post(&self, value: T) -> bool {
        let fresh = Box::into_raw(Box::new(value));
        let old = self.slot.swap(fresh, Ordering::AcqRel);
        if old.is_null() {
            false
        } else {
            // SAFETY: old came from Box::into_raw and left the slot atomically.
            drop(unsafe { Box::from_raw(old) });
            true
        }
    }

    pub fn take(&self) -> Option<T> {
        let value = self.slot.swap(null_mut(), Ordering::AcqRel);
        if value.is_null() {
            None
        } else {
            // SAFETY: see post().
            Some(*unsafe { Box::from_raw(value) })
        }
    }

    #[cfg(test)]
    pub fn is_set(&self) -> bool {
        !self.slot.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for Mailbox<T> {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// UTF-8 text copied into a fixed buffer of `N` bytes.
///
/// At most `N - 1` bytes are kept, cut on a char boundary, and the byte after
/// the text is always NUL so the buffer can be handed to C as-is.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BoundedStr<const N: usize> {
    len: usize,
    bytes: [u8; N],
}

impl<const N: usize> BoundedStr<N> {
    pub fn new(text: &str) -> Self {
        let mut out = Self {
            len: 0,
            bytes: [0u8; N],
        };
        if N == 0 {
            return out;
        }
        let mut len = text.len().min(N - 1);
        while !text.is_char_boundary(len) {
            len -= 1;
        }
        // interior NULs would cut the C view short; stop the copy there too
        if let Some(nul) = text.as_bytes()[..len].iter().position(|&b| b == 0) {
            len = nul;
        }
        out.bytes[..len].copy_from_slice(&text.as_bytes()[..len]);
        out.len = len;
        out
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: bytes[..len] is a prefix of a &str cut on a char boundary.
        unsafe { std::str::from_utf8_unchecked(&self.bytes[..self.len]) }
    }

    pub fn as_c_str(&self) -> &CStr {
        match CStr::from_bytes_until_nul(&self.bytes) {
            Ok(text) => text,
            Err(_) => c"",
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> Default for BoundedStr<N> {
    fn default() -> Self {
        Self::new("")
    }
}

impl<const N: usize> fmt::Debug for BoundedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for BoundedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> From<&str> for BoundedStr<N> {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}
