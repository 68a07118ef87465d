/*
   gyre, a concurrent cycle-collecting smart pointer library for Rust.
   Copyright (C) 2024 The gyre contributors.

   This program is free software: you can redistribute it and/or modify
   it under the terms of the GNU General Public License as published by
   the Free Software Foundation, either version 3 of the License, or
   (at your option) any later version.

   This program is distributed in the hope that it will be useful,
   but WITHOUT ANY WARRANTY; without even the implied warranty of
   MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
   GNU General Public License for more details.

   You should have received a copy of the GNU General Public License
   along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! The publisher map: address-range discovery of owning control blocks.
//!
//! While a managed object is being constructed and bound, the address range
//! of its storage is registered here.
//! Each of its member edges then finds the control block that owns it by
//! looking up its *own* address, which necessarily falls inside the owner's
//! published range.
//! A thread-local would not do: construction may hop threads (an async
//! constructor suspended between publication and lookup resumes wherever its
//! executor pleases), but an address range stays put.

use std::{collections::BTreeMap, ptr::NonNull};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::control::ControlBlock;

/// A published range: its length and the control block owning it.
struct Span {
    /// Length of the range in bytes.
    len: usize,
    /// The control block under construction at this range.
    ctrl: NonNull<ControlBlock>,
}

unsafe impl Send for Span {}
unsafe impl Sync for Span {}

/// The process-wide map from range start addresses to published spans.
static PUBLISHED: Lazy<RwLock<BTreeMap<usize, Span>>> = Lazy::new(|| RwLock::new(BTreeMap::new()));

/// A scoped publication of `(addr, len) → control block`.
///
/// The entry lives exactly as long as this guard.
pub(crate) struct Publication {
    /// Start address of the published range.
    addr: usize,
}

impl Publication {
    /// Publish the range `[addr, addr + len)` as owned by `ctrl`.
    pub fn new(addr: usize, len: usize, ctrl: NonNull<ControlBlock>) -> Publication {
        let evicted = PUBLISHED.write().insert(addr, Span { len, ctrl });
        debug_assert!(evicted.is_none(), "overlapping publication at {addr:#x}");
        Publication { addr }
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        PUBLISHED.write().remove(&self.addr);
    }
}

/// Find the control block whose published range covers `[addr, addr + len)`.
pub(crate) fn lookup(addr: usize, len: usize) -> Option<NonNull<ControlBlock>> {
    let map = PUBLISHED.read();
    let (&start, span) = map.range(..=addr).next_back()?;
    (addr.checked_add(len)? <= start.checked_add(span.len)?).then_some(span.ctrl)
}
