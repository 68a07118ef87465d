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

//! Vertices: the directed edges of the managed object graph.
//!
//! A vertex represents one edge from an owning object to a target control
//! block.
//! The target cell is hazard-protected, so readers can take a reference
//! without locks; the assignment protocol below keeps the strong-count
//! bookkeeping straight across the generation boundary: an edge between
//! generations holds one strong reference on its target, an edge within a
//! generation holds none.
//! That asymmetry is what makes a generation collectable: once nothing
//! outside references its members, every remaining strong reference is owned
//! by an internal edge and the mark phase can see the cycle for what it is.
//!
//! A vertex starts *unbound*: it knows no owner and is registered nowhere.
//! Binding happens once, when the object containing it is adopted by its
//! control block; until then the target cell merely parks a pending strong
//! reference.

use std::{
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
    control::{Colour, ControlBlock},
    generation::Generation,
    hazard::{HazardCell, RefPtr},
};

/// One directed edge from an owning object to a target control block.
pub(crate) struct Vertex {
    /// The control block of the object this edge belongs to; null until the
    /// vertex is bound.
    owner: AtomicPtr<ControlBlock>,
    /// The edge target.
    ///
    /// The cell holds one control reference on the target, plus one strong
    /// reference if the edge crosses a generation boundary.
    dst: HazardCell<ControlBlock>,
}

impl Vertex {
    /// An unbound vertex with no target.
    pub fn unbound() -> Vertex {
        Vertex {
            owner: AtomicPtr::new(null_mut()),
            dst: HazardCell::null(),
        }
    }

    /// An unbound vertex parking a pending target.
    ///
    /// `target` must carry one strong reference on top of its control
    /// reference; both are surrendered to the vertex.
    pub fn unbound_with(target: RefPtr<ControlBlock>) -> Vertex {
        Vertex {
            owner: AtomicPtr::new(null_mut()),
            dst: HazardCell::new(target),
        }
    }

    /// The owning control block, if the vertex has been bound.
    pub fn owner(&self) -> Option<&ControlBlock> {
        // The owner's control block strictly outlives its edges, so the
        // borrow is good for as long as the vertex is.
        unsafe { self.owner.load(Ordering::Acquire).as_ref() }
    }

    /// Whether the vertex has been bound to an owner.
    pub fn is_bound(&self) -> bool {
        !self.owner.load(Ordering::Acquire).is_null()
    }

    /// Raw read of the target.
    ///
    /// # Safety
    ///
    /// The caller must hold locks that freeze this edge (the owner's
    /// generation merge-locked exclusively, or the target otherwise pinned);
    /// the returned borrow is only good for that critical section.
    pub unsafe fn target<'a>(&self) -> Option<&'a ControlBlock> {
        self.dst.load_raw().as_ref()
    }

    /// Read the target through the hazard protocol, taking a control
    /// reference on it.
    pub fn load_target(&self) -> Option<RefPtr<ControlBlock>> {
        self.dst.get()
    }

    /// Tear the target out of the cell, returning the cell's control
    /// reference on it.
    ///
    /// Any strong reference the edge held is *not* settled here; the caller
    /// owns that accounting.
    /// Used by the collector's destruction phase, which has already decided
    /// which of its members' edges cross generations.
    pub fn clear(&self) -> Option<RefPtr<ControlBlock>> {
        self.dst.swap(None)
    }

    /// Bind this vertex to its owning control block and replay any pending
    /// target through the full assignment protocol.
    ///
    /// Called exactly once, while the owner is under construction.
    pub fn bind(&self, owner: NonNull<ControlBlock>) {
        debug_assert!(!self.is_bound(), "vertex bound twice");
        self.owner.store(owner.as_ptr(), Ordering::Release);
        unsafe { owner.as_ref() }.push_back_edge(NonNull::from(self));
        if let Some(pending) = self.dst.swap(None) {
            self.reset(Some(pending), true, true);
        }
    }

    /// The central mutator operation: point this edge at `new_target`.
    ///
    /// `new_target` carries a control reference; when `has_reference` is
    /// true it also donates one strong reference.
    /// `no_red_promotion` selects the cheaper acquisition for targets that
    /// cannot be red-tagged (the caller reached them through a live strong
    /// pointer).
    pub fn reset(
        &self,
        new_target: Option<RefPtr<ControlBlock>>,
        has_reference: bool,
        no_red_promotion: bool,
    ) {
        // An unbound vertex just parks the pending reference.
        let Some(owner) = self.owner() else {
            debug_assert!(has_reference || new_target.is_none());
            if let Some(old) = self.dst.swap(new_target) {
                old.release(false);
            }
            return;
        };

        // A collected owner's edges are already settled; balance the
        // incoming reference and leave.
        if owner.colour() == Colour::Black {
            if let Some(target) = new_target {
                if has_reference {
                    target.release(false);
                }
            }
            return;
        }

        // Pointing at what we already point at changes nothing.
        let new_raw = new_target
            .as_ref()
            .map_or(null_mut(), |t| t.as_ptr().as_ptr());
        if self.dst.load_raw() == new_raw {
            if let Some(target) = new_target {
                if has_reference {
                    target.release(false);
                }
            }
            return;
        }

        // Establish the order invariant and pin the owner's generation; the
        // guard keeps every membership comparison below stable.
        let guard = Generation::fix_ordering(owner, new_target.as_deref());
        let src_raw = guard.generation_ptr();

        // A collection requested while the merge lock is held is deferred
        // until the guard is gone.
        let mut collect_owner_gen = false;

        if let Some(target) = &new_target {
            let crosses = target.generation.load_raw() != src_raw;
            if crosses && !has_reference {
                if no_red_promotion {
                    target.acquire_no_red();
                } else {
                    target.acquire();
                }
            } else if !crosses && has_reference {
                // Internal edges must not count.
                if target.release(true) == 0 {
                    collect_owner_gen = true;
                }
            }
        }

        let old = self.dst.swap(new_target);

        let mut collect_other: Option<RefPtr<Generation>> = None;
        if let Some(old) = old {
            if old.generation.load_raw() != src_raw {
                // The outgoing edge crossed; its strong reference goes with
                // it.
                if old.release(true) == 0 {
                    collect_other = old.generation.get();
                }
            } else if old.strong() == 0 && old.colour() != Colour::Black {
                collect_owner_gen = true;
            }
        }

        let owner_gen = collect_owner_gen.then(|| guard.generation().clone());
        drop(guard);
        if let Some(gen) = collect_other {
            Generation::request(&gen);
        }
        if let Some(gen) = owner_gen {
            Generation::request(&gen);
        }
    }

    /// Unregister this vertex from its owner.
    ///
    /// Runs as part of drop; separate so that `Drop` for the wrapping
    /// pointer types stays trivial.
    fn unlink(&mut self) {
        let owner = self.owner.load(Ordering::Acquire);
        let Some(owner) = NonNull::new(owner) else {
            // Never bound: only the pending reference needs settling.
            if let Some(pending) = self.dst.swap(None) {
                pending.release(false);
            }
            return;
        };
        self.reset(None, false, true);
        unsafe { owner.as_ref() }.erase_edge(NonNull::from(&*self));
    }
}

impl Drop for Vertex {
    fn drop(&mut self) {
        self.unlink();
    }
}
