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

//! Concurrent reference-counted smart pointers that collect cycles.
//!
//! Plain reference counting (`Rc`, `Arc`) leaks cyclic object graphs: once
//! two objects point at each other, their counts never reach zero.
//! `gyre` keeps the familiar shared-pointer API but tracks the edges
//! *between* managed objects separately from the references *into* the
//! graph, so an unreachable cycle is found and destroyed no matter how it is
//! knotted.
//!
//! # How it works
//!
//! Every managed object lives in a *generation*, the unit of collection.
//! An edge between two objects in the same generation holds no strong
//! reference; an edge across generations holds exactly one.
//! Assignments maintain a global ordering between generations, merging them
//! when an assignment would create a backward edge — so any cycle ends up
//! confined to a single generation, where a tri-colour mark–sweep can prove
//! it unreachable and take it apart.
//! Collection runs concurrently with other threads: pointer reads go
//! through a hazard-slot protocol rather than locks, and claiming an object
//! the collector has tentatively condemned is a single compare-and-swap.
//!
//! # Using it
//!
//! Objects refer to each other through [`Member`] fields, and each managed
//! type tells the library where those fields are by implementing [`Cyclic`]
//! (usually with the derive macro):
//!
//! ```
//! use gyre::{Cyclic, Member, Strong};
//!
//! #[derive(Cyclic)]
//! struct Node {
//!     next: Member<Node>,
//! }
//!
//! let a = Strong::new(Node { next: Member::null() });
//! let b = Strong::new(Node { next: Member::from(&a) });
//! a.next.set(&b);
//!
//! // a and b now form a cycle; dropping both external pointers still
//! // destroys them.
//! drop(a);
//! drop(b);
//! ```
//!
//! [`Strong`] is the owning handle (the `Arc` analogue), [`Weak`] the
//! non-owning observer, and [`Anchor`] lets an object mint pointers to
//! itself.
//! Member reads and writes are safe against concurrent use from other
//! threads; the collector never blocks them for more than a bounded lock
//! hold.
//!
//! # Implementing [`Cyclic`] by hand
//!
//! The derive macro covers structs and enums whose fields implement
//! `Cyclic`.
//! A manual implementation delegates to every field that may contain a
//! member or anchor:
//!
//! ```
//! use gyre::{Cyclic, Error, Member, Visitor};
//!
//! struct Pair {
//!     left: Member<Pair>,
//!     right: Member<Pair>,
//!     label: String,
//! }
//!
//! unsafe impl Cyclic for Pair {
//!     fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
//!         self.left.accept(visitor)?;
//!         self.right.accept(visitor)?;
//!         Ok(())
//!     }
//! }
//! ```
//!
//! # Deferring collection
//!
//! By default the thread that drops the last reference into a generation
//! runs that generation's collection inline.
//! [`set_delay_gc`] installs a hook that receives pending collections as
//! [`GcOperation`] handles instead, so they can be shipped to an executor
//! or a dedicated thread.

#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

mod control;
mod generation;
mod hazard;
mod impls;
mod publish;
mod ptr;
mod vertex;

pub use generation::{set_delay_gc, DelayGcFn, GcOperation};
pub use ptr::{Anchor, Member, Strong, Weak};

/// Derive macro for [`Cyclic`], available with the default `derive` feature.
#[cfg(feature = "derive")]
pub use gyre_derive::Cyclic;

/// A type that can live in a managed allocation.
///
/// The only obligation is to route a [`Visitor`] to every [`Member`] and
/// [`Anchor`] directly owned by the value, so that construction can bind
/// them to their control block.
/// Fields that cannot contain members (numbers, strings, foreign types)
/// need nothing; the blanket implementations in this crate make whole
/// member-free types a one-line derive.
///
/// # Safety
///
/// `accept` must visit every member and anchor owned by this value and no
/// others.
/// Visiting a field of a *different* managed object corrupts that object's
/// edge bookkeeping; skipping one of your own leaves an edge invisible to
/// the collector, which can destroy objects still in use.
pub unsafe trait Cyclic {
    /// Route `visitor` to every directly-owned [`Member`] and [`Anchor`].
    ///
    /// Implementations delegate with the `?` operator and return `Ok(())`.
    ///
    /// # Errors
    ///
    /// Whatever the visitor reports — during construction that is binding
    /// failure — plus [`Error::Inaccessible`] if a field is behind a lock
    /// or borrow that cannot be taken.
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error>;
}

/// A traversal over the members and anchors of a managed value.
///
/// Consumers of this library do not usually implement `Visitor`; the
/// library drives one over each freshly constructed value to bind its
/// fields.
pub trait Visitor {
    /// Called for every [`Member`] owned by the accepting value.
    ///
    /// # Errors
    ///
    /// Implementation-defined; construction reports binding failures.
    fn visit_member<T>(&mut self, member: &Member<T>) -> Result<(), Error>;

    /// Called for every [`Anchor`] owned by the accepting value.
    ///
    /// # Errors
    ///
    /// Implementation-defined; construction reports binding failures.
    fn visit_anchor<T: 'static>(&mut self, anchor: &Anchor<T>) -> Result<(), Error>;
}

/// Failures surfaced by construction and by [`Anchor`] operations.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    /// A member or anchor was visited whose address lies in no published
    /// allocation: the `accept` implementation reached into a field it does
    /// not own.
    #[error("no published owner covers the field at {addr:#x}")]
    NoPublishedOwner {
        /// The address that no publication covered.
        addr: usize,
    },

    /// The containing object has not finished construction; pointers to it
    /// cannot be handed out yet.
    #[error("the object is still under construction")]
    UnderConstruction,

    /// The object has been condemned by the collector.
    #[error("the object has been collected")]
    Expired,

    /// The anchor was never bound — it does not live inside a managed
    /// allocation.
    #[error("the anchor is not bound to a managed allocation")]
    Unanchored,

    /// An anchor's type parameter is not the type of the allocation that
    /// covers it: it is either declared with the wrong type or buried in a
    /// sub-structure.
    #[error("the anchor's type parameter is not the containing managed type")]
    MistypedAnchor,

    /// A field could not be reached during binding (a lock was held, a
    /// `RefCell` was mutably borrowed).
    #[error("a field was inaccessible during binding")]
    Inaccessible,
}
