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

//! End-to-end reachability scenarios: cycles, keepers, merges, weak
//! promotion, and aborted construction.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use gyre::{Anchor, Cyclic, Error, Member, Strong, Visitor};

/// Bumps a shared counter when dropped.
struct DropCount(Arc<AtomicUsize>);

impl Drop for DropCount {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// A managed node with one edge.
struct Node {
    next: Member<Node>,
    _drops: DropCount,
}

unsafe impl Cyclic for Node {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        self.next.accept(visitor)
    }
}

impl Node {
    fn leaf(drops: &Arc<AtomicUsize>) -> Node {
        Node {
            next: Member::null(),
            _drops: DropCount(Arc::clone(drops)),
        }
    }
}

/// S1: a two-node cycle with no external references is collected.
#[test]
fn two_node_cycle_is_collected() {
    let drops = Arc::new(AtomicUsize::new(0));

    let a = Strong::new(Node::leaf(&drops));
    let b = Strong::new(Node {
        next: Member::from(&a),
        _drops: DropCount(Arc::clone(&drops)),
    });
    a.next.set(&b);

    assert_eq!(drops.load(Ordering::Relaxed), 0);
    drop(a);
    assert_eq!(drops.load(Ordering::Relaxed), 0);
    drop(b);
    assert_eq!(drops.load(Ordering::Relaxed), 2);
}

/// S2: a self-referential object is collected.
#[test]
fn self_reference_is_collected() {
    let drops = Arc::new(AtomicUsize::new(0));

    let a = Strong::new(Node::leaf(&drops));
    a.next.set(&a);

    drop(a);
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

/// S3: a cross-generation edge keeps its target alive; dropping the keeper
/// collects both.
#[test]
fn external_keeper_pins_its_target() {
    let drops = Arc::new(AtomicUsize::new(0));

    let a = Strong::new(Node::leaf(&drops));
    let b = Strong::new(Node::leaf(&drops));
    a.next.set(&b);
    let watch_b = Strong::downgrade(&b);

    drop(b);
    // B survives through A's edge.
    assert_eq!(drops.load(Ordering::Relaxed), 0);
    assert!(watch_b.upgrade().is_some());
    assert!(a.next.get().is_some());

    drop(a);
    assert_eq!(drops.load(Ordering::Relaxed), 2);
    assert!(watch_b.upgrade().is_none());
}

/// S4: a back-edge between two generations forces them into one, after
/// which the cycle is collectable.
#[test]
fn back_edge_merges_generations() {
    let drops = Arc::new(AtomicUsize::new(0));

    let a = Strong::new(Node::leaf(&drops));
    let b = Strong::new(Node::leaf(&drops));
    a.next.set(&b); // forward edge, order holds
    b.next.set(&a); // back edge, generations merge

    drop(a);
    assert_eq!(drops.load(Ordering::Relaxed), 0);
    drop(b);
    assert_eq!(drops.load(Ordering::Relaxed), 2);
}

/// An N-node ring with one external reference stays alive; dropping that
/// reference collects every node.
#[test]
fn ring_collapses_only_when_unreferenced() {
    let drops = Arc::new(AtomicUsize::new(0));
    const N: usize = 7;

    let nodes: Vec<Strong<Node>> = (0..N).map(|_| Strong::new(Node::leaf(&drops))).collect();
    for i in 0..N {
        nodes[i].next.set(&nodes[(i + 1) % N]);
    }

    let keeper = nodes[3].clone();
    drop(nodes);
    assert_eq!(drops.load(Ordering::Relaxed), 0);

    // The whole ring is reachable through the keeper.
    assert!(keeper.next.get().is_some());

    drop(keeper);
    assert_eq!(drops.load(Ordering::Relaxed), N);
}

/// Assigning the same target twice changes nothing; clearing the edge lets
/// the target go.
#[test]
fn reassignment_is_idempotent() {
    let drops = Arc::new(AtomicUsize::new(0));

    let a = Strong::new(Node::leaf(&drops));
    let b = Strong::new(Node::leaf(&drops));
    a.next.set(&b);
    a.next.set(&b);
    drop(b);

    let through = a.next.get().expect("edge target should be alive");
    assert_eq!(drops.load(Ordering::Relaxed), 0);
    drop(through);

    a.next.clear();
    assert_eq!(drops.load(Ordering::Relaxed), 1);

    drop(a);
    assert_eq!(drops.load(Ordering::Relaxed), 2);
}

/// S5 (single-threaded half): weak pointers pin an object only by
/// upgrading in time; afterwards they observe expiry.
#[test]
fn weak_promotion_and_expiry() {
    let drops = Arc::new(AtomicUsize::new(0));

    let a = Strong::new(Node::leaf(&drops));
    let weak = Strong::downgrade(&a);

    let pinned = weak.upgrade().expect("upgrade of a live object");
    drop(a);
    assert_eq!(drops.load(Ordering::Relaxed), 0);

    drop(pinned);
    assert_eq!(drops.load(Ordering::Relaxed), 1);
    assert!(weak.upgrade().is_none());
}

/// A weak pointer into a collected cycle reports expiry rather than
/// resurrecting garbage.
#[test]
fn weak_into_a_dead_cycle_is_expired() {
    let drops = Arc::new(AtomicUsize::new(0));

    let a = Strong::new(Node::leaf(&drops));
    let b = Strong::new(Node {
        next: Member::from(&a),
        _drops: DropCount(Arc::clone(&drops)),
    });
    a.next.set(&b);
    let weak = Strong::downgrade(&b);

    drop(a);
    drop(b);
    assert_eq!(drops.load(Ordering::Relaxed), 2);
    assert!(weak.upgrade().is_none());
}

/// A node whose `accept` reaches for its own strong pointer mid-binding
/// observes the under-construction state.
struct Nosy {
    anchor: Anchor<Nosy>,
    observed: Arc<Mutex<Option<Error>>>,
}

unsafe impl Cyclic for Nosy {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        self.anchor.accept(visitor)?;
        // The anchor is bound now, but construction has not finished.
        *self.observed.lock().unwrap() = self.anchor.strong().err();
        Ok(())
    }
}

#[test]
fn anchor_refuses_handout_during_construction() {
    let observed = Arc::new(Mutex::new(None));
    let nosy = Strong::new(Nosy {
        anchor: Anchor::new(),
        observed: Arc::clone(&observed),
    });

    assert!(matches!(
        observed.lock().unwrap().take(),
        Some(Error::UnderConstruction)
    ));

    // After construction the anchor works.
    let this = nosy.anchor.strong().expect("anchor after construction");
    assert!(Strong::ptr_eq(&this, &nosy));
}

/// An anchor that never made it into a managed allocation reports so.
#[test]
fn unanchored_anchor_reports_unanchored() {
    let loose: Anchor<Nosy> = Anchor::new();
    assert!(matches!(loose.strong(), Err(Error::Unanchored)));
}

/// S6 (panic half): a constructor that unwinds releases everything it
/// touched.
#[test]
fn aborted_construction_releases_everything() {
    let drops = Arc::new(AtomicUsize::new(0));

    let result = catch_unwind(AssertUnwindSafe(|| {
        Strong::new_with(|| -> Node {
            // Allocate a collaborator and park an edge to it, then fail.
            let other = Strong::new(Node::leaf(&drops));
            let _edge = Member::from(&other);
            panic!("constructor failure");
        })
    }));
    assert!(result.is_err());

    // The collaborator, the parked edge reference, and the unwritten
    // allocation are all gone.
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

/// S6 (binding half): a value whose members cannot be bound is torn down
/// through the collector and the error is recoverable.
struct Misplaced {
    // A member behind a Box is outside the published storage range, which
    // is exactly the misuse binding must catch.
    boxed: Box<Member<Misplaced>>,
    _drops: DropCount,
}

unsafe impl Cyclic for Misplaced {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        self.boxed.accept(visitor)
    }
}

#[test]
fn unbindable_member_fails_construction_recoverably() {
    let drops = Arc::new(AtomicUsize::new(0));

    let result = Strong::try_new_with(|| Misplaced {
        boxed: Box::new(Member::null()),
        _drops: DropCount(Arc::clone(&drops)),
    });

    assert!(matches!(result, Err(Error::NoPublishedOwner { .. })));
    // The value existed, so its destructor ran.
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

/// Aliasing: a projected pointer keeps the whole allocation alive and
/// refuses to be stored in a member edge.
#[test]
fn projection_shares_ownership() {
    let drops = Arc::new(AtomicUsize::new(0));

    let a = Strong::new(Node::leaf(&drops));
    let b = Strong::new(Node::leaf(&drops));
    a.next.set(&b);

    let edge: Strong<Member<Node>> = Strong::project(&a, |node| &node.next);
    drop(a);
    assert_eq!(drops.load(Ordering::Relaxed), 0);

    // The projected handle still reads the edge.
    assert!(edge.get().is_some());

    drop(b);
    drop(edge);
    assert_eq!(drops.load(Ordering::Relaxed), 2);
}

/// A container whose node field sits at a non-zero offset, so a projection
/// to it is observably aliased.
#[repr(C)]
struct Holder {
    _pad: u64,
    node: Node,
}

unsafe impl Cyclic for Holder {
    fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<(), Error> {
        self.node.accept(visitor)
    }
}

#[test]
#[should_panic(expected = "aliased pointers cannot be stored in member edges")]
fn aliased_pointers_are_rejected_by_members() {
    let drops = Arc::new(AtomicUsize::new(0));
    let holder = Strong::new(Holder {
        _pad: 0,
        node: Node::leaf(&drops),
    });
    let aliased: Strong<Node> = Strong::project(&holder, |h| &h.node);

    let a = Strong::new(Node::leaf(&drops));
    a.next.set(&aliased);
}

/// The derive macro wires up nested containers the same way a manual
/// implementation does.
#[derive(Cyclic)]
struct Derived {
    first: Member<Derived>,
    second: Option<Member<Derived>>,
    _label: String,
}

#[test]
fn derived_types_participate_in_collection() {
    let a = Strong::new(Derived {
        first: Member::null(),
        second: Some(Member::null()),
        _label: String::from("a"),
    });
    let b = Strong::new(Derived {
        first: Member::from(&a),
        second: None,
        _label: String::from("b"),
    });
    a.second.as_ref().unwrap().set(&b);

    let watch = Strong::downgrade(&a);
    drop(a);
    drop(b);
    assert!(watch.upgrade().is_none());
}

/// Acyclic allocations share the unowned generation and are still
/// reclaimed; pointing a member at one folds it into the owner's world.
#[test]
fn acyclic_allocations_are_reclaimed() {
    let drops = Arc::new(AtomicUsize::new(0));

    let lone = Strong::new_acyclic(Node::leaf(&drops));
    drop(lone);
    assert_eq!(drops.load(Ordering::Relaxed), 1);

    // An edge into an acyclic object demotes the marking, not safety.
    let leaf = Strong::new_acyclic(Node::leaf(&drops));
    let owner = Strong::new(Node::leaf(&drops));
    owner.next.set(&leaf);
    drop(leaf);
    assert_eq!(drops.load(Ordering::Relaxed), 1);
    assert!(owner.next.get().is_some());

    drop(owner);
    assert_eq!(drops.load(Ordering::Relaxed), 3);
}

/// Deep chains across many generations collapse cleanly.
#[test]
fn long_chain_collects_from_the_head() {
    let drops = Arc::new(AtomicUsize::new(0));
    const N: usize = 64;

    let head = Strong::new(Node::leaf(&drops));
    let mut tail = head.clone();
    for _ in 1..N {
        let next = Strong::new(Node::leaf(&drops));
        tail.next.set(&next);
        tail = next;
    }
    // Close the loop to make it a cycle spanning many original generations.
    tail.next.set(&head);
    drop(tail);

    assert_eq!(drops.load(Ordering::Relaxed), 0);
    drop(head);
    assert_eq!(drops.load(Ordering::Relaxed), N);
}
