//! Hierarchical resource tree with scoped lifetimes and event sources.
//!
//! A [`Resource`] is the universal unit of lifetime in the daemon: the
//! listening bridge, each observer, each forked worker and each in-flight
//! command is a node in one tree. Ownership flows strictly parent→child
//! (`Rc` children, `Weak` back-references); destroying a node destroys its
//! event sources, then its children post-order, then its user data.
//!
//! Node behaviour comes from a static [`ResourceType`] descriptor: an init
//! closure produces the node's typed user data (any failure tears the
//! partial node down), the data's `Drop` is the destroy hook, and the
//! `owns_event_loop` capability gives the node its own epoll loop which all
//! descendants inherit for their event sources.
//!
//! Walk restrictions and isolation make subtrees into boundaries: a node
//! flagged [`ResourceFlags::RESTRICT_WALK_UP`] hides its ancestors, a child
//! flagged [`ResourceFlags::RESTRICT_WALK_DOWN`] is skipped by iteration
//! from above, and [`Resource::isolate_with_children`] detaches a subtree
//! into a new root unless [`ResourceFlags::DISALLOW_ISOLATION`] forbids it.

mod event_loop;

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt::Write as _;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::debug;

pub use event_loop::{ChildExit, EventSource, IoEvents};
use event_loop::EventLoop;

use crate::util::TimerClock;

/// Static descriptor of a resource type.
///
/// Descriptors are compared by address, so each type is declared once as a
/// `static` and passed by reference everywhere.
#[derive(Debug)]
pub struct ResourceType {
    /// Human-readable type name, used in logs and the DOT dump.
    pub name: &'static str,
    /// The node opens and owns an event loop of its own.
    pub owns_event_loop: bool,
    /// The node participates in watchdog notification.
    pub has_watchdog: bool,
}

/// Per-node flag set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceFlags(u32);

impl ResourceFlags {
    /// No restrictions.
    pub const NONE: Self = Self(0);
    /// `parent()` and ancestor walks stop at this node.
    pub const RESTRICT_WALK_UP: Self = Self(1);
    /// Iteration from above skips this node's subtree.
    pub const RESTRICT_WALK_DOWN: Self = Self(1 << 1);
    /// The node may not be detached into a new root.
    pub const DISALLOW_ISOLATION: Self = Self(1 << 2);

    /// True when every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ResourceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Errors produced by resource-tree operations.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// Neither the node nor any ancestor owns an event loop.
    #[error("no event loop available on this resource or its ancestors")]
    NoEventLoop,
    /// The node owns the event loop that is currently dispatching; the
    /// caller must exit the loop before destroying it.
    #[error("event loop is currently dispatching")]
    LoopActive,
    /// The node carries [`ResourceFlags::DISALLOW_ISOLATION`].
    #[error("resource isolation is disallowed")]
    IsolationDisallowed,
    /// Structurally invalid operation (cycle, double-parenting, ...).
    #[error("invalid resource operation: {0}")]
    Invalid(&'static str),
    /// A type's init hook failed.
    #[error("resource initialization failed: {0}")]
    Init(String),
    /// An underlying system call failed.
    #[error(transparent)]
    Os(#[from] Errno),
}

/// A node in the resource tree. See the module docs.
pub struct Resource {
    ty: &'static ResourceType,
    id: String,
    flags: ResourceFlags,
    parent: RefCell<Weak<Resource>>,
    children: RefCell<Vec<Rc<Resource>>>,
    data: RefCell<Option<Box<dyn Any>>>,
    event_loop: Option<Rc<EventLoop>>,
    sources: RefCell<Vec<EventSource>>,
    destroyed: Cell<bool>,
}

impl Resource {
    /// Creates a resource under `parent` (or a new root when `parent` is
    /// `None`) and runs the type's init closure to produce its user data.
    ///
    /// The node is appended to the parent's child list in insertion order.
    /// When the type owns an event loop, a fresh loop is opened before init
    /// runs, so the init closure can already register event sources.
    ///
    /// # Errors
    ///
    /// Propagates init failure after tearing the partially built node down,
    /// and loop-creation failures for loop-owning types.
    pub fn create<T, F>(
        parent: Option<&Rc<Resource>>,
        ty: &'static ResourceType,
        flags: ResourceFlags,
        id: impl Into<String>,
        init: F,
    ) -> Result<Rc<Resource>, ResourceError>
    where
        T: Any,
        F: FnOnce(&Rc<Resource>) -> Result<T, ResourceError>,
    {
        if let Some(parent) = parent {
            if parent.is_destroyed() {
                return Err(ResourceError::Invalid("parent is destroyed"));
            }
        }
        let event_loop = if ty.owns_event_loop {
            Some(EventLoop::new()?)
        } else {
            None
        };
        let res = Rc::new(Resource {
            ty,
            id: id.into(),
            flags,
            parent: RefCell::new(parent.map_or_else(Weak::new, Rc::downgrade)),
            children: RefCell::new(Vec::new()),
            data: RefCell::new(None),
            event_loop,
            sources: RefCell::new(Vec::new()),
            destroyed: Cell::new(false),
        });
        if let Some(parent) = parent {
            parent.children.borrow_mut().push(Rc::clone(&res));
        }

        match init(&res) {
            Ok(data) => {
                *res.data.borrow_mut() = Some(Box::new(data));
                Ok(res)
            },
            Err(e) => {
                let _ = res.destroy();
                Err(e)
            },
        }
    }

    /// Destroys the node: event sources first, then children post-order,
    /// then the user data's drop. The node is unlinked from its parent;
    /// destroying an already-destroyed node is a no-op.
    ///
    /// # Errors
    ///
    /// [`ResourceError::LoopActive`] when the node owns the event loop that
    /// is dispatching right now (in this process) — exit the loop first.
    pub fn destroy(self: &Rc<Self>) -> Result<(), ResourceError> {
        if self.destroyed.get() {
            return Ok(());
        }
        if let Some(event_loop) = &self.event_loop {
            if event_loop.in_dispatch() && event_loop.same_process() {
                return Err(ResourceError::LoopActive);
            }
        }
        self.destroyed.set(true);

        for source in self.sources.borrow_mut().drain(..) {
            source.disarm();
        }

        let children: Vec<Rc<Resource>> = self.children.borrow_mut().drain(..).collect();
        for child in children {
            if let Err(e) = child.destroy() {
                debug!(id = %child.full_id(), error = %e, "child teardown failed");
            }
        }

        self.data.borrow_mut().take();

        let parent = self.parent.borrow().upgrade();
        if let Some(parent) = parent {
            parent
                .children
                .borrow_mut()
                .retain(|c| !Rc::ptr_eq(c, self));
        }
        *self.parent.borrow_mut() = Weak::new();
        Ok(())
    }

    /// The node's own id segment.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The `/`-joined path of id segments from the root to this node.
    #[must_use]
    pub fn full_id(&self) -> String {
        let mut segments = vec![self.id.clone()];
        let mut current = self.parent_raw();
        while let Some(node) = current {
            segments.push(node.id.clone());
            current = node.parent_raw();
        }
        segments.reverse();
        segments.join("/")
    }

    /// True once [`Resource::destroy`] has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    /// Identity check against a type descriptor.
    #[must_use]
    pub fn is_type_of(&self, ty: &'static ResourceType) -> bool {
        std::ptr::eq(self.ty, ty)
    }

    /// The node's type descriptor.
    #[must_use]
    pub fn resource_type(&self) -> &'static ResourceType {
        self.ty
    }

    /// Borrows the node's user data, downcast to `T`.
    #[must_use]
    pub fn data<T: Any>(&self) -> Option<Ref<'_, T>> {
        Ref::filter_map(self.data.borrow(), |d| {
            d.as_ref().and_then(|boxed| boxed.downcast_ref::<T>())
        })
        .ok()
    }

    /// Mutably borrows the node's user data, downcast to `T`.
    #[must_use]
    pub fn data_mut<T: Any>(&self) -> Option<RefMut<'_, T>> {
        RefMut::filter_map(self.data.borrow_mut(), |d| {
            d.as_mut().and_then(|boxed| boxed.downcast_mut::<T>())
        })
        .ok()
    }

    /// The parent node; `None` for a root or when the node restricts
    /// upward walks.
    #[must_use]
    pub fn parent(&self) -> Option<Rc<Resource>> {
        if self.flags.contains(ResourceFlags::RESTRICT_WALK_UP) {
            return None;
        }
        self.parent_raw()
    }

    /// Walks up (honouring walk restrictions) looking for an ancestor of
    /// the given type.
    #[must_use]
    pub fn is_ancestor_of_type(&self, ty: &'static ResourceType) -> bool {
        let mut current = self.parent();
        while let Some(node) = current {
            if node.is_type_of(ty) {
                return true;
            }
            current = node.parent();
        }
        false
    }

    /// The root of the tree this node belongs to. Teardown and logging need
    /// the true topology, so walk restrictions do not apply here.
    #[must_use]
    pub fn top_level(self: &Rc<Self>) -> Rc<Resource> {
        let mut current = Rc::clone(self);
        while let Some(parent) = current.parent_raw() {
            current = parent;
        }
        current
    }

    /// Number of direct children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.borrow().len()
    }

    /// Direct-child lookup by type and id.
    #[must_use]
    pub fn get_child(&self, ty: &'static ResourceType, id: &str) -> Option<Rc<Resource>> {
        self.children
            .borrow()
            .iter()
            .find(|c| c.is_type_of(ty) && c.id == id)
            .cloned()
    }

    /// Snapshot iterator over the direct children. Children destroyed while
    /// iterating are skipped; children flagged
    /// [`ResourceFlags::RESTRICT_WALK_DOWN`] are not part of the snapshot.
    #[must_use]
    pub fn iter(&self) -> ResourceIter {
        let items = self
            .children
            .borrow()
            .iter()
            .filter(|c| !c.flags.contains(ResourceFlags::RESTRICT_WALK_DOWN))
            .map(Rc::downgrade)
            .collect();
        ResourceIter { items, pos: -1 }
    }

    /// Attaches a parentless node as the last child of `self`.
    ///
    /// # Errors
    ///
    /// [`ResourceError::Invalid`] when the child already has a parent or
    /// the attachment would create a cycle.
    pub fn add_child(self: &Rc<Self>, child: &Rc<Resource>) -> Result<(), ResourceError> {
        if child.parent_raw().is_some() {
            return Err(ResourceError::Invalid("child already has a parent"));
        }
        if Rc::ptr_eq(self, child) {
            return Err(ResourceError::Invalid("resource cannot adopt itself"));
        }
        // Adopting an ancestor would close a cycle.
        let mut current = self.parent_raw();
        while let Some(node) = current {
            if Rc::ptr_eq(&node, child) {
                return Err(ResourceError::Invalid("cycle in resource tree"));
            }
            current = node.parent_raw();
        }
        *child.parent.borrow_mut() = Rc::downgrade(self);
        self.children.borrow_mut().push(Rc::clone(child));
        Ok(())
    }

    /// Detaches the node into a new root; its children are handed to the
    /// former parent, keeping their order.
    ///
    /// # Errors
    ///
    /// [`ResourceError::IsolationDisallowed`] when flagged so.
    pub fn isolate(self: &Rc<Self>) -> Result<(), ResourceError> {
        if self.flags.contains(ResourceFlags::DISALLOW_ISOLATION) {
            return Err(ResourceError::IsolationDisallowed);
        }
        let Some(parent) = self.parent_raw() else {
            return Ok(());
        };
        let children: Vec<Rc<Resource>> = self.children.borrow_mut().drain(..).collect();
        for child in &children {
            *child.parent.borrow_mut() = Rc::downgrade(&parent);
        }
        {
            let mut siblings = parent.children.borrow_mut();
            siblings.retain(|c| !Rc::ptr_eq(c, self));
            siblings.extend(children);
        }
        *self.parent.borrow_mut() = Weak::new();
        Ok(())
    }

    /// Detaches the whole subtree rooted at this node into a new root.
    ///
    /// # Errors
    ///
    /// [`ResourceError::IsolationDisallowed`] when flagged so.
    pub fn isolate_with_children(self: &Rc<Self>) -> Result<(), ResourceError> {
        if self.flags.contains(ResourceFlags::DISALLOW_ISOLATION) {
            return Err(ResourceError::IsolationDisallowed);
        }
        let parent = self.parent_raw();
        if let Some(parent) = parent {
            parent
                .children
                .borrow_mut()
                .retain(|c| !Rc::ptr_eq(c, self));
        }
        *self.parent.borrow_mut() = Weak::new();
        Ok(())
    }

    /// Registers interest in readiness of a caller-owned descriptor.
    ///
    /// # Errors
    ///
    /// [`ResourceError::NoEventLoop`] without a loop in scope; epoll
    /// registration failures.
    pub fn create_io_event_source<F>(
        self: &Rc<Self>,
        fd: RawFd,
        handler: F,
    ) -> Result<EventSource, ResourceError>
    where
        F: FnMut(&Rc<Resource>, RawFd, IoEvents) -> Result<(), ResourceError> + 'static,
    {
        let event_loop = self.nearest_event_loop().ok_or(ResourceError::NoEventLoop)?;
        let source = event_loop.add_io(self, fd, Box::new(handler))?;
        self.sources.borrow_mut().push(source.clone());
        Ok(source)
    }

    /// Registers a signal source; the loop blocks the signal and delivers
    /// it through a signalfd so the handler runs on the loop thread.
    ///
    /// # Errors
    ///
    /// As [`Resource::create_io_event_source`].
    pub fn create_signal_event_source<F>(
        self: &Rc<Self>,
        signal: Signal,
        handler: F,
    ) -> Result<EventSource, ResourceError>
    where
        F: FnMut(&Rc<Resource>, i32) -> Result<(), ResourceError> + 'static,
    {
        let event_loop = self.nearest_event_loop().ok_or(ResourceError::NoEventLoop)?;
        let source = event_loop.add_signal(self, signal, Box::new(handler))?;
        self.sources.borrow_mut().push(source.clone());
        Ok(source)
    }

    /// Watches a child process for exit; fires once with the exit status.
    ///
    /// # Errors
    ///
    /// As [`Resource::create_io_event_source`].
    pub fn create_child_event_source<F>(
        self: &Rc<Self>,
        pid: Pid,
        handler: F,
    ) -> Result<EventSource, ResourceError>
    where
        F: FnMut(&Rc<Resource>, ChildExit) -> Result<(), ResourceError> + 'static,
    {
        let event_loop = self.nearest_event_loop().ok_or(ResourceError::NoEventLoop)?;
        let source = event_loop.add_child(self, pid, Box::new(handler))?;
        self.sources.borrow_mut().push(source.clone());
        Ok(source)
    }

    /// Arms a one-shot timer at an absolute microsecond deadline on the
    /// given clock; the handler receives the clock's current time.
    ///
    /// # Errors
    ///
    /// As [`Resource::create_io_event_source`].
    pub fn create_time_event_source<F>(
        self: &Rc<Self>,
        clock: TimerClock,
        deadline_usec: u64,
        handler: F,
    ) -> Result<EventSource, ResourceError>
    where
        F: FnMut(&Rc<Resource>, u64) -> Result<(), ResourceError> + 'static,
    {
        let event_loop = self.nearest_event_loop().ok_or(ResourceError::NoEventLoop)?;
        let source = event_loop.add_timer(self, clock, deadline_usec, Box::new(handler))?;
        self.sources.borrow_mut().push(source.clone());
        Ok(source)
    }

    /// Schedules a one-shot callback for the next loop tick, ahead of any
    /// I/O waiting.
    ///
    /// # Errors
    ///
    /// As [`Resource::create_io_event_source`].
    pub fn create_deferred_event_source<F>(
        self: &Rc<Self>,
        handler: F,
    ) -> Result<EventSource, ResourceError>
    where
        F: FnMut(&Rc<Resource>) -> Result<(), ResourceError> + 'static,
    {
        let event_loop = self.nearest_event_loop().ok_or(ResourceError::NoEventLoop)?;
        let source = event_loop.add_deferred(self, Box::new(handler))?;
        self.sources.borrow_mut().push(source.clone());
        Ok(source)
    }

    /// Destroys an event source ahead of its owning resource.
    pub fn destroy_event_source(&self, source: &EventSource) {
        source.disarm();
        self.sources
            .borrow_mut()
            .retain(|s| s.token() != source.token());
    }

    /// Runs this node's own event loop until a handler exits it.
    ///
    /// # Errors
    ///
    /// [`ResourceError::Invalid`] on a node whose type does not own a loop
    /// or when the loop is already running; unrecoverable loop errors.
    pub fn run_event_loop(&self) -> Result<(), ResourceError> {
        match &self.event_loop {
            Some(event_loop) => event_loop.run(),
            None => Err(ResourceError::Invalid(
                "resource does not own an event loop",
            )),
        }
    }

    /// Requests exit of the nearest event loop; effective once the current
    /// handler returns.
    ///
    /// # Errors
    ///
    /// [`ResourceError::NoEventLoop`] without a loop in scope.
    pub fn exit_event_loop(&self) -> Result<(), ResourceError> {
        let event_loop = self.nearest_event_loop().ok_or(ResourceError::NoEventLoop)?;
        event_loop.exit();
        Ok(())
    }

    /// Renders the subtree rooted here in DOT format.
    #[must_use]
    pub fn dump_dot(&self) -> String {
        let mut out = String::from("digraph resources {\n");
        self.dump_dot_node(&mut out);
        out.push_str("}\n");
        out
    }

    fn dump_dot_node(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "    \"{}\" [label=\"{}\\n({})\"];",
            self.full_id(),
            self.id,
            self.ty.name
        );
        for child in self.children.borrow().iter() {
            let _ = writeln!(out, "    \"{}\" -> \"{}\";", self.full_id(), child.full_id());
            child.dump_dot_node(out);
        }
    }

    fn parent_raw(&self) -> Option<Rc<Resource>> {
        self.parent.borrow().upgrade()
    }

    fn nearest_event_loop(&self) -> Option<Rc<EventLoop>> {
        if let Some(event_loop) = &self.event_loop {
            return Some(Rc::clone(event_loop));
        }
        let mut current = self.parent_raw();
        while let Some(node) = current {
            if let Some(event_loop) = &node.event_loop {
                return Some(Rc::clone(event_loop));
            }
            current = node.parent_raw();
        }
        None
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        // A node dropped without an explicit destroy still unregisters its
        // event sources.
        for source in self.sources.borrow_mut().drain(..) {
            source.disarm();
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("type", &self.ty.name)
            .field("id", &self.id)
            .field("children", &self.child_count())
            .field("destroyed", &self.destroyed.get())
            .finish()
    }
}

/// Snapshot iterator over a node's direct children.
///
/// The cursor starts before the first child; `next`/`previous` move it and
/// return the child it lands on.
pub struct ResourceIter {
    items: Vec<Weak<Resource>>,
    pos: isize,
}

impl ResourceIter {
    /// Advances to the next live child.
    #[allow(clippy::should_implement_trait)] // bidirectional cursor, not an Iterator
    pub fn next(&mut self) -> Option<Rc<Resource>> {
        while (self.pos + 1) < self.items.len() as isize {
            self.pos += 1;
            #[allow(clippy::cast_sign_loss)] // pos >= 0 after the increment
            if let Some(res) = self.live(self.pos as usize) {
                return Some(res);
            }
        }
        self.pos = self.items.len() as isize;
        None
    }

    /// Steps back to the previous live child.
    pub fn previous(&mut self) -> Option<Rc<Resource>> {
        while self.pos > 0 {
            self.pos -= 1;
            #[allow(clippy::cast_sign_loss)] // pos >= 0 inside the loop
            if let Some(res) = self.live(self.pos as usize) {
                return Some(res);
            }
        }
        self.pos = -1;
        None
    }

    /// The child under the cursor, if still live.
    #[must_use]
    pub fn current(&self) -> Option<Rc<Resource>> {
        if self.pos < 0 || self.pos >= self.items.len() as isize {
            return None;
        }
        #[allow(clippy::cast_sign_loss)] // bounds checked above
        self.live(self.pos as usize)
    }

    /// Moves the cursor back before the first child.
    pub fn reset(&mut self) {
        self.pos = -1;
    }

    fn live(&self, index: usize) -> Option<Rc<Resource>> {
        self.items[index]
            .upgrade()
            .filter(|res| !res.is_destroyed())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::time::Instant;

    use nix::unistd::{pipe, write};

    use super::*;
    use crate::util::{now_usec, TimerClock};

    static GROUP: ResourceType = ResourceType {
        name: "group",
        owns_event_loop: false,
        has_watchdog: false,
    };

    static MAIN: ResourceType = ResourceType {
        name: "main",
        owns_event_loop: true,
        has_watchdog: false,
    };

    struct Tag(&'static str);

    fn node(parent: Option<&Rc<Resource>>, ty: &'static ResourceType, id: &str) -> Rc<Resource> {
        Resource::create(parent, ty, ResourceFlags::NONE, id, |_| Ok(Tag(ty.name))).unwrap()
    }

    fn descendant_ids(res: &Rc<Resource>) -> Vec<String> {
        let mut out = Vec::new();
        let mut iter = res.iter();
        while let Some(child) = iter.next() {
            out.push(child.full_id());
            out.extend(descendant_ids(&child));
        }
        out
    }

    #[test]
    fn destroy_removes_exactly_the_subtree() {
        let root = node(None, &GROUP, "root");
        let _a = node(Some(&root), &GROUP, "a");
        let b = node(Some(&root), &GROUP, "b");
        let _b1 = node(Some(&b), &GROUP, "b1");
        let _b2 = node(Some(&b), &GROUP, "b2");

        assert_eq!(
            descendant_ids(&root),
            vec!["root/a", "root/b", "root/b/b1", "root/b/b2"]
        );

        b.destroy().unwrap();
        assert_eq!(descendant_ids(&root), vec!["root/a"]);
        assert!(b.is_destroyed());
    }

    #[test]
    fn failed_init_tears_the_node_down() {
        let root = node(None, &GROUP, "root");
        let result = Resource::create(Some(&root), &GROUP, ResourceFlags::NONE, "bad", |_| {
            Err::<Tag, _>(ResourceError::Init("no good".into()))
        });
        assert!(result.is_err());
        assert_eq!(root.child_count(), 0);
    }

    #[test]
    fn typed_data_access() {
        let root = node(None, &GROUP, "root");
        assert_eq!(root.data::<Tag>().unwrap().0, "group");
        assert!(root.data::<String>().is_none());

        root.data_mut::<Tag>().unwrap().0 = "changed";
        assert_eq!(root.data::<Tag>().unwrap().0, "changed");
    }

    #[test]
    fn type_identity_and_ancestry() {
        let root = node(None, &GROUP, "root");
        let main = node(Some(&root), &MAIN, "main");
        let leaf = node(Some(&main), &GROUP, "leaf");

        assert!(main.is_type_of(&MAIN));
        assert!(!main.is_type_of(&GROUP));
        assert!(leaf.is_ancestor_of_type(&MAIN));
        assert!(leaf.is_ancestor_of_type(&GROUP));
        assert!(!root.is_ancestor_of_type(&GROUP));
        assert!(Rc::ptr_eq(&leaf.top_level(), &root));
    }

    #[test]
    fn walk_up_restriction_hides_ancestors() {
        let root = node(None, &GROUP, "root");
        let fenced = Resource::create(
            Some(&root),
            &GROUP,
            ResourceFlags::RESTRICT_WALK_UP,
            "fenced",
            |_| Ok(Tag("fenced")),
        )
        .unwrap();
        let leaf = node(Some(&fenced), &GROUP, "leaf");

        assert!(fenced.parent().is_none());
        assert!(!leaf.is_ancestor_of_type(&MAIN));
        // Ancestry search stops at the fence, so root's type is invisible.
        assert!(leaf.is_ancestor_of_type(&GROUP)); // fenced itself matches
        assert_eq!(leaf.full_id(), "root/fenced/leaf");
    }

    #[test]
    fn walk_down_restriction_hides_subtree() {
        let root = node(None, &GROUP, "root");
        let _open = node(Some(&root), &GROUP, "open");
        let _hidden = Resource::create(
            Some(&root),
            &GROUP,
            ResourceFlags::RESTRICT_WALK_DOWN,
            "hidden",
            |_| Ok(Tag("hidden")),
        )
        .unwrap();

        assert_eq!(descendant_ids(&root), vec!["root/open"]);
        assert_eq!(root.child_count(), 2);
    }

    #[test]
    fn iteration_skips_children_destroyed_mid_walk() {
        let root = node(None, &GROUP, "root");
        let _a = node(Some(&root), &GROUP, "a");
        let b = node(Some(&root), &GROUP, "b");
        let _c = node(Some(&root), &GROUP, "c");

        let mut iter = root.iter();
        let first = iter.next().unwrap();
        assert_eq!(first.id(), "a");
        b.destroy().unwrap();
        let second = iter.next().unwrap();
        assert_eq!(second.id(), "c");
        assert!(iter.next().is_none());

        iter.reset();
        assert_eq!(iter.next().unwrap().id(), "a");
        assert!(iter.previous().is_none());
    }

    #[test]
    fn iterator_walks_both_directions() {
        let root = node(None, &GROUP, "root");
        for id in ["a", "b", "c"] {
            node(Some(&root), &GROUP, id);
        }
        let mut iter = root.iter();
        assert_eq!(iter.next().unwrap().id(), "a");
        assert_eq!(iter.next().unwrap().id(), "b");
        assert_eq!(iter.current().unwrap().id(), "b");
        assert_eq!(iter.previous().unwrap().id(), "a");
        assert_eq!(iter.next().unwrap().id(), "b");
    }

    #[test]
    fn child_lookup_by_type_and_id() {
        let root = node(None, &GROUP, "root");
        let _main = node(Some(&root), &MAIN, "1234");
        let _other = node(Some(&root), &GROUP, "1234");

        let found = root.get_child(&MAIN, "1234").unwrap();
        assert!(found.is_type_of(&MAIN));
        assert!(root.get_child(&MAIN, "9999").is_none());
    }

    #[test]
    fn isolate_reparents_children() {
        let root = node(None, &GROUP, "root");
        let mid = node(Some(&root), &GROUP, "mid");
        let leaf = node(Some(&mid), &GROUP, "leaf");

        mid.isolate().unwrap();
        assert!(mid.parent().is_none());
        assert_eq!(mid.child_count(), 0);
        assert!(Rc::ptr_eq(&leaf.parent().unwrap(), &root));
        assert_eq!(leaf.full_id(), "root/leaf");
    }

    #[test]
    fn isolate_with_children_detaches_subtree() {
        let root = node(None, &GROUP, "root");
        let mid = node(Some(&root), &GROUP, "mid");
        let leaf = node(Some(&mid), &GROUP, "leaf");

        mid.isolate_with_children().unwrap();
        assert!(mid.parent().is_none());
        assert_eq!(root.child_count(), 0);
        assert_eq!(leaf.full_id(), "mid/leaf");
    }

    #[test]
    fn isolation_can_be_disallowed() {
        let root = node(None, &GROUP, "root");
        let pinned = Resource::create(
            Some(&root),
            &GROUP,
            ResourceFlags::DISALLOW_ISOLATION,
            "pinned",
            |_| Ok(Tag("pinned")),
        )
        .unwrap();

        assert!(matches!(
            pinned.isolate(),
            Err(ResourceError::IsolationDisallowed)
        ));
        assert!(matches!(
            pinned.isolate_with_children(),
            Err(ResourceError::IsolationDisallowed)
        ));
        assert!(Rc::ptr_eq(&pinned.parent().unwrap(), &root));
    }

    #[test]
    fn add_child_rejects_cycles() {
        let root = node(None, &GROUP, "root");
        let child = node(Some(&root), &GROUP, "child");

        assert!(matches!(
            child.add_child(&root),
            Err(ResourceError::Invalid(_))
        ));
        assert!(matches!(
            root.add_child(&child),
            Err(ResourceError::Invalid(_))
        ));

        let orphan = node(None, &GROUP, "orphan");
        child.add_child(&orphan).unwrap();
        assert_eq!(orphan.full_id(), "root/child/orphan");
    }

    #[test]
    fn dot_dump_contains_every_edge() {
        let root = node(None, &GROUP, "root");
        let mid = node(Some(&root), &GROUP, "mid");
        let _leaf = node(Some(&mid), &GROUP, "leaf");

        let dot = root.dump_dot();
        assert!(dot.contains("\"root\" -> \"root/mid\";"));
        assert!(dot.contains("\"root/mid\" -> \"root/mid/leaf\";"));
    }

    #[test]
    fn deferred_sources_run_before_io() {
        let root = node(None, &MAIN, "main");
        let order = Rc::new(RefCell::new(Vec::new()));
        let (rx, tx) = pipe().unwrap();
        write(&tx, b"x").unwrap();

        use std::os::fd::AsRawFd;
        let seen = Rc::clone(&order);
        root.create_io_event_source(rx.as_raw_fd(), move |res, _, _| {
            seen.borrow_mut().push("io");
            res.exit_event_loop()
        })
        .unwrap();
        let seen = Rc::clone(&order);
        root.create_deferred_event_source(move |_| {
            seen.borrow_mut().push("deferred");
            Ok(())
        })
        .unwrap();

        root.run_event_loop().unwrap();
        assert_eq!(*order.borrow(), vec!["deferred", "io"]);
    }

    #[test]
    fn timer_fires_at_deadline() {
        let root = node(None, &MAIN, "main");
        let start = Instant::now();
        let deadline = now_usec(TimerClock::Monotonic) + 30_000;
        root.create_time_event_source(TimerClock::Monotonic, deadline, |res, _now| {
            res.exit_event_loop()
        })
        .unwrap();

        root.run_event_loop().unwrap();
        assert!(start.elapsed().as_micros() >= 25_000);
    }

    #[test]
    fn destroying_the_dispatching_loop_owner_fails() {
        let root = node(None, &MAIN, "main");
        let outcome = Rc::new(RefCell::new(None));

        let seen = Rc::clone(&outcome);
        root.create_deferred_event_source(move |res| {
            *seen.borrow_mut() = Some(res.destroy().is_err());
            res.exit_event_loop()
        })
        .unwrap();

        root.run_event_loop().unwrap();
        assert_eq!(*outcome.borrow(), Some(true));
        // Outside dispatch the destroy goes through.
        root.destroy().unwrap();
    }

    #[test]
    fn event_source_destroyed_with_its_resource() {
        let root = node(None, &MAIN, "main");
        let (rx, _tx) = pipe().unwrap();

        use std::os::fd::AsRawFd;
        let child = node(Some(&root), &GROUP, "watcher");
        child
            .create_io_event_source(rx.as_raw_fd(), |_, _, _| Ok(()))
            .unwrap();
        child.destroy().unwrap();

        // The loop no longer knows the source; a second destroy of the
        // handle is a no-op.
        drop(rx);
        root.destroy().unwrap();
    }

    #[test]
    fn run_requires_a_loop_owner() {
        let plain = node(None, &GROUP, "plain");
        assert!(matches!(
            plain.run_event_loop(),
            Err(ResourceError::Invalid(_))
        ));
        assert!(matches!(
            plain.exit_event_loop(),
            Err(ResourceError::NoEventLoop)
        ));
    }
}
