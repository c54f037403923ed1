//! Multi-listener dispatch primitives.
//!
//! Three flavors with different handle lifetimes:
//!
//! - [`Event`]: handles derive from the callback itself (its allocation
//!   address); rebinding the same `Rc` replaces the old binding.
//! - [`Processor`]: plain numeric handles, unbound explicitly.
//! - [`EventProcessor`]: binding returns an owning [`EventHandler`] that
//!   unbinds on drop.
//!
//! All three broadcast in insertion order and are single-threaded; they are
//! not re-entrant during a broadcast.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Handle derived from the callback content (its allocation address).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFuncHandle(usize);

pub const NULL_EVENT_HANDLE: EventFuncHandle = EventFuncHandle(0);

pub struct Event<T> {
    bound: Vec<Rc<dyn Fn(&T)>>,
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self { bound: Vec::new() }
    }
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_of(func: &Rc<dyn Fn(&T)>) -> EventFuncHandle {
        EventFuncHandle(Rc::as_ptr(func) as *const () as usize)
    }

    /// Binds a callback and returns its content-derived handle. Binding the
    /// same `Rc` twice replaces the previous binding.
    pub fn bind(&mut self, func: Rc<dyn Fn(&T)>) -> EventFuncHandle {
        let handle = Self::handle_of(&func);
        self.unbind(handle);
        self.bound.push(func);
        handle
    }

    pub fn unbind(&mut self, handle: EventFuncHandle) {
        if let Some(i) = self
            .bound
            .iter()
            .position(|f| Self::handle_of(f) == handle)
        {
            self.bound.remove(i);
        }
    }

    pub fn clear(&mut self) {
        self.bound.clear();
    }

    pub fn broadcast(&self, arg: &T) {
        for func in &self.bound {
            func(arg);
        }
    }
}

/// Numeric processor handle.
pub type PHandler = i32;

pub const NULL_PHANDLER: PHandler = -1;

type ProcessorFn<T> = Box<dyn FnMut(&T)>;

pub struct Processor<T> {
    counter: PHandler,
    bound: Vec<(PHandler, ProcessorFn<T>)>,
}

impl<T> Default for Processor<T> {
    fn default() -> Self {
        Self {
            counter: 0,
            bound: Vec::new(),
        }
    }
}

impl<T> Processor<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, func: ProcessorFn<T>) -> PHandler {
        let handler = self.counter;
        self.counter += 1;
        self.bound.push((handler, func));
        handler
    }

    pub fn unbind(&mut self, handler: PHandler) {
        if let Some(i) = self.bound.iter().position(|(h, _)| *h == handler) {
            self.bound.remove(i);
        }
    }

    pub fn is_bound(&self, handler: PHandler) -> bool {
        self.bound.iter().any(|(h, _)| *h == handler)
    }

    /// Invalidates every outstanding handle.
    pub fn clear(&mut self) {
        self.bound.clear();
        self.counter = 0;
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    pub fn broadcast(&mut self, arg: &T) {
        for (_, func) in &mut self.bound {
            func(arg);
        }
    }
}

type SharedBindings<T> = Rc<RefCell<Vec<(i32, ProcessorFn<T>)>>>;

/// Like [`Processor`], but bindings are owned by the returned
/// [`EventHandler`] and detach when the handler is dropped.
pub struct EventProcessor<T> {
    counter: i32,
    bound: SharedBindings<T>,
}

impl<T> Default for EventProcessor<T> {
    fn default() -> Self {
        Self {
            counter: 0,
            bound: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl<T> EventProcessor<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, func: ProcessorFn<T>) -> EventHandler<T> {
        let id = self.counter;
        self.counter += 1;
        self.bound.borrow_mut().push((id, func));
        EventHandler {
            id,
            bound: Rc::downgrade(&self.bound),
        }
    }

    pub fn bind_count(&self) -> usize {
        self.bound.borrow().len()
    }

    pub fn is_bound(&self) -> bool {
        !self.bound.borrow().is_empty()
    }

    /// Drops every binding; outstanding handlers become inert.
    pub fn clear(&mut self) {
        self.bound.borrow_mut().clear();
        self.counter = 0;
    }

    pub fn broadcast(&mut self, arg: &T) {
        for (_, func) in self.bound.borrow_mut().iter_mut() {
            func(arg);
        }
    }
}

/// Owning handle returned by [`EventProcessor::bind`]; unbinds on drop.
pub struct EventHandler<T> {
    id: i32,
    bound: Weak<RefCell<Vec<(i32, ProcessorFn<T>)>>>,
}

impl<T> EventHandler<T> {
    pub fn is_valid(&self) -> bool {
        self.bound
            .upgrade()
            .is_some_and(|b| b.borrow().iter().any(|(id, _)| *id == self.id))
    }

    pub fn clear(&mut self) {
        if let Some(bound) = self.bound.upgrade() {
            bound.borrow_mut().retain(|(id, _)| *id != self.id);
        }
        self.bound = Weak::new();
    }
}

impl<T> Drop for EventHandler<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_broadcasts_in_insertion_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut event: Event<i32> = Event::new();

        let o1 = order.clone();
        event.bind(Rc::new(move |v| o1.borrow_mut().push(*v * 10)));
        let o2 = order.clone();
        event.bind(Rc::new(move |v| o2.borrow_mut().push(*v * 100)));

        event.broadcast(&3);
        assert_eq!(*order.borrow(), vec![30, 300]);
    }

    #[test]
    fn event_unbind_by_handle() {
        let hits = Rc::new(RefCell::new(0));
        let mut event: Event<()> = Event::new();

        let h = hits.clone();
        let handle = event.bind(Rc::new(move |_| *h.borrow_mut() += 1));
        event.broadcast(&());
        event.unbind(handle);
        event.broadcast(&());

        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn processor_numeric_handles() {
        let sum = Rc::new(RefCell::new(0));
        let mut proc: Processor<i32> = Processor::new();

        let s1 = sum.clone();
        let h1 = proc.bind(Box::new(move |v| *s1.borrow_mut() += v));
        let s2 = sum.clone();
        let _h2 = proc.bind(Box::new(move |v| *s2.borrow_mut() += v * 2));

        proc.broadcast(&5);
        assert_eq!(*sum.borrow(), 15);

        assert!(proc.is_bound(h1));
        proc.unbind(h1);
        assert!(!proc.is_bound(h1));

        proc.broadcast(&5);
        assert_eq!(*sum.borrow(), 25);
    }

    #[test]
    fn event_processor_handler_unbinds_on_drop() {
        let hits = Rc::new(RefCell::new(0));
        let mut proc: EventProcessor<()> = EventProcessor::new();

        {
            let h = hits.clone();
            let handler = proc.bind(Box::new(move |_| *h.borrow_mut() += 1));
            assert!(handler.is_valid());
            proc.broadcast(&());
        }

        // Handler dropped: binding gone.
        proc.broadcast(&());
        assert_eq!(*hits.borrow(), 1);
        assert_eq!(proc.bind_count(), 0);
    }

    #[test]
    fn event_processor_clear_invalidates_handlers() {
        let mut proc: EventProcessor<i32> = EventProcessor::new();
        let mut handler = proc.bind(Box::new(|_| {}));
        proc.clear();
        assert!(!handler.is_valid());
        handler.clear();
        assert!(!proc.is_bound());
    }
}
