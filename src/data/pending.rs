use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;
use log::warn;

use crate::data::ContainerKind;
use crate::protocol::CallTarget;
use crate::{Error, Value};

/// Outcome of a server call as delivered to asynchronous completions.
pub type CallResult = std::result::Result<Value, Error>;

pub type Callback = Rc<dyn Fn(&CallResult)>;

struct PromiseInner {
    result: RefCell<Option<CallResult>>,
    continuations: RefCell<Vec<Box<dyn FnOnce(&CallResult)>>>,
}

/// Single-assignment completion handle. The first `settle` wins; later
/// attempts are ignored and reported as `false`.
#[derive(Clone)]
pub struct Promise(Rc<PromiseInner>);

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

impl Promise {
    pub fn new() -> Self {
        Promise(Rc::new(PromiseInner {
            result: RefCell::new(None),
            continuations: RefCell::new(Vec::new()),
        }))
    }

    pub fn resolved(value: Value) -> Self {
        let promise = Promise::new();
        promise.settle(Ok(value));
        promise
    }

    pub fn rejected(error: Error) -> Self {
        let promise = Promise::new();
        promise.settle(Err(error));
        promise
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_settled(&self) -> bool {
        self.0.result.borrow().is_some()
    }

    pub fn result(&self) -> Option<CallResult> {
        self.0.result.borrow().clone()
    }

    pub fn settle(&self, result: CallResult) -> bool {
        {
            let mut slot = self.0.result.borrow_mut();
            if slot.is_some() {
                return false;
            }
            *slot = Some(result.clone());
        }
        let continuations = std::mem::take(&mut *self.0.continuations.borrow_mut());
        for continuation in continuations {
            continuation(&result);
        }
        true
    }

    /// Runs `f` once the promise settles, immediately if it already has.
    pub fn then(&self, f: impl FnOnce(&CallResult) + 'static) {
        let settled = self.result();
        match settled {
            Some(result) => f(&result),
            None => self.0.continuations.borrow_mut().push(Box::new(f)),
        }
    }
}

/// A completion target passed among a method's arguments.
#[derive(Clone)]
pub enum Notify {
    Callback(Callback),
    Promise(Promise),
}

impl Notify {
    pub fn callback(f: impl Fn(&CallResult) + 'static) -> Self {
        Notify::Callback(Rc::new(f))
    }

    pub fn ptr_eq(&self, other: &Notify) -> bool {
        match (self, other) {
            (Notify::Callback(a), Notify::Callback(b)) => Rc::ptr_eq(a, b),
            (Notify::Promise(a), Notify::Promise(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub(crate) fn deliver(&self, result: &CallResult) {
        match self {
            Notify::Callback(cb) => cb(result),
            Notify::Promise(p) => {
                p.settle(result.clone());
            }
        }
    }
}

/// A call that has been issued and is waiting for its `return`.
pub struct PendingCall {
    pub async_id: u64,
    pub target: CallTarget,
    pub method_name: String,
    pub return_container: ContainerKind,
    /// Set once the request carrying the call has been handed to the transport
    pub request_index: Option<u64>,
    /// True if the call was deferred because a request was already in flight
    pub queued: bool,
    pub completion: Promise,
}

/// Registry of outstanding calls keyed by async id. Each call is removed
/// exactly once, by whichever outcome arrives first.
#[derive(Default)]
pub struct PendingCalls {
    next_async_id: u64,
    calls: AHashMap<u64, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_async_id(&mut self) -> u64 {
        self.next_async_id += 1;
        self.next_async_id
    }

    pub fn register(&mut self, call: PendingCall) {
        self.calls.insert(call.async_id, call);
    }

    pub fn get(&self, async_id: u64) -> Option<&PendingCall> {
        self.calls.get(&async_id)
    }

    pub fn contains(&self, async_id: u64) -> bool {
        self.calls.contains_key(&async_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn assign_request(&mut self, async_id: u64, request_index: u64) {
        if let Some(call) = self.calls.get_mut(&async_id) {
            call.request_index = Some(request_index);
        }
    }

    /// Removes the call for delivery. A second resolution for the same id
    /// finds nothing and is logged.
    pub fn take(&mut self, async_id: u64) -> Option<PendingCall> {
        let call = self.calls.remove(&async_id);
        if call.is_none() {
            warn!("No pending call for async id {}", async_id);
        }
        call
    }

    /// Calls that travelled with `request_index` and are still unresolved.
    pub fn take_for_request(&mut self, request_index: u64) -> Vec<PendingCall> {
        let ids: Vec<u64> = self
            .calls
            .values()
            .filter(|c| c.request_index == Some(request_index))
            .map(|c| c.async_id)
            .collect();
        let mut calls: Vec<PendingCall> = ids.into_iter().filter_map(|id| self.calls.remove(&id)).collect();
        calls.sort_by_key(|c| c.async_id);
        calls
    }
}
