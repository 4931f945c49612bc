use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::rc::{Rc, Weak};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Config(String),
    Dispatch(String),
    Subscribe(String),
    Unsubscribe(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Dispatch(msg) => write!(f, "dispatch error: {msg}"),
            Self::Subscribe(msg) => write!(f, "subscribe error: {msg}"),
            Self::Unsubscribe(msg) => write!(f, "unsubscribe error: {msg}"),
        }
    }
}

impl StdError for Error {}

#[derive(Debug)]
pub struct Event {
    event_type: String,
    default_prevented: Cell<bool>,
}

impl Event {
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            default_prevented: Cell::new(false),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn prevent_default(&self) {
        self.default_prevented.set(true);
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented.get()
    }
}

pub trait EventHandler {
    fn handle_event(&self, event: &Event);
}

// A callback is either a plain invocable or an object exposing `handle_event`.
// Equality for registry bookkeeping always follows the original handle's
// pointer identity, never the invocation entry point.
#[derive(Clone)]
pub enum Callback {
    Function(Rc<dyn Fn(&Event)>),
    Handler(Rc<dyn EventHandler>),
}

impl Callback {
    pub fn function(f: impl Fn(&Event) + 'static) -> Self {
        Self::Function(Rc::new(f))
    }

    pub fn handler(h: Rc<dyn EventHandler>) -> Self {
        Self::Handler(h)
    }

    pub fn invoke(&self, event: &Event) {
        match self {
            Self::Function(f) => f(event),
            Self::Handler(h) => h.handle_event(event),
        }
    }

    pub fn same_handle(&self, other: &Callback) -> bool {
        self.identity() == other.identity()
    }

    fn identity(&self) -> usize {
        match self {
            Self::Function(f) => Rc::as_ptr(f) as *const () as usize,
            Self::Handler(h) => Rc::as_ptr(h) as *const () as usize,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Function(_) => "function",
            Self::Handler(_) => "handler",
        };
        write!(f, "Callback({kind}@{:#x})", self.identity())
    }
}

struct SignalState {
    aborted: Cell<bool>,
    hooks: RefCell<Vec<Box<dyn FnOnce()>>>,
}

// Fire-once cancellation token. Abort hooks run synchronously, in
// registration order, and at most once.
#[derive(Clone)]
pub struct AbortSignal {
    state: Rc<SignalState>,
}

impl AbortSignal {
    pub fn aborted(&self) -> bool {
        self.state.aborted.get()
    }

    fn on_abort(&self, hook: Box<dyn FnOnce()>) {
        if self.aborted() {
            hook();
            return;
        }
        self.state.hooks.borrow_mut().push(hook);
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AbortSignal(aborted={})", self.aborted())
    }
}

pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                state: Rc::new(SignalState {
                    aborted: Cell::new(false),
                    hooks: RefCell::new(Vec::new()),
                }),
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self) {
        if self.signal.state.aborted.replace(true) {
            return;
        }
        // Release the borrow before running hooks: a hook may register
        // further listeners against the same signal's controller.
        let hooks = std::mem::take(&mut *self.signal.state.hooks.borrow_mut());
        for hook in hooks {
            hook();
        }
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddEventListenerOptions {
    pub capture: bool,
    pub once: bool,
    pub passive: Option<bool>,
    pub signal: Option<AbortSignal>,
}

// The three legal call shapes of the subscribe options argument: absent,
// boolean capture shorthand, or the full options struct.
#[derive(Debug, Clone, Default)]
pub enum ListenerOptions {
    #[default]
    Default,
    Capture(bool),
    Options(AddEventListenerOptions),
}

#[derive(Debug, Clone)]
struct NormalizedOptions {
    use_capture: bool,
    once: bool,
    passive: Option<bool>,
    signal: Option<AbortSignal>,
}

fn normalize_options(options: &ListenerOptions) -> NormalizedOptions {
    match options {
        ListenerOptions::Default => NormalizedOptions {
            use_capture: false,
            once: false,
            passive: None,
            signal: None,
        },
        ListenerOptions::Capture(capture) => NormalizedOptions {
            use_capture: *capture,
            once: false,
            passive: None,
            signal: None,
        },
        ListenerOptions::Options(opts) => NormalizedOptions {
            use_capture: opts.capture,
            once: opts.once,
            passive: opts.passive,
            signal: opts.signal.clone(),
        },
    }
}

// Unsubscribe only discriminates by the capture flag.
fn normalize_capture(options: &ListenerOptions) -> bool {
    match options {
        ListenerOptions::Default => false,
        ListenerOptions::Capture(capture) => *capture,
        ListenerOptions::Options(opts) => opts.capture,
    }
}

const SCROLL_BLOCKING_EVENT_TYPES: [&str; 4] = ["touchstart", "touchmove", "wheel", "mousewheel"];

// Certain high-frequency interaction listeners are passive by default when
// registered on a scroll root, so they cannot stall page scrolling. The check
// is structural: only targets exposing a scroll relation qualify.
fn default_passive_value(event_type: &str, target: &EventTarget) -> bool {
    SCROLL_BLOCKING_EVENT_TYPES.contains(&event_type) && target.scroll_relation().is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollRelation {
    GlobalScope,
    Document,
    RootElement,
    BodyElement,
}

struct NativeListener {
    callback: Callback,
    capture: bool,
}

struct TargetInner {
    relation: Option<ScrollRelation>,
    native: RefCell<HashMap<String, Vec<NativeListener>>>,
}

// The underlying subscribe/unsubscribe primitive: a target keeping its own
// listener list, with a flat single-target dispatch for driving tests.
#[derive(Clone)]
pub struct EventTarget {
    inner: Rc<TargetInner>,
}

impl EventTarget {
    pub fn new() -> Self {
        Self::with_relation(None)
    }

    pub fn global_scope() -> Self {
        Self::with_relation(Some(ScrollRelation::GlobalScope))
    }

    pub fn document() -> Self {
        Self::with_relation(Some(ScrollRelation::Document))
    }

    pub fn document_element() -> Self {
        Self::with_relation(Some(ScrollRelation::RootElement))
    }

    pub fn body_element() -> Self {
        Self::with_relation(Some(ScrollRelation::BodyElement))
    }

    fn with_relation(relation: Option<ScrollRelation>) -> Self {
        Self {
            inner: Rc::new(TargetInner {
                relation,
                native: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn scroll_relation(&self) -> Option<ScrollRelation> {
        self.inner.relation
    }

    fn id(&self) -> TargetId {
        TargetId(Rc::as_ptr(&self.inner) as usize)
    }

    fn downgrade(&self) -> Weak<TargetInner> {
        Rc::downgrade(&self.inner)
    }

    pub fn subscribe(
        &self,
        event_type: &str,
        callback: Option<&Callback>,
        options: &ListenerOptions,
    ) -> Result<()> {
        let Some(callback) = callback else {
            return Ok(());
        };
        let capture = normalize_capture(options);
        let mut native = self.inner.native.borrow_mut();
        let listeners = native.entry(event_type.to_string()).or_default();

        // Match browser semantics: dedupe only when the same callback handle
        // is re-registered for the same type/capture pair.
        if listeners
            .iter()
            .any(|listener| listener.capture == capture && listener.callback.same_handle(callback))
        {
            return Ok(());
        }

        listeners.push(NativeListener {
            callback: callback.clone(),
            capture,
        });
        Ok(())
    }

    pub fn unsubscribe(
        &self,
        event_type: &str,
        callback: Option<&Callback>,
        options: &ListenerOptions,
    ) -> Result<()> {
        let Some(callback) = callback else {
            return Ok(());
        };
        let capture = normalize_capture(options);
        let mut native = self.inner.native.borrow_mut();
        let Some(listeners) = native.get_mut(event_type) else {
            return Ok(());
        };

        if let Some(pos) = listeners
            .iter()
            .position(|listener| listener.capture == capture && listener.callback.same_handle(callback))
        {
            listeners.remove(pos);
            if listeners.is_empty() {
                native.remove(event_type);
            }
        }
        Ok(())
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.inner
            .native
            .borrow()
            .get(event_type)
            .map_or(0, Vec::len)
    }

    pub fn dispatch(&self, event_type: &str) -> Result<Event> {
        if event_type.is_empty() {
            return Err(Error::Dispatch(
                "dispatch requires non-empty event type".into(),
            ));
        }
        let event = Event::new(event_type);

        // Target phase: capture listeners first, then the rest, insertion
        // order within each group. The list is cloned up front so listeners
        // may subscribe or unsubscribe mid-dispatch.
        let snapshot: Vec<Callback> = {
            let native = self.inner.native.borrow();
            let Some(listeners) = native.get(event_type) else {
                return Ok(event);
            };
            listeners
                .iter()
                .filter(|listener| listener.capture)
                .chain(listeners.iter().filter(|listener| !listener.capture))
                .map(|listener| listener.callback.clone())
                .collect()
        };

        for callback in &snapshot {
            callback.invoke(&event);
        }
        Ok(event)
    }
}

impl Default for EventTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for EventTarget {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventTarget({:#x}, relation={:?})",
            self.id().0,
            self.inner.relation
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TargetId(usize);

// What the query surface reports per live subscription. `listener` is always
// the original caller-supplied handle, never an internal wrapper.
#[derive(Debug, Clone)]
pub struct EventListenerRecord {
    pub event_type: String,
    pub listener: Callback,
    pub use_capture: bool,
    pub passive: bool,
    pub once: bool,
}

#[derive(Clone)]
struct RegisteredListener {
    callback: Callback,
    delegate: Callback,
    use_capture: bool,
    passive: bool,
    once: bool,
    signal: Option<AbortSignal>,
}

impl RegisteredListener {
    fn matches(&self, callback: &Callback, use_capture: bool) -> bool {
        self.use_capture == use_capture && self.callback.same_handle(callback)
    }
}

struct TargetEntry {
    target: Weak<TargetInner>,
    listeners: HashMap<String, Vec<RegisteredListener>>,
}

// Shadow registry mirroring the primitive's bookkeeping. Entries hold weak
// target handles; the registry never keeps a target alive, and entries whose
// target dropped are swept on mutation.
#[derive(Default)]
struct ListenerRegistry {
    map: HashMap<TargetId, TargetEntry>,
}

impl ListenerRegistry {
    fn sweep(&mut self) {
        self.map.retain(|_, entry| entry.target.strong_count() > 0);
    }

    fn entry_for(&self, target: &EventTarget) -> Option<&TargetEntry> {
        self.map
            .get(&target.id())
            .filter(|entry| entry.target.strong_count() > 0)
    }

    fn find(
        &self,
        target: &EventTarget,
        event_type: &str,
        callback: &Callback,
        use_capture: bool,
    ) -> Option<&RegisteredListener> {
        self.entry_for(target)?
            .listeners
            .get(event_type)?
            .iter()
            .find(|listener| listener.matches(callback, use_capture))
    }

    fn find_delegate(
        &self,
        target: &EventTarget,
        event_type: &str,
        callback: &Callback,
        use_capture: bool,
    ) -> Option<Callback> {
        self.find(target, event_type, callback, use_capture)
            .map(|listener| listener.delegate.clone())
    }

    fn insert(&mut self, target: &EventTarget, event_type: &str, listener: RegisteredListener) {
        self.sweep();
        let already_present = self
            .entry_for(target)
            .and_then(|entry| entry.listeners.get(event_type))
            .is_some_and(|group| {
                group
                    .iter()
                    .any(|existing| existing.matches(&listener.callback, listener.use_capture))
            });
        if already_present {
            return;
        }
        self.map
            .entry(target.id())
            .or_insert_with(|| TargetEntry {
                target: target.downgrade(),
                listeners: HashMap::new(),
            })
            .listeners
            .entry(event_type.to_string())
            .or_default()
            .push(listener);
    }

    fn remove(
        &mut self,
        target: &EventTarget,
        event_type: &str,
        callback: &Callback,
        use_capture: bool,
    ) -> Option<RegisteredListener> {
        let id = target.id();
        let entry = self.map.get_mut(&id)?;
        if entry.target.strong_count() == 0 {
            return None;
        }
        let group = entry.listeners.get_mut(event_type)?;
        let pos = group
            .iter()
            .position(|listener| listener.matches(callback, use_capture))?;
        let removed = group.remove(pos);
        if group.is_empty() {
            entry.listeners.remove(event_type);
        }
        if entry.listeners.is_empty() {
            self.map.remove(&id);
        }
        Some(removed)
    }

    fn snapshot(&self, target: &EventTarget) -> HashMap<String, Vec<EventListenerRecord>> {
        let Some(entry) = self.entry_for(target) else {
            return HashMap::new();
        };
        let mut out = HashMap::new();
        for (event_type, group) in &entry.listeners {
            // A firing token removes its record synchronously; skip any
            // record whose token fired before the removal landed.
            let records: Vec<EventListenerRecord> = group
                .iter()
                .filter(|listener| listener.signal.as_ref().is_none_or(|signal| !signal.aborted()))
                .map(|listener| EventListenerRecord {
                    event_type: event_type.clone(),
                    listener: listener.callback.clone(),
                    use_capture: listener.use_capture,
                    passive: listener.passive,
                    once: listener.once,
                })
                .collect();
            if !records.is_empty() {
                out.insert(event_type.clone(), records);
            }
        }
        out
    }
}

pub type SubscribeFn = Rc<dyn Fn(&EventTarget, &str, Option<&Callback>, &ListenerOptions) -> Result<()>>;
pub type UnsubscribeFn =
    Rc<dyn Fn(&EventTarget, &str, Option<&Callback>, &ListenerOptions) -> Result<()>>;

#[derive(Default)]
pub struct SessionConfig {
    pub subscribe: Option<SubscribeFn>,
    pub unsubscribe: Option<UnsubscribeFn>,
}

struct SessionInner {
    registry: RefCell<ListenerRegistry>,
    subscribe: SubscribeFn,
    unsubscribe: UnsubscribeFn,
    trace: Cell<bool>,
    trace_logs: RefCell<Vec<String>>,
    trace_log_limit: Cell<usize>,
    trace_to_stderr: Cell<bool>,
}

impl SessionInner {
    fn trace_line(&self, line: String) {
        if !self.trace.get() {
            return;
        }
        if self.trace_to_stderr.get() {
            eprintln!("{line}");
        }
        let mut logs = self.trace_logs.borrow_mut();
        if logs.len() >= self.trace_log_limit.get() {
            logs.remove(0);
        }
        logs.push(line);
    }
}

// One interception session: the wrapped subscribe/unsubscribe entry points
// plus the shadow registry they feed. Sessions are explicit values, so
// independent sessions with independent registries can coexist.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

pub fn setup(config: SessionConfig) -> Session {
    let subscribe = config.subscribe.unwrap_or_else(|| {
        Rc::new(|target: &EventTarget, event_type: &str, callback, options| {
            target.subscribe(event_type, callback, options)
        })
    });
    let unsubscribe = config.unsubscribe.unwrap_or_else(|| {
        Rc::new(|target: &EventTarget, event_type: &str, callback, options| {
            target.unsubscribe(event_type, callback, options)
        })
    });
    Session {
        inner: Rc::new(SessionInner {
            registry: RefCell::new(ListenerRegistry::default()),
            subscribe,
            unsubscribe,
            trace: Cell::new(false),
            trace_logs: RefCell::new(Vec::new()),
            trace_log_limit: Cell::new(10_000),
            trace_to_stderr: Cell::new(true),
        }),
    }
}

impl Session {
    pub fn add_event_listener(
        &self,
        target: &EventTarget,
        event_type: &str,
        callback: Option<&Callback>,
        options: &ListenerOptions,
    ) -> Result<()> {
        let inner = &self.inner;
        let Some(callback) = callback else {
            return (inner.subscribe)(target, event_type, None, options);
        };

        let normalized = normalize_options(options);

        // A token that already fired makes the whole subscription a no-op:
        // no registry record, no forward to the primitive.
        if normalized.signal.as_ref().is_some_and(AbortSignal::aborted) {
            return Ok(());
        }

        let passive = normalized
            .passive
            .unwrap_or_else(|| default_passive_value(event_type, target));

        let registry = inner.registry.borrow();
        let existing =
            registry.find_delegate(target, event_type, callback, normalized.use_capture);
        drop(registry);

        // A matching record already exists: the new subscription is dropped,
        // but the call is still forwarded, with the registered delegate so
        // the primitive's own no-duplicate rule sees an identical handle.
        if let Some(existing) = existing {
            inner.trace_line(format!(
                "[listener] dedup type={event_type} capture={}",
                normalized.use_capture
            ));
            return (inner.subscribe)(target, event_type, Some(&existing), options);
        }

        let delegate = if normalized.once {
            self.once_wrapper(target, event_type, callback, normalized.use_capture)
        } else {
            callback.clone()
        };

        inner.registry.borrow_mut().insert(
            target,
            event_type,
            RegisteredListener {
                callback: callback.clone(),
                delegate: delegate.clone(),
                use_capture: normalized.use_capture,
                passive,
                once: normalized.once,
                signal: normalized.signal.clone(),
            },
        );
        inner.trace_line(format!(
            "[listener] add type={event_type} capture={} passive={passive} once={} signal={}",
            normalized.use_capture,
            normalized.once,
            normalized.signal.is_some()
        ));

        if let Some(signal) = &normalized.signal {
            self.abort_hook(signal, target, event_type, callback, normalized.use_capture);
        }

        (inner.subscribe)(target, event_type, Some(&delegate), options)
    }

    pub fn remove_event_listener(
        &self,
        target: &EventTarget,
        event_type: &str,
        callback: Option<&Callback>,
        options: &ListenerOptions,
    ) -> Result<()> {
        let inner = &self.inner;
        let Some(callback) = callback else {
            return (inner.unsubscribe)(target, event_type, None, options);
        };

        let use_capture = normalize_capture(options);
        let removed = inner
            .registry
            .borrow_mut()
            .remove(target, event_type, callback, use_capture);

        match removed {
            // Forward the delegate that was actually registered, so the
            // primitive's bookkeeping clears the same handle it stored.
            Some(record) => {
                inner.trace_line(format!(
                    "[listener] remove type={event_type} capture={use_capture}"
                ));
                (inner.unsubscribe)(target, event_type, Some(&record.delegate), options)
            }
            // Unknown to the registry: still forwarded, unchanged.
            None => (inner.unsubscribe)(target, event_type, Some(callback), options),
        }
    }

    pub fn get_event_listeners(
        &self,
        target: &EventTarget,
    ) -> HashMap<String, Vec<EventListenerRecord>> {
        self.inner.registry.borrow().snapshot(target)
    }

    // One-shot adapter: unregisters this exact record before invoking the
    // original callback, so a query made from inside the callback already
    // sees the record gone.
    fn once_wrapper(
        &self,
        target: &EventTarget,
        event_type: &str,
        callback: &Callback,
        use_capture: bool,
    ) -> Callback {
        let session = Rc::downgrade(&self.inner);
        let weak_target = target.downgrade();
        let original = callback.clone();
        let event_type = event_type.to_string();
        Callback::Function(Rc::new(move |event: &Event| {
            if let (Some(inner), Some(target_inner)) = (session.upgrade(), weak_target.upgrade()) {
                let session = Session { inner };
                let target = EventTarget {
                    inner: target_inner,
                };
                session
                    .inner
                    .trace_line(format!("[listener] once_fired type={event_type}"));
                let _ = session.remove_event_listener(
                    &target,
                    &event_type,
                    Some(&original),
                    &ListenerOptions::Capture(use_capture),
                );
            }
            original.invoke(event);
        }))
    }

    fn abort_hook(
        &self,
        signal: &AbortSignal,
        target: &EventTarget,
        event_type: &str,
        callback: &Callback,
        use_capture: bool,
    ) {
        let session = Rc::downgrade(&self.inner);
        let weak_target = target.downgrade();
        let callback = callback.clone();
        let event_type = event_type.to_string();
        signal.on_abort(Box::new(move || {
            let (Some(inner), Some(target_inner)) = (session.upgrade(), weak_target.upgrade())
            else {
                return;
            };
            let session = Session { inner };
            let target = EventTarget {
                inner: target_inner,
            };
            // The key may have been vacated and reused by a later subscription
            // tied to a different token (or none). Only the record whose own
            // token fired may be removed here.
            let token_fired = session
                .inner
                .registry
                .borrow()
                .find(&target, &event_type, &callback, use_capture)
                .is_some_and(|record| {
                    record
                        .signal
                        .as_ref()
                        .is_some_and(|signal| signal.aborted())
                });
            if !token_fired {
                return;
            }
            session
                .inner
                .trace_line(format!("[listener] abort type={event_type}"));
            let _ = session.remove_event_listener(
                &target,
                &event_type,
                Some(&callback),
                &ListenerOptions::Capture(use_capture),
            );
        }));
    }

    pub fn enable_trace(&self, enabled: bool) {
        self.inner.trace.set(enabled);
    }

    pub fn set_trace_stderr(&self, enabled: bool) {
        self.inner.trace_to_stderr.set(enabled);
    }

    pub fn set_trace_log_limit(&self, max_entries: usize) -> Result<()> {
        if max_entries == 0 {
            return Err(Error::Config(
                "set_trace_log_limit requires at least 1 entry".into(),
            ));
        }
        self.inner.trace_log_limit.set(max_entries);
        let mut logs = self.inner.trace_logs.borrow_mut();
        while logs.len() > max_entries {
            logs.remove(0);
        }
        Ok(())
    }

    pub fn take_trace_logs(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.trace_logs.borrow_mut())
    }
}
