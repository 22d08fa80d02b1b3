//! The in-memory SCXML model and the interpreter core: the microstep/macrostep engine,
//! the parallel-region orchestrator, the history mechanism, and the event queue/raiser.
//! See W3C SCXML 1.0, Appendix D ("Algorithm for SCXML Interpretation"), whose function
//! names this module mirrors closely.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

#[cfg(feature = "Debug")]
use crate::common::debug;
use crate::common::info;
use crate::datamodel::{
    ChildSessionHandle, Data, Datamodel, GlobalData, SessionExecutor, SCXML_INVOKE_TYPE,
    SCXML_INVOKE_TYPE_SHORT,
};
use crate::executable_content::ExecutableContent;
use crate::tracer::Tracer;

pub type StateId = u32;
pub type TransitionId = u32;
pub type ExecutableContentId = u32;
pub type SessionId = u32;

/// Reserved id of the (always present) empty executable-content block.
pub const EMPTY_CONTENT: ExecutableContentId = 0;

pub const EVENT_DONE_INVOKE_PREFIX: &str = "done.invoke.";
pub const EVENT_DONE_STATE_PREFIX: &str = "done.state.";
pub const EVENT_ERROR_EXECUTION: &str = "error.execution";
pub const EVENT_ERROR_COMMUNICATION: &str = "error.communication";
pub const EVENT_ERROR_PLATFORM: &str = "error.platform";
/// Implementation-internal shutdown signal, delivered through the external queue like
/// any other event, used by [`FsmExecutor::shutdown`](crate::fsm_executor::FsmExecutor::shutdown)
/// to stop a session's thread without waiting for the document's own final state.
pub const EVENT_CANCEL_SESSION: &str = "cancel.session";

/// Returns true if `descriptor` matches `event_name` under SCXML's token-prefix rule:
/// `a.b` matches `a`, `a.*`, and `*`.
pub fn event_name_matches(descriptor: &str, event_name: &str) -> bool {
    if descriptor == "*" {
        return true;
    }
    let mut d_tokens: Vec<&str> = descriptor.split('.').collect();
    if d_tokens.last() == Some(&"*") {
        d_tokens.pop();
    }
    if d_tokens.is_empty() {
        return true;
    }
    let e_tokens: Vec<&str> = event_name.split('.').collect();
    if d_tokens.len() > e_tokens.len() {
        return false;
    }
    d_tokens.iter().zip(e_tokens.iter()).all(|(a, b)| a == b)
}

pub fn vec_to_string<T: Display>(v: &[T]) -> String {
    v.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",")
}

/// A set that preserves insertion order and rejects duplicates. Mirrors the `OrderedSet`
/// used throughout the W3C pseudocode.
#[derive(Debug, Clone, Default)]
pub struct OrderedSet<T: PartialEq + Clone> {
    pub data: Vec<T>,
}

impl<T: PartialEq + Clone> OrderedSet<T> {
    pub fn new() -> Self {
        OrderedSet { data: Vec::new() }
    }

    pub fn add(&mut self, item: T) {
        if !self.data.contains(&item) {
            self.data.push(item);
        }
    }

    pub fn delete(&mut self, item: &T) {
        self.data.retain(|e| e != item);
    }

    pub fn union(&mut self, other: &OrderedSet<T>) {
        for item in &other.data {
            self.add(item.clone());
        }
    }

    pub fn is_member(&self, item: &T) -> bool {
        self.data.contains(item)
    }

    pub fn some_member<F: Fn(&T) -> bool>(&self, f: F) -> bool {
        self.data.iter().any(|e| f(e))
    }

    pub fn every_member<F: Fn(&T) -> bool>(&self, f: F) -> bool {
        self.data.iter().all(|e| f(e))
    }

    pub fn has_intersection(&self, other: &OrderedSet<T>) -> bool {
        self.data.iter().any(|e| other.is_member(e))
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn to_list(&self) -> List<T> {
        List {
            data: self.data.clone(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<T> {
        self.data.iter()
    }
}

/// A plain ordered sequence, used where the pseudocode sorts an `OrderedSet` into a
/// `List` by entry/exit/document order.
#[derive(Debug, Clone, Default)]
pub struct List<T: Clone> {
    pub data: Vec<T>,
}

impl<T: Clone> List<T> {
    pub fn sort_by<F: FnMut(&T, &T) -> std::cmp::Ordering>(&mut self, f: F) {
        self.data.sort_by(f);
    }

    pub fn iter(&self) -> std::slice::Iter<T> {
        self.data.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingType {
    Early,
    Late,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateType {
    Atomic,
    Compound,
    Parallel,
    Final,
    History { deep: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionType {
    External,
    Internal,
}

#[derive(Debug, Clone)]
pub struct DataItem {
    pub id: String,
    /// Initializer expression (`expr=`, inline content, or `src=`). `None` for data
    /// items with no initializer (bound to `undefined`/`null`).
    pub expr: Option<String>,
}

#[derive(Debug, Clone)]
pub enum DoneDataSource {
    /// `<content>` body, a literal or an expression to be evaluated.
    Content(String),
    /// Ordered `(name, expr-or-location)` pairs from `<param>`.
    Params(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct DoneData {
    pub source: DoneDataSource,
}

#[derive(Debug, Clone)]
pub struct Invoke {
    /// Effective invoke id. Autogenerated (`<state-id>.<n>`) if not given in the document.
    pub invoke_id: String,
    pub id_location: Option<String>,
    pub type_name: Option<String>,
    pub type_expr: Option<String>,
    pub src: Option<String>,
    pub src_expr: Option<String>,
    pub autoforward: bool,
    pub namelist: Vec<String>,
    pub params: Vec<(String, String)>,
    /// Inline `<content>` used as the child's document when no `src`/`srcexpr` is given.
    pub content: Option<String>,
    pub finalize: ExecutableContentId,
}

#[derive(Debug, Clone)]
pub struct State {
    pub id: StateId,
    pub name: String,
    pub state_type: StateType,
    pub parent: Option<StateId>,
    /// Document-order children (regions, for `parallel`; sub-states, for `compound`).
    pub children: Vec<StateId>,
    /// `<initial>` transition of a compound state (never fires from outside entry).
    pub initial: Option<TransitionId>,
    /// Default-target transition of a `history` pseudo-state.
    pub history_default: Option<TransitionId>,
    pub transitions: Vec<TransitionId>,
    pub onentry: Vec<ExecutableContentId>,
    pub onexit: Vec<ExecutableContentId>,
    pub invokes: Vec<Invoke>,
    pub data_items: Vec<DataItem>,
    pub donedata: Option<DoneData>,
    pub is_first_entry: bool,
}

impl State {
    pub fn is_atomic(&self) -> bool {
        matches!(self.state_type, StateType::Atomic | StateType::Final)
    }
    pub fn is_compound(&self) -> bool {
        matches!(self.state_type, StateType::Compound)
    }
    pub fn is_parallel(&self) -> bool {
        matches!(self.state_type, StateType::Parallel)
    }
    pub fn is_final(&self) -> bool {
        matches!(self.state_type, StateType::Final)
    }
    pub fn is_history(&self) -> bool {
        matches!(self.state_type, StateType::History { .. })
    }
    pub fn history_is_deep(&self) -> bool {
        matches!(self.state_type, StateType::History { deep: true })
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub id: TransitionId,
    pub source: StateId,
    pub events: Vec<String>,
    pub cond: Option<String>,
    pub target: Vec<StateId>,
    pub transition_type: TransitionType,
    pub content: ExecutableContentId,
}

impl Transition {
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }
    pub fn is_targetless(&self) -> bool {
        self.target.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum EventType {
    Platform,
    Internal,
    External,
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Platform => write!(f, "platform"),
            EventType::Internal => write!(f, "internal"),
            EventType::External => write!(f, "external"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamPair {
    pub name: String,
    pub value: Data,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub etype: EventType,
    pub sendid: Option<String>,
    pub origin: Option<String>,
    pub origin_type: Option<String>,
    pub invoke_id: Option<String>,
    pub param_values: Option<Vec<ParamPair>>,
    pub content: Option<Data>,
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.etype)
    }
}

impl Event {
    pub fn new(name: &str, etype: EventType) -> Event {
        Event {
            name: name.to_string(),
            etype,
            sendid: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
            param_values: None,
            content: None,
        }
    }

    pub fn new_simple(name: &str) -> Event {
        Event::new(name, EventType::Platform)
    }

    pub fn new_internal(name: &str) -> Event {
        Event::new(name, EventType::Internal)
    }

    pub fn new_external() -> Event {
        Event::new("", EventType::External)
    }

    pub fn done_state(state_name: &str, donedata: Option<Data>) -> Event {
        let mut e = Event::new_internal(&format!("{}{}", EVENT_DONE_STATE_PREFIX, state_name));
        e.content = donedata;
        e
    }

    pub fn done_invoke(invoke_id: &str, donedata: Option<Data>) -> Event {
        let mut e = Event::new_internal(&format!("{}{}", EVENT_DONE_INVOKE_PREFIX, invoke_id));
        e.invoke_id = Some(invoke_id.to_string());
        e.content = donedata;
        e
    }

    pub fn error_execution(sendid: &Option<String>, invoke_id: &Option<String>) -> Event {
        let mut e = Event::new_internal(EVENT_ERROR_EXECUTION);
        e.sendid.clone_from(sendid);
        e.invoke_id.clone_from(invoke_id);
        e
    }

    pub fn error_communication(origin_event: &Event) -> Event {
        let mut e = Event::new_internal(EVENT_ERROR_COMMUNICATION);
        e.sendid.clone_from(&origin_event.sendid);
        e.invoke_id.clone_from(&origin_event.invoke_id);
        e
    }

    pub fn error_platform(message: &str) -> Event {
        let mut e = Event::new_internal(EVENT_ERROR_PLATFORM);
        e.content = Some(Data::Error(message.to_string()));
        e
    }

    pub fn get_copy(&self) -> Box<Event> {
        Box::new(self.clone())
    }
}

struct DeferredInvoke {
    state_id: StateId,
    invoke: Invoke,
}

struct RunningInvoke {
    state_id: StateId,
    child_session_id: SessionId,
    sender: Sender<Box<Event>>,
}

/// An in-memory SCXML document plus the runtime state of one running session: the
/// active configuration, history records, the event queues, and the scripting session.
/// Owned exclusively by the session's own OS thread (see SPEC_FULL §5); other threads
/// reach into it only through [`crate::datamodel::GlobalData`].
pub struct Fsm {
    pub name: String,
    pub datamodel_name: String,
    pub binding: BindingType,
    pub root: StateId,
    pub states: HashMap<StateId, State>,
    pub states_names: HashMap<String, StateId>,
    pub transitions: HashMap<TransitionId, Transition>,
    pub executable_content: HashMap<ExecutableContentId, Vec<Box<dyn ExecutableContent>>>,
    pub script: Vec<ExecutableContentId>,

    pub session_id: SessionId,
    pub configuration: OrderedSet<StateId>,
    pub states_to_invoke: OrderedSet<StateId>,
    pub history_value: HashMap<StateId, OrderedSet<StateId>>,
    pub running: bool,
    parallel_done_raised: HashSet<StateId>,
    deferred_invokes: Vec<DeferredInvoke>,
    running_invokes: HashMap<String, RunningInvoke>,
    internal_receiver: Receiver<Box<Event>>,
    external_receiver: Receiver<Box<Event>>,
    pub external_sender: Sender<Box<Event>>,
    /// `None` only transiently, while [`Fsm::with_dm`] holds it out of the struct to
    /// call a method that itself needs `&Fsm` (avoiding aliasing `self`).
    datamodel: Option<Box<dyn Datamodel>>,
    pub tracer: Arc<Mutex<Box<dyn Tracer>>>,
    pub include_paths: Vec<PathBuf>,
}

/// The document-shaped, immutable-after-parse part of an [`Fsm`]. Produced by the
/// SCXML reader (or handcrafted by tests); turned into a runnable [`Fsm`] by
/// [`Fsm::from_model`].
pub struct FsmModel {
    pub name: String,
    pub datamodel_name: String,
    pub binding: BindingType,
    pub root: StateId,
    pub states: HashMap<StateId, State>,
    pub states_names: HashMap<String, StateId>,
    pub transitions: HashMap<TransitionId, Transition>,
    pub executable_content: HashMap<ExecutableContentId, Vec<Box<dyn ExecutableContent>>>,
    pub script: Vec<ExecutableContentId>,
}

impl FsmModel {
    pub fn new(root: StateId) -> FsmModel {
        let mut executable_content = HashMap::new();
        executable_content.insert(EMPTY_CONTENT, Vec::new());
        FsmModel {
            name: String::new(),
            datamodel_name: "ecmascript".to_string(),
            binding: BindingType::Early,
            root,
            states: HashMap::new(),
            states_names: HashMap::new(),
            transitions: HashMap::new(),
            executable_content,
            script: Vec::new(),
        }
    }
}

impl Fsm {
    /// Assembles a runnable session from a parsed model: allocates the internal and
    /// external queues, builds `GlobalData`, and constructs the scripting session.
    pub fn from_model(
        model: FsmModel,
        session_id: SessionId,
        source: Option<String>,
        tracer: Arc<Mutex<Box<dyn Tracer>>>,
        include_paths: Vec<PathBuf>,
    ) -> Box<Fsm> {
        let (internal_sender, internal_receiver) = channel::<Box<Event>>();
        let (external_sender, external_receiver) = channel::<Box<Event>>();

        let global = Arc::new(Mutex::new(GlobalData::new(
            session_id,
            model.name.clone(),
            internal_sender,
            external_sender.clone(),
            tracer.clone(),
        )));
        global.lock().unwrap().source = source;

        let datamodel: Box<dyn Datamodel> = crate::datamodel::ecma_script::ECMAScriptDatamodel::new(global);

        Box::new(Fsm {
            name: model.name,
            datamodel_name: model.datamodel_name,
            binding: model.binding,
            root: model.root,
            states: model.states,
            states_names: model.states_names,
            transitions: model.transitions,
            executable_content: model.executable_content,
            script: model.script,
            session_id,
            configuration: OrderedSet::new(),
            states_to_invoke: OrderedSet::new(),
            history_value: HashMap::new(),
            running: true,
            parallel_done_raised: HashSet::new(),
            deferred_invokes: Vec::new(),
            running_invokes: HashMap::new(),
            internal_receiver,
            external_receiver,
            external_sender,
            datamodel: Some(datamodel),
            tracer,
            include_paths,
        })
    }

    pub fn external_sender(&self) -> Sender<Box<Event>> {
        self.external_sender.clone()
    }

    /// Runs `f` with the scripting session and a read-only view of the rest of the
    /// `Fsm` simultaneously. Needed because every `Datamodel` method that evaluates a
    /// script also needs to read the model/configuration it runs against; taking
    /// `datamodel` out of the struct for the duration of the call sidesteps the
    /// aliasing that `fn(&mut self.datamodel, &self)` would otherwise require.
    fn with_dm<R>(&mut self, f: impl FnOnce(&mut dyn Datamodel, &Fsm) -> R) -> R {
        let mut dm = self.datamodel.take().expect("datamodel not reentrant");
        let r = f(dm.as_mut(), self);
        self.datamodel = Some(dm);
        r
    }

    /// Read-only access to the scripting session, for calls that need neither `&Fsm`
    /// nor `&mut self` (e.g. `global()`).
    fn dm(&self) -> &dyn Datamodel {
        self.datamodel.as_deref().expect("datamodel not reentrant")
    }

    /// Mutable access to the scripting session for calls that don't need `&Fsm`
    /// (e.g. `set`, `log`, `get_by_location`, `internal_error_execution`).
    fn dm_mut(&mut self) -> &mut dyn Datamodel {
        self.datamodel.as_deref_mut().expect("datamodel not reentrant")
    }

    /// As [`Fsm::with_dm`], but for the one `Datamodel` method (`initialize_data_model`)
    /// that needs a mutable view of the rest of the `Fsm`.
    fn with_dm_mut<R>(&mut self, f: impl FnOnce(&mut dyn Datamodel, &mut Fsm) -> R) -> R {
        let mut dm = self.datamodel.take().expect("datamodel not reentrant");
        let r = f(dm.as_mut(), self);
        self.datamodel = Some(dm);
        r
    }

    pub fn get_state(&self, id: StateId) -> &State {
        self.states.get(&id).expect("dangling StateId")
    }

    pub fn get_transition(&self, id: TransitionId) -> &Transition {
        self.transitions.get(&id).expect("dangling TransitionId")
    }

    pub fn is_in_final(&self, id: StateId) -> bool {
        self.configuration.is_member(&id) && self.get_state(id).is_final()
    }

    // ---- model graph queries -------------------------------------------------

    pub fn is_descendant(&self, s1: StateId, s2: StateId) -> bool {
        let mut cur = self.get_state(s1).parent;
        while let Some(p) = cur {
            if p == s2 {
                return true;
            }
            cur = self.get_state(p).parent;
        }
        false
    }

    pub fn get_proper_ancestors(&self, state: StateId, stop_at: Option<StateId>) -> Vec<StateId> {
        let mut result = Vec::new();
        let mut cur = self.get_state(state).parent;
        while let Some(p) = cur {
            if Some(p) == stop_at {
                break;
            }
            result.push(p);
            cur = self.get_state(p).parent;
        }
        result
    }

    pub fn get_child_states(&self, state: StateId) -> Vec<StateId> {
        self.get_state(state).children.clone()
    }

    /// Document order: (depth, index-path) — approximated here by a DFS pre-order
    /// index computed on demand, which is stable because the model is immutable.
    fn document_order_index(&self, id: StateId) -> Vec<u32> {
        let mut path = Vec::new();
        let mut cur = id;
        loop {
            let parent = self.get_state(cur).parent;
            match parent {
                None => {
                    path.push(0);
                    break;
                }
                Some(p) => {
                    let idx = self
                        .get_state(p)
                        .children
                        .iter()
                        .position(|c| *c == cur)
                        .unwrap_or(0) as u32;
                    path.push(idx);
                    cur = p;
                }
            }
        }
        path.reverse();
        path
    }

    pub fn document_order_cmp(&self, a: StateId, b: StateId) -> std::cmp::Ordering {
        self.document_order_index(a).cmp(&self.document_order_index(b))
    }

    pub fn entry_order_cmp(&self, a: StateId, b: StateId) -> std::cmp::Ordering {
        self.document_order_cmp(a, b)
    }

    pub fn exit_order_cmp(&self, a: StateId, b: StateId) -> std::cmp::Ordering {
        self.document_order_cmp(b, a)
    }

    /// Least Common Compound Ancestor of a transition: the closest proper ancestor of
    /// the source that is a compound or `<scxml>` state and a proper ancestor of every
    /// transition target.
    pub fn find_lcca(&self, transition: &Transition) -> StateId {
        let mut anc_of_source = self.get_proper_ancestors(transition.source, None);
        anc_of_source.insert(0, transition.source);
        for anc in anc_of_source {
            if anc != transition.source && !self.get_state(anc).is_compound() {
                continue;
            }
            if transition
                .target
                .iter()
                .all(|t| self.is_descendant(*t, anc) || *t == anc)
            {
                if transition.target.iter().all(|t| *t != anc) {
                    return anc;
                }
            }
        }
        self.root
    }

    pub fn get_transition_domain(&self, transition: &Transition) -> Option<StateId> {
        let tstates = self.get_effective_target_states(transition);
        if tstates.is_empty() {
            return None;
        }
        if transition.transition_type == TransitionType::Internal
            && self.get_state(transition.source).is_compound()
            && tstates.iter().all(|t| self.is_descendant(*t, transition.source))
        {
            return Some(transition.source);
        }
        Some(self.find_lcca(transition))
    }

    /// Resolves history pseudo-state targets to their recorded (or default) set.
    pub fn get_effective_target_states(&self, transition: &Transition) -> OrderedSet<StateId> {
        let mut targets = OrderedSet::new();
        for t in &transition.target {
            let state = self.get_state(*t);
            if state.is_history() {
                match self.history_value.get(t) {
                    Some(recorded) if !recorded.is_empty() => {
                        targets.union(recorded);
                    }
                    _ => match state.history_default {
                        Some(default_tid) => {
                            let default_t = self.get_transition(default_tid);
                            targets.union(&self.get_effective_target_states(default_t));
                        }
                        None => {
                            if let Some(parent) = state.parent {
                                if let Some(init_tid) = self.get_state(parent).initial {
                                    let init_t = self.get_transition(init_tid);
                                    targets.union(&self.get_effective_target_states(init_t));
                                }
                            }
                        }
                    },
                }
            } else {
                targets.add(*t);
            }
        }
        targets
    }

    // ---- start / run ----------------------------------------------------------

    /// §4.1 `start`: initializes the data model, runs document-level scripts, enters
    /// the initial configuration, and runs one macrostep.
    pub fn start(&mut self) {
        self.with_dm(|dm, fsm| dm.setup_system_variables(fsm, &HashMap::new()));

        if self.binding == BindingType::Early {
            let ids: Vec<StateId> = self.states.keys().copied().collect();
            let mut ordered = ids;
            ordered.sort_by(|a, b| self.document_order_cmp(*a, *b));
            for id in ordered {
                self.with_dm_mut(|dm, fsm| dm.initialize_data_model(fsm, id));
            }
        } else {
            let root = self.root;
            self.with_dm_mut(|dm, fsm| dm.initialize_data_model(fsm, root));
            self.mark_first_entry_done(root);
        }

        let scripts = self.script.clone();
        for content_id in scripts {
            self.with_dm(|dm, fsm| dm.execute_content(fsm, content_id));
        }

        let root_transition = Transition {
            id: u32::MAX,
            source: self.root,
            events: Vec::new(),
            cond: None,
            target: Vec::new(),
            transition_type: TransitionType::External,
            content: EMPTY_CONTENT,
        };
        let mut synthetic = self.transitions.clone();
        synthetic.insert(u32::MAX, root_transition.clone());
        let saved = std::mem::replace(&mut self.transitions, synthetic);
        self.enter_states(&[root_transition]);
        self.transitions = saved;

        self.main_event_loop();
    }

    fn mark_first_entry_done(&mut self, id: StateId) {
        if let Some(s) = self.states.get_mut(&id) {
            s.is_first_entry = false;
        }
    }

    /// Delivers one external event and runs a macrostep. Blocks on the external queue
    /// internally via [`Fsm::main_event_loop`] when called through [`Fsm::run`]; exposed
    /// separately so tests and embedders can drive single events synchronously.
    pub fn process_event(&mut self, event: Event) {
        if event.etype == EventType::External {
            self.run_macrostep(Some(event));
        } else {
            self.internal_receiver_push_front(event);
            self.run_macrostep(None);
        }
    }

    fn internal_receiver_push_front(&self, event: Event) {
        self.dm().global().lock().unwrap().enqueue_internal(event);
    }

    /// Runs the session until it completes (`running` becomes false) or is cancelled,
    /// blocking on the external queue between macrosteps. This is what the session's
    /// dedicated OS thread executes.
    pub fn run(&mut self) {
        self.start();
        while self.running {
            match self.external_receiver.recv() {
                Ok(boxed_event) => {
                    let event = *boxed_event;
                    if event.name == EVENT_CANCEL_SESSION {
                        self.running = false;
                        break;
                    }
                    self.run_macrostep(Some(event));
                }
                Err(_) => {
                    self.running = false;
                }
            }
        }
        self.finalize_session();
    }

    fn main_event_loop(&mut self) {
        // `start()` already ran the initial macrostep via `enter_states`/microsteps;
        // nothing further to do here — `run()` drives subsequent external events.
    }

    fn finalize_session(&mut self) {
        let names: Vec<String> = self
            .configuration
            .iter()
            .map(|id| self.get_state(*id).name.clone())
            .collect();
        let mut global = self.dm().global().lock().unwrap();
        global.final_configuration = Some(names);
        for (sendid, handle) in global.delayed_send.drain() {
            let _ = handle.cancel.send(());
            #[cfg(feature = "Debug")]
            debug!("Cancelled pending send {} on session shutdown", sendid);
        }
        info!("Session #{} finished", self.session_id);
    }

    /// One macrostep: drain the async internal-event channel, run microsteps for the
    /// (optional) external event and then for eventless/internal transitions until
    /// quiescent, execute deferred invokes, and check for completion.
    fn run_macrostep(&mut self, external_event: Option<Event>) {
        if let Some(event) = external_event {
            self.drain_async_internal();
            self.dm_mut().set_event(&event);
            #[cfg(feature = "Trace_Event")]
            self.tracer
                .lock()
                .unwrap()
                .event_external_received(self.session_id, &event);
            self.run_one_microstep_round(Some(&event));
        }

        loop {
            self.drain_async_internal();
            if let Some(event) = self.next_queued_internal() {
                self.dm_mut().set_event(&event);
                #[cfg(feature = "Trace_Event")]
                self.tracer
                    .lock()
                    .unwrap()
                    .event_internal_received(self.session_id, &event);
                self.run_one_microstep_round(Some(&event));
                continue;
            }
            if !self.run_one_microstep_round(None) {
                break;
            }
        }

        self.execute_deferred_invokes();
        self.check_completion();
    }

    fn drain_async_internal(&self) {
        // The channel itself is the queue; nothing to copy. Present for readability
        // at call sites that mirror the pseudocode's "drain to internal queue" step.
    }

    fn next_queued_internal(&mut self) -> Option<Event> {
        match self.internal_receiver.try_recv() {
            Ok(boxed) => Some(*boxed),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Runs eventless transitions (if `event` is `None`) or transitions matching
    /// `event`, once. Returns `true` if any transition fired (so the caller should
    /// keep looping).
    fn run_one_microstep_round(&mut self, event: Option<&Event>) -> bool {
        let enabled = match event {
            None => self.select_eventless_transitions(),
            Some(e) => self.select_transitions(e),
        };
        if enabled.is_empty() {
            return false;
        }
        self.microstep(&enabled);
        true
    }

    // ---- transition selection ---------------------------------------------------

    fn select_eventless_transitions(&mut self) -> Vec<Transition> {
        let mut atomic_states: Vec<StateId> = self
            .configuration
            .iter()
            .filter(|id| self.get_state(**id).is_atomic())
            .copied()
            .collect();
        atomic_states.sort_by(|a, b| self.document_order_cmp(*a, *b));

        let mut enabled_transitions: Vec<Transition> = Vec::new();
        for state_id in atomic_states {
            if enabled_transitions
                .iter()
                .any(|t| self.is_descendant(state_id, t.source) || t.source == state_id)
            {
                continue;
            }
            'ancestor: for anc in self.self_and_ancestors(state_id) {
                for tid in self.get_state(anc).transitions.clone() {
                    let t = self.get_transition(tid).clone();
                    if t.is_eventless() && self.condition_true(&t) {
                        enabled_transitions.push(t);
                        break 'ancestor;
                    }
                }
            }
        }
        self.remove_conflicting_transitions(enabled_transitions)
    }

    fn select_transitions(&mut self, event: &Event) -> Vec<Transition> {
        let mut atomic_states: Vec<StateId> = self
            .configuration
            .iter()
            .filter(|id| self.get_state(**id).is_atomic())
            .copied()
            .collect();
        atomic_states.sort_by(|a, b| self.document_order_cmp(*a, *b));

        let mut enabled_transitions: Vec<Transition> = Vec::new();
        for state_id in atomic_states {
            if enabled_transitions
                .iter()
                .any(|t| self.is_descendant(state_id, t.source) || t.source == state_id)
            {
                continue;
            }
            'ancestor: for anc in self.self_and_ancestors(state_id) {
                for tid in self.get_state(anc).transitions.clone() {
                    let t = self.get_transition(tid).clone();
                    if !t.is_eventless()
                        && t.events.iter().any(|d| event_name_matches(d, &event.name))
                        && self.condition_true(&t)
                    {
                        enabled_transitions.push(t);
                        break 'ancestor;
                    }
                }
            }
        }
        self.remove_conflicting_transitions(enabled_transitions)
    }

    fn self_and_ancestors(&self, state: StateId) -> Vec<StateId> {
        let mut v = vec![state];
        v.extend(self.get_proper_ancestors(state, None));
        v
    }

    /// Evaluates `t.cond` (truthy if absent). A thrown guard raises `error.execution`
    /// once per evaluation and counts as false, per the open-question resolution in
    /// SPEC_FULL.md §9.
    fn condition_true(&mut self, t: &Transition) -> bool {
        match &t.cond {
            None => true,
            Some(expr) => match self.with_dm(|dm, fsm| dm.execute_condition(fsm, expr)) {
                Ok(v) => v,
                Err(_) => {
                    self.dm()
                        .global()
                        .lock()
                        .unwrap()
                        .enqueue_internal(Event::error_execution(&None, &None));
                    false
                }
            },
        }
    }

    /// §4.1 step 2: document order wins within a state; deeper source wins between
    /// ancestor/descendant; non-conflicting transitions across parallel regions all fire.
    fn remove_conflicting_transitions(&self, enabled_transitions: Vec<Transition>) -> Vec<Transition> {
        let mut filtered_transitions: Vec<Transition> = Vec::new();
        for t1 in enabled_transitions {
            let mut t1_preempted = false;
            let mut transitions_to_remove: Vec<usize> = Vec::new();
            for (idx, t2) in filtered_transitions.iter().enumerate() {
                if self.compute_exit_set(std::slice::from_ref(&t1))
                    .has_intersection(&self.compute_exit_set(std::slice::from_ref(t2)))
                {
                    if self.is_descendant(t1.source, t2.source) {
                        transitions_to_remove.push(idx);
                    } else {
                        t1_preempted = true;
                        break;
                    }
                }
            }
            if !t1_preempted {
                for idx in transitions_to_remove.into_iter().rev() {
                    filtered_transitions.remove(idx);
                }
                filtered_transitions.push(t1);
            }
        }
        filtered_transitions
    }

    // ---- microstep --------------------------------------------------------------

    fn microstep(&mut self, enabled_transitions: &[Transition]) {
        self.exit_states(enabled_transitions);
        self.execute_transition_content(enabled_transitions);
        self.enter_states(enabled_transitions);
    }

    /// §4.1 step 3: every active proper descendant of each transition's LCCA, unless
    /// the transition is a "targetless-internal-to-compound-ancestor" no-op exit.
    fn compute_exit_set(&self, transitions: &[Transition]) -> OrderedSet<StateId> {
        let mut states_to_exit = OrderedSet::new();
        for t in transitions {
            if t.is_targetless() {
                continue;
            }
            let domain = self.get_transition_domain(t);
            if let Some(domain) = domain {
                for s in self.configuration.iter() {
                    if self.is_descendant(*s, domain) {
                        states_to_exit.add(*s);
                    }
                }
            }
        }
        states_to_exit
    }

    fn exit_states(&mut self, enabled_transitions: &[Transition]) {
        let states_to_exit = self.compute_exit_set(enabled_transitions);

        self.cancel_invokes_for_exit_set(&states_to_exit);

        let mut to_invoke_remaining = OrderedSet::new();
        for s in self.states_to_invoke.iter() {
            if !states_to_exit.is_member(s) {
                to_invoke_remaining.add(*s);
            }
        }
        self.states_to_invoke = to_invoke_remaining;

        let mut exit_list: List<StateId> = states_to_exit.to_list();
        exit_list.sort_by(|a, b| self.exit_order_cmp(*a, *b));

        for s in exit_list.iter() {
            self.record_history_if_needed(*s);
            let onexit = self.get_state(*s).onexit.clone();
            for content_id in onexit {
                self.with_dm(|dm, fsm| dm.execute_content(fsm, content_id));
            }
            let state_name = self.get_state(*s).name.clone();
            #[cfg(feature = "Trace_State")]
            self.tracer
                .lock()
                .unwrap()
                .trace_exit_state(self.session_id, self.get_state(*s));
            let _ = state_name;
            self.configuration.delete(s);
        }
    }

    fn record_history_if_needed(&mut self, exiting_state: StateId) {
        let children: Vec<StateId> = self
            .get_child_states(exiting_state)
            .into_iter()
            .filter(|c| self.get_state(*c).is_history())
            .collect();
        for history_id in children {
            let deep = self.get_state(history_id).history_is_deep();
            let recorded: OrderedSet<StateId> = if deep {
                let mut set = OrderedSet::new();
                for s in self.configuration.iter() {
                    if self.is_descendant(*s, exiting_state) && self.is_leaf_of(*s) {
                        set.add(*s);
                    }
                }
                set
            } else {
                let mut set = OrderedSet::new();
                for s in self.configuration.iter() {
                    if self.get_state(*s).parent == Some(exiting_state) {
                        set.add(*s);
                    }
                }
                set
            };
            self.history_value.insert(history_id, recorded);
        }
    }

    fn is_leaf_of(&self, state: StateId) -> bool {
        !self
            .get_child_states(state)
            .iter()
            .any(|c| self.configuration.is_member(c))
    }

    fn cancel_invokes_for_exit_set(&mut self, states_to_exit: &OrderedSet<StateId>) {
        self.deferred_invokes
            .retain(|di| !states_to_exit.is_member(&di.state_id));

        let to_cancel: Vec<String> = self
            .running_invokes
            .iter()
            .filter(|(_, ri)| states_to_exit.is_member(&ri.state_id))
            .map(|(id, _)| id.clone())
            .collect();
        for invoke_id in to_cancel {
            if let Some(ri) = self.running_invokes.remove(&invoke_id) {
                if let Some(executor) = &self.dm().global().lock().unwrap().executor {
                    executor.stop_session(ri.child_session_id);
                }
            }
            let mut global = self.dm().global().lock().unwrap();
            global.child_sessions.remove(&invoke_id);
            let scheduled: Vec<String> = global
                .delayed_send
                .keys()
                .filter(|sid| sid.starts_with(&format!("{}.", invoke_id)))
                .cloned()
                .collect();
            for sid in scheduled {
                if let Some(h) = global.delayed_send.remove(&sid) {
                    let _ = h.cancel.send(());
                }
            }
        }
    }

    fn execute_transition_content(&mut self, enabled_transitions: &[Transition]) {
        for t in enabled_transitions {
            let content = t.content;
            self.with_dm(|dm, fsm| dm.execute_content(fsm, content));
        }
    }

    fn enter_states(&mut self, enabled_transitions: &[Transition]) {
        let mut states_to_enter = OrderedSet::new();
        let mut states_for_default_entry = OrderedSet::new();
        let mut default_history_content: HashMap<StateId, ExecutableContentId> = HashMap::new();

        for t in enabled_transitions {
            for s in &t.target {
                self.add_descendant_states_to_enter(
                    *s,
                    &mut states_to_enter,
                    &mut states_for_default_entry,
                    &mut default_history_content,
                );
            }
            if let Some(ancestor) = self.get_transition_domain(t) {
                for s in self.get_effective_target_states(t).iter() {
                    self.add_ancestor_states_to_enter(
                        *s,
                        ancestor,
                        &mut states_to_enter,
                        &mut states_for_default_entry,
                        &mut default_history_content,
                    );
                }
            }
        }

        let mut entry_list: List<StateId> = states_to_enter.to_list();
        entry_list.sort_by(|a, b| self.entry_order_cmp(*a, *b));

        for s in entry_list.iter() {
            let state_id = *s;
            self.configuration.add(state_id);
            self.states_to_invoke.add(state_id);

            if self.binding == BindingType::Late && self.get_state(state_id).is_first_entry {
                self.with_dm_mut(|dm, fsm| dm.initialize_data_model(fsm, state_id));
                self.mark_first_entry_done(state_id);
            }

            let onentry = self.get_state(state_id).onentry.clone();
            for content_id in onentry {
                self.with_dm(|dm, fsm| dm.execute_content(fsm, content_id));
            }

            for invoke in self.get_state(state_id).invokes.clone() {
                self.deferred_invokes.push(DeferredInvoke { state_id, invoke });
            }

            #[cfg(feature = "Trace_State")]
            self.tracer
                .lock()
                .unwrap()
                .trace_enter_state(self.session_id, self.get_state(state_id));

            if states_for_default_entry.is_member(&state_id) {
                if let Some(initial_tid) = self.get_state(state_id).initial {
                    let content = self.get_transition(initial_tid).content;
                    self.with_dm(|dm, fsm| dm.execute_content(fsm, content));
                }
            }
            if let Some(content_id) = default_history_content.get(&state_id).copied() {
                self.with_dm(|dm, fsm| dm.execute_content(fsm, content_id));
            }

            if self.get_state(state_id).is_final() {
                let parent = self.get_state(state_id).parent;
                match parent {
                    None => self.running = false,
                    Some(parent_id) => {
                        let donedata = self.synthesize_done_data(state_id);
                        self.dm()
                            .global()
                            .lock()
                            .unwrap()
                            .enqueue_internal(Event::done_state(&self.get_state(parent_id).name, donedata));
                        if let Some(grandparent) = self.get_state(parent_id).parent {
                            if self.get_state(grandparent).is_parallel() {
                                self.parallel_done_raised.remove(&grandparent);
                            }
                        }
                    }
                }
            }
        }

        // Parallel completion: re-check after the whole entry set has settled, once
        // per entry of the parallel state (SPEC_FULL.md §9 open-question #2).
        for s in entry_list.iter() {
            if !self.get_state(*s).is_final() {
                continue;
            }
            if let Some(parent_id) = self.get_state(*s).parent {
                if self.get_state(parent_id).is_parallel()
                    && !self.parallel_done_raised.contains(&parent_id)
                    && self
                        .get_child_states(parent_id)
                        .iter()
                        .all(|region| self.region_is_done(*region))
                {
                    self.parallel_done_raised.insert(parent_id);
                    self.dm()
                        .global()
                        .lock()
                        .unwrap()
                        .enqueue_internal(Event::done_state(&self.get_state(parent_id).name, None));
                }
            }
        }
    }

    fn region_is_done(&self, region: StateId) -> bool {
        self.configuration
            .iter()
            .filter(|s| self.is_descendant(**s, region) && self.is_leaf_of(**s))
            .all(|s| self.get_state(*s).is_final())
            && self
                .configuration
                .iter()
                .any(|s| self.is_descendant(*s, region) && self.get_state(*s).is_final())
    }

    fn synthesize_done_data(&mut self, final_state: StateId) -> Option<Data> {
        let donedata = self.get_state(final_state).donedata.clone()?;
        match donedata.source {
            DoneDataSource::Content(expr) => self.with_dm(|dm, fsm| dm.execute(fsm, &expr).ok()),
            DoneDataSource::Params(params) => {
                let mut map = HashMap::new();
                for (name, expr) in params {
                    let by_location = self.dm_mut().get_by_location(&expr);
                    let value = match by_location {
                        Ok(v) => v,
                        Err(_) => self
                            .with_dm(|dm, fsm| dm.execute(fsm, &expr))
                            .unwrap_or(Data::None),
                    };
                    map.insert(name, value);
                }
                Some(Data::Map(map))
            }
        }
    }

    fn add_descendant_states_to_enter(
        &mut self,
        state: StateId,
        states_to_enter: &mut OrderedSet<StateId>,
        states_for_default_entry: &mut OrderedSet<StateId>,
        default_history_content: &mut HashMap<StateId, ExecutableContentId>,
    ) {
        if self.get_state(state).is_history() {
            let deep = self.get_state(state).history_is_deep();
            let _ = deep;
            match self.history_value.get(&state).cloned() {
                Some(recorded) if !recorded.is_empty() => {
                    for s in recorded.iter() {
                        self.add_descendant_states_to_enter(
                            *s,
                            states_to_enter,
                            states_for_default_entry,
                            default_history_content,
                        );
                    }
                    let parent = self.get_state(state).parent.unwrap_or(state);
                    for s in recorded.iter() {
                        self.add_ancestor_states_to_enter(
                            *s,
                            parent,
                            states_to_enter,
                            states_for_default_entry,
                            default_history_content,
                        );
                    }
                }
                _ => {
                    let parent = self.get_state(state).parent.unwrap_or(state);
                    let default_tid = self.get_state(state).history_default;
                    let targets: Vec<StateId> = match default_tid {
                        Some(tid) => self.get_transition(tid).target.clone(),
                        None => self
                            .get_state(parent)
                            .initial
                            .map(|tid| self.get_transition(tid).target.clone())
                            .unwrap_or_default(),
                    };
                    if let Some(tid) = default_tid {
                        default_history_content.insert(parent, self.get_transition(tid).content);
                    }
                    for s in targets.clone() {
                        self.add_descendant_states_to_enter(
                            s,
                            states_to_enter,
                            states_for_default_entry,
                            default_history_content,
                        );
                    }
                    for s in targets {
                        self.add_ancestor_states_to_enter(
                            s,
                            parent,
                            states_to_enter,
                            states_for_default_entry,
                            default_history_content,
                        );
                    }
                }
            }
        } else {
            states_to_enter.add(state);
            if self.get_state(state).is_compound() {
                states_for_default_entry.add(state);
                let initial_tid = self.get_state(state).initial;
                if let Some(tid) = initial_tid {
                    let targets = self.get_transition(tid).target.clone();
                    for s in targets.clone() {
                        self.add_descendant_states_to_enter(
                            s,
                            states_to_enter,
                            states_for_default_entry,
                            default_history_content,
                        );
                    }
                    for s in targets {
                        self.add_ancestor_states_to_enter(
                            s,
                            state,
                            states_to_enter,
                            states_for_default_entry,
                            default_history_content,
                        );
                    }
                }
            } else if self.get_state(state).is_parallel() {
                for child in self.get_child_states(state) {
                    if !states_to_enter.some_member(|s| self.is_descendant(*s, child)) {
                        self.add_descendant_states_to_enter(
                            child,
                            states_to_enter,
                            states_for_default_entry,
                            default_history_content,
                        );
                    }
                }
            }
        }
    }

    fn add_ancestor_states_to_enter(
        &mut self,
        state: StateId,
        ancestor: StateId,
        states_to_enter: &mut OrderedSet<StateId>,
        states_for_default_entry: &mut OrderedSet<StateId>,
        default_history_content: &mut HashMap<StateId, ExecutableContentId>,
    ) {
        for anc in self.get_proper_ancestors(state, Some(ancestor)) {
            states_to_enter.add(anc);
            if self.get_state(anc).is_parallel() {
                for child in self.get_child_states(anc) {
                    if !states_to_enter.some_member(|s| self.is_descendant(*s, child)) {
                        self.add_descendant_states_to_enter(
                            child,
                            states_to_enter,
                            states_for_default_entry,
                            default_history_content,
                        );
                    }
                }
            }
        }
    }

    // ---- invoke lifecycle (§4.7) ------------------------------------------------

    fn execute_deferred_invokes(&mut self) {
        let due: Vec<DeferredInvoke> = self
            .deferred_invokes
            .drain(..)
            .filter(|di| self.configuration.is_member(&di.state_id))
            .collect();
        for di in due {
            self.start_invoke(di.state_id, di.invoke);
        }
    }

    fn start_invoke(&mut self, state_id: StateId, invoke: Invoke) {
        let type_name = match &invoke.type_expr {
            Some(e) => self
                .with_dm(|dm, fsm| dm.execute(fsm, e).ok())
                .map(|d| d.to_string())
                .or_else(|| invoke.type_name.clone())
                .unwrap_or_else(|| SCXML_INVOKE_TYPE_SHORT.to_string()),
            None => invoke
                .type_name
                .clone()
                .unwrap_or_else(|| SCXML_INVOKE_TYPE_SHORT.to_string()),
        };

        if type_name != SCXML_INVOKE_TYPE_SHORT && type_name != SCXML_INVOKE_TYPE {
            self.dm_mut()
                .internal_error_execution(&None, &Some(invoke.invoke_id.clone()));
            return;
        }

        let src = match &invoke.src_expr {
            Some(e) => self
                .with_dm(|dm, fsm| dm.execute(fsm, e).ok())
                .map(|d| d.to_string())
                .or_else(|| invoke.src.clone()),
            None => invoke.src.clone(),
        };

        if src.is_none() && invoke.content.is_none() {
            self.dm_mut()
                .internal_error_execution(&None, &Some(invoke.invoke_id.clone()));
            return;
        }

        let executor = {
            let global = self.dm().global().lock().unwrap();
            match &global.executor {
                Some(e) => e.handle(),
                None => return,
            }
        };

        let spawned = executor.spawn_invoked_session(
            src,
            invoke.content.clone(),
            self.session_id,
            invoke.invoke_id.clone(),
        );
        let (child_session_id, child_sender) = match spawned {
            Ok(handle) => handle,
            Err(_err) => {
                #[cfg(feature = "Debug")]
                debug!("Failed to start invoke {}: {}", invoke.invoke_id, _err);
                self.dm_mut()
                    .internal_error_execution(&None, &Some(invoke.invoke_id.clone()));
                return;
            }
        };

        for (name, expr) in &invoke.params {
            let by_location = self.dm_mut().get_by_location(expr);
            let value = match by_location {
                Ok(v) => Some(v),
                Err(_) => self.with_dm(|dm, fsm| dm.execute(fsm, expr).ok()),
            };
            if let Some(value) = value {
                let mut e = Event::new_external();
                e.name = format!("_invoke.param.{}", name);
                e.content = Some(value);
                let _ = child_sender.send(Box::new(e));
            }
        }

        self.running_invokes.insert(
            invoke.invoke_id.clone(),
            RunningInvoke {
                state_id,
                child_session_id,
                sender: child_sender.clone(),
            },
        );
        self.dm().global().lock().unwrap().child_sessions.insert(
            invoke.invoke_id.clone(),
            ChildSessionHandle {
                session_id: child_session_id,
                sender: child_sender,
            },
        );

        if let Some(loc) = &invoke.id_location {
            self.dm_mut().set(loc, Data::String(invoke.invoke_id.clone()));
        }
    }

    // ---- scheduler (§4.5) --------------------------------------------------------
    //
    // Scheduling and cancelling delayed `<send>`s is `GlobalData::schedule_send` /
    // `GlobalData::cancel_send` (datamodel.rs): both only ever touch the
    // cross-thread-reachable half of the session's state, so executable content
    // (which only sees `&Fsm`, not `&mut Fsm`) can reach them through
    // `datamodel.global()` without needing mutable access to the interpreter.

    fn check_completion(&mut self) {
        if !self.running {
            self.finalize_session();
        }
    }
}

impl Debug for Fsm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fsm")
            .field("session_id", &self.session_id)
            .field("name", &self.name)
            .field("configuration", &self.configuration)
            .finish()
    }
}

/// Monotonic id generator used for autogenerated invoke-ids and send-ids, matching the
/// reference project's `PLATFORM_ID_COUNTER` idiom.
pub struct PlatformIdCounter {
    counter: std::sync::atomic::AtomicU64,
}

impl PlatformIdCounter {
    pub const fn new() -> Self {
        PlatformIdCounter {
            counter: std::sync::atomic::AtomicU64::new(1),
        }
    }
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

pub static PLATFORM_ID_COUNTER: PlatformIdCounter = PlatformIdCounter::new();

/// Spawns a session's macrostep loop on its own OS thread. Returns the thread handle
/// and the sender used to deliver external events to it.
pub fn start_fsm(mut fsm: Box<Fsm>, executor: Box<dyn SessionExecutor>) -> (JoinHandle<()>, Sender<Box<Event>>) {
    fsm.dm().global().lock().unwrap().executor = Some(executor);
    let sender = fsm.external_sender();
    let handle = thread::Builder::new()
        .name(format!("fsm-{}", fsm.session_id))
        .spawn(move || fsm.run())
        .expect("failed to spawn session thread");
    (handle, sender)
}

