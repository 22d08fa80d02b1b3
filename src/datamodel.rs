//! The data model: the `Datamodel` trait every scripting-session backend implements,
//! the `Data` value type exchanged between the interpreter and the scripting session,
//! and `GlobalData`, the cross-thread-reachable half of a running session's state.
//!
//! Only one backend ships in this crate: [`ecma_script::ECMAScriptDatamodel`], built on
//! `boa_engine`. Every SCXML document processed by this crate uses `datamodel="ecmascript"`.

use std::collections::HashMap;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};

use crate::fsm::{Event, ExecutableContentId, Fsm, SessionId, StateId, PLATFORM_ID_COUNTER};
use crate::tracer::Tracer;

pub mod ecma_script;

/// Type URI of the SCXML Event I/O Processor.
pub const SCXML_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";

/// Type URI of the Basic HTTP Event I/O Processor.
pub const BASIC_HTTP_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#BasicHTTPEventProcessor";

pub const SCXML_INVOKE_TYPE: &str = "http://www.w3.org/TR/scxml/";
pub const SCXML_INVOKE_TYPE_SHORT: &str = "scxml";

/// System variable names, injected into every session's scripting context.
pub const SESSION_ID_VAR: &str = "_sessionid";
pub const SESSION_NAME_VAR: &str = "_name";
pub const IO_PROCESSORS_VAR: &str = "_ioprocessors";
pub const EVENT_VAR: &str = "_event";

/// Fields of `_event`, see W3C SCXML 5.10.1.
pub const EVENT_VAR_NAME: &str = "name";
pub const EVENT_VAR_TYPE: &str = "type";
pub const EVENT_VAR_SENDID: &str = "sendid";
pub const EVENT_VAR_ORIGIN: &str = "origin";
pub const EVENT_VAR_ORIGIN_TYPE: &str = "origintype";
pub const EVENT_VAR_INVOKE_ID: &str = "invokeid";
pub const EVENT_VAR_DATA: &str = "data";

/// An unevaluated expression, cached against its owning data item or action node.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceCode {
    pub source: String,
}

impl SourceCode {
    pub fn new(source: &str) -> SourceCode {
        SourceCode {
            source: source.to_string(),
        }
    }
}

/// The value type exchanged between the interpreter, the data items, and the scripting
/// session. Scripting backends translate to/from their native value representation at
/// the boundary; nothing in the interpreter core depends on a specific JS engine type.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    String(String),
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Array(Vec<Data>),
    Map(HashMap<String, Data>),
    /// Explicit ECMAScript `null`.
    Null,
    /// No value has ever been assigned (distinct from `Null`).
    None,
    Error(String),
    /// An expression that has not yet been evaluated (late-bound data items).
    Source(SourceCode),
}

impl Data {
    pub fn as_bool(&self) -> bool {
        match self {
            Data::String(s) => !s.is_empty(),
            Data::Boolean(b) => *b,
            Data::Integer(i) => *i != 0,
            Data::Double(d) => *d != 0.0,
            Data::Array(a) => !a.is_empty(),
            Data::Map(_) => true,
            Data::Null | Data::None => false,
            Data::Error(_) => false,
            Data::Source(_) => false,
        }
    }
}

impl Display for Data {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Data::String(s) => write!(f, "{}", s),
            Data::Boolean(b) => write!(f, "{}", b),
            Data::Integer(i) => write!(f, "{}", i),
            Data::Double(d) => write!(f, "{}", d),
            Data::Array(a) => write!(
                f,
                "[{}]",
                a.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",")
            ),
            Data::Map(m) => write!(
                f,
                "{{{}}}",
                m.iter()
                    .map(|(k, v)| format!("{}:{}", k, v))
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            Data::Null => write!(f, "null"),
            Data::None => write!(f, ""),
            Data::Error(e) => write!(f, "{}", e),
            Data::Source(s) => write!(f, "{}", s.source),
        }
    }
}

/// Handle to an invoked child session, keyed by invoke-id in [`GlobalData::child_sessions`].
#[derive(Debug, Clone)]
pub struct ChildSessionHandle {
    pub session_id: SessionId,
    pub sender: Sender<Box<Event>>,
}

/// Handle returned by the scheduler for a pending `<send>`; used to cancel it.
#[derive(Debug, Clone)]
pub struct ScheduledSendHandle {
    pub sendid: String,
    pub cancel: Sender<()>,
}

/// A running session's executor-facing surface: routing events to sibling sessions,
/// spawning invoked children, scheduling delayed sends, and stopping sessions.
/// Implemented by `fsm_executor::FsmExecutor`.
pub trait SessionExecutor: Send + Sync + Debug {
    fn send_to_session(&self, session_id: SessionId, event: Event) -> Result<(), String>;
    fn stop_session(&self, session_id: SessionId);

    /// Loads (by `src` URI or inline `content`) and starts a child session invoked
    /// from `parent_session_id`, returning its session id and external-queue sender.
    fn spawn_invoked_session(
        &self,
        src: Option<String>,
        content: Option<String>,
        parent_session_id: SessionId,
        invoke_id: String,
    ) -> Result<(SessionId, Sender<Box<Event>>), String>;

    /// Delivers `event` to `target` (an SCXML target string) after `delay_ms` on a
    /// background timer, unless a message arrives first on `cancel` (the receiving
    /// half of the handle the caller registered in `GlobalData::delayed_send`).
    fn schedule_send(
        &self,
        target: String,
        event: Event,
        delay_ms: u64,
        sendid: String,
        cancel: std::sync::mpsc::Receiver<()>,
    );

    /// Returns a fresh handle to this executor for storing alongside a spawned
    /// session's `GlobalData` (the trait object itself is not `Clone`).
    fn handle(&self) -> Box<dyn SessionExecutor>;
}

pub type GlobalDataArc = Arc<Mutex<GlobalData>>;
pub type GlobalDataLock<'a> = std::sync::MutexGuard<'a, GlobalData>;

/// The part of a running session's state that must be reachable from other threads:
/// the scheduler's callback workers, invoked children's completion callbacks, and I/O
/// processors serving inbound HTTP requests. Everything else (configuration, history,
/// the scripting context) is owned exclusively by the session's own thread.
#[derive(Debug)]
pub struct GlobalData {
    pub session_id: SessionId,
    pub session_name: String,
    pub source: Option<String>,
    pub parent_session_id: Option<SessionId>,
    pub caller_invoke_id: Option<String>,
    pub child_sessions: HashMap<String, ChildSessionHandle>,
    pub executor: Option<Box<dyn SessionExecutor>>,
    /// Sender half of the session's internal queue; cloned into every cross-thread
    /// producer (scheduler callbacks, invoke completion, IO-processor error paths) so
    /// that raising an internal event never blocks on the session thread.
    pub internal_sender: Sender<Box<Event>>,
    /// Sender half of the session's external queue, registered with every I/O
    /// processor so `target=""` (deliver to self) and cross-session sends can reach it.
    pub external_sender: Sender<Box<Event>>,
    pub delayed_send: HashMap<String, ScheduledSendHandle>,
    pub tracer: Arc<Mutex<Box<dyn Tracer>>>,
    pub final_configuration: Option<Vec<String>>,
    pub done_data: Option<Data>,
    pub io_processor_locations: HashMap<String, String>,
}

impl GlobalData {
    pub fn new(
        session_id: SessionId,
        session_name: String,
        internal_sender: Sender<Box<Event>>,
        external_sender: Sender<Box<Event>>,
        tracer: Arc<Mutex<Box<dyn Tracer>>>,
    ) -> GlobalData {
        GlobalData {
            session_id,
            session_name,
            source: None,
            parent_session_id: None,
            caller_invoke_id: None,
            child_sessions: HashMap::new(),
            executor: None,
            internal_sender,
            external_sender,
            delayed_send: HashMap::new(),
            tracer,
            final_configuration: None,
            done_data: None,
            io_processor_locations: HashMap::new(),
        }
    }

    /// Raise an event on this session's internal queue. Fire-and-forget: failures (the
    /// session thread has already terminated) are swallowed, matching §4.4's raiser
    /// contract.
    pub fn enqueue_internal(&self, event: Event) {
        let _ = self.internal_sender.send(Box::new(event));
    }

    /// Deliver an event to this session's external queue (used for `target=""`).
    pub fn enqueue_external(&self, event: Event) {
        let _ = self.external_sender.send(Box::new(event));
    }

    /// Schedules `event` for delivery to `target` after `delay_ms`. Returns the
    /// assigned send-id (re-using `sendid` if given, cancelling any prior scheduled
    /// event with the same id first). Delivery itself is the executor's job — see
    /// [`SessionExecutor::schedule_send`] — so that the timer thread never needs a
    /// direct reference back into the owning session's `Fsm`.
    pub fn schedule_send(
        &mut self,
        sendid: Option<String>,
        delay_ms: u64,
        target: String,
        event: Event,
    ) -> String {
        let sendid = sendid.unwrap_or_else(|| format!("{}.{}", self.session_id, PLATFORM_ID_COUNTER.next()));

        if let Some(old) = self.delayed_send.remove(&sendid) {
            let _ = old.cancel.send(());
        }

        let (cancel_tx, cancel_rx) = channel::<()>();
        if let Some(executor) = &self.executor {
            executor.schedule_send(target, event, delay_ms, sendid.clone(), cancel_rx);
        }
        self.delayed_send.insert(
            sendid.clone(),
            ScheduledSendHandle {
                sendid: sendid.clone(),
                cancel: cancel_tx,
            },
        );
        sendid
    }

    /// Cancels a previously scheduled `<send>` by id. Returns `false` if no such
    /// send is pending (already delivered, already cancelled, or unknown id) — the
    /// W3C spec only asks for a best effort, not a guarantee.
    pub fn cancel_send(&mut self, sendid: &str) -> bool {
        match self.delayed_send.remove(sendid) {
            Some(h) => {
                let _ = h.cancel.send(());
                true
            }
            None => false,
        }
    }
}

/// Capability contract every scripting-session backend implements. One instance per
/// running session; owned exclusively by the session's own thread (see §5).
pub trait Datamodel: Send {
    /// A handle to the cross-thread-reachable part of this session's state.
    fn global(&self) -> &GlobalDataArc;

    /// Name used in error messages / `_ioprocessors` (e.g. `"ecmascript"`).
    fn get_name(&self) -> &str;

    /// Installs the fixed, read-only system variables and the `In(id)` builtin. Called
    /// once, immediately after the datamodel is constructed.
    fn setup_system_variables(&mut self, fsm: &Fsm, io_processors: &HashMap<String, String>);

    /// Initializes the data items owned by `state_id` (document-level items for the
    /// root state, §4.1's early-binding pass, or a single state's items on first entry
    /// under late binding).
    fn initialize_data_model(&mut self, fsm: &mut Fsm, state_id: StateId);

    /// Binds `_event` to the triggering event, per §4.6. Not called until the first
    /// event is processed in a session.
    fn set_event(&mut self, event: &Event);

    fn set(&mut self, name: &str, data: Data);

    /// Evaluates `location` (an identifier or member expression) and returns its
    /// current value. Takes `&mut self` because scripting backends generally need a
    /// mutable engine handle to evaluate anything, `boa_engine::Context` included.
    fn get_by_location(&mut self, location: &str) -> Result<Data, String>;

    /// `<assign location=... expr=...>`. Returns `false` (and has already raised
    /// `error.execution` via `global()`) on failure.
    fn assign(&mut self, fsm: &Fsm, left_expr: &str, right_expr: &str) -> bool;

    /// Evaluate a script body / send `<param>` value / `<content>` body.
    fn execute(&mut self, fsm: &Fsm, script: &str) -> Result<Data, String>;

    /// Evaluate a transition/if/elseif guard.
    fn execute_condition(&mut self, fsm: &Fsm, script: &str) -> Result<bool, String>;

    /// `<foreach>` contract of §4.6. `body` is invoked once per array element with the
    /// item (and optionally index) bound; returns `false` to stop the loop early.
    fn execute_for_each(
        &mut self,
        fsm: &Fsm,
        array_expr: &str,
        item: &str,
        index: &str,
        body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> Result<(), String>;

    /// Executes one executable-content block (a `<script>`/`<onentry>`/`<onexit>`/
    /// transition body) in document order, stopping at the first action that fails.
    /// Returns `false` if any action failed (the block was abandoned midway).
    fn execute_content(&mut self, fsm: &Fsm, content_id: ExecutableContentId) -> bool;

    fn log(&mut self, msg: &str);

    /// Raises `error.execution` on this session's internal queue.
    fn internal_error_execution(&mut self, sendid: &Option<String>, invoke_id: &Option<String>) {
        self.global()
            .lock()
            .unwrap()
            .enqueue_internal(Event::error_execution(sendid, invoke_id));
    }

    /// Raises `error.communication` on this session's internal queue.
    fn internal_error_communication(&mut self, event: &Event) {
        self.global()
            .lock()
            .unwrap()
            .enqueue_internal(Event::error_communication(event));
    }
}
