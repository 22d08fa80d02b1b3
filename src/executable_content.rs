//! Implementation of "executable content" elements.\
//! See [W3C:Executable Content](/doc/W3C_SCXML_2024_07_13/index.html#executable).

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::common::warn;
use crate::datamodel::{Data, Datamodel};
use crate::event_io_processor::scxml_event_io_processor::{
    SCXML_TARGET_INTERNAL, SCXML_TARGET_INVOKE_ID_PREFIX, SCXML_TARGET_PARENT,
    SCXML_TARGET_SESSION_ID_PREFIX,
};
use crate::fsm::{vec_to_string, Event, EventType, ExecutableContentId, Fsm, ParamPair, PLATFORM_ID_COUNTER};

pub const TYPE_IF: u8 = 0;
pub const TYPE_EXPRESSION: u8 = 1;
pub const TYPE_LOG: u8 = 3;
pub const TYPE_FOREACH: u8 = 4;
pub const TYPE_SEND: u8 = 5;
pub const TYPE_RAISE: u8 = 6;
pub const TYPE_CANCEL: u8 = 7;
pub const TYPE_ASSIGN: u8 = 8;

pub const TYPE_NAMES: [&str; 9] = [
    "if",
    "expression",
    "unused",
    "log",
    "foreach",
    "send",
    "raise",
    "cancel",
    "assign",
];

/// Gets the global data store from a datamodel.
macro_rules! get_global {
    ($x:expr) => {
        $x.global().lock().unwrap()
    };
}

/// One piece of executable content (an `<assign>`, `<if>`, `<send>`, ...). A
/// `<script>`/`<onentry>`/`<onexit>`/transition body is a `Vec<Box<dyn ExecutableContent>>`,
/// executed in document order by [`Datamodel::execute_content`].
pub trait ExecutableContent: Debug + Send {
    /// `datamodel` owns the scripting session; `fsm` is the model/configuration the
    /// action runs against. Only `&Fsm` is available here (not `&mut Fsm`) because
    /// content runs from inside `Datamodel::execute_content`, which itself runs from
    /// inside `Fsm::with_dm`/`with_dm_mut` — actions that need to touch session-wide
    /// state not owned by the datamodel (scheduling a delayed send, cancelling one,
    /// routing a `<send>` to another session) go through `datamodel.global()` instead.
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool;
    fn get_type(&self) -> u8;
    fn get_trace(&self) -> HashMap<&str, Data>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub fn get_safe_executable_content_as<T: 'static>(ec: &mut dyn ExecutableContent) -> &mut T {
    ec.as_any_mut()
        .downcast_mut::<T>()
        .unwrap_or_else(|| panic!("Failed to cast executable content"))
}

pub fn get_executable_content_as<T: 'static>(ec: &mut dyn ExecutableContent) -> Option<&mut T> {
    ec.as_any_mut().downcast_mut::<T>()
}

pub fn get_opt_executable_content_as<T: 'static>(
    ec_opt: Option<&mut dyn ExecutableContent>,
) -> Option<&mut T> {
    ec_opt.and_then(get_executable_content_as::<T>)
}

/// `<assign location=... expr=...>`.
#[derive(Debug, Default, Clone)]
pub struct Assign {
    pub location: String,
    pub expr: String,
}

impl Assign {
    pub fn new() -> Assign {
        Assign::default()
    }
}

impl ExecutableContent for Assign {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        datamodel.assign(fsm, &self.location, &self.expr)
    }

    fn get_type(&self) -> u8 {
        TYPE_ASSIGN
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("location", Data::String(self.location.clone()));
        d.insert("expr", Data::String(self.expr.clone()));
        d
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// *W3C says*:
/// The \<raise\> element raises an event in the current SCXML session.\
/// Note that the event will not be processed until the current block of executable content has completed
/// and all events that are already in the internal event queue have been processed. For example, suppose
/// the \<raise\> element occurs first in the \<onentry\> handler of state S followed by executable content
/// elements ec1 and ec2. If event e1 is already in the internal event queue when S is entered, the event
/// generated by \<raise\> will not be processed until ec1 and ec2 have finished execution and e1 has been
/// processed.
#[derive(Debug, Default, Clone)]
pub struct Raise {
    pub event: String,
}

impl Raise {
    pub fn new() -> Raise {
        Raise::default()
    }
}

impl ExecutableContent for Raise {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        let event = Event::new(&self.event, EventType::Internal);
        get_global!(datamodel).enqueue_internal(event);
        true
    }

    fn get_type(&self) -> u8 {
        TYPE_RAISE
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("event", Data::String(self.event.clone()));
        d
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A bare `<script>` body, or an expression evaluated purely for its side effects.
#[derive(Debug, Default, Clone)]
pub struct Expression {
    pub content: String,
}

impl Expression {
    pub fn new() -> Expression {
        Expression::default()
    }
}

impl ExecutableContent for Expression {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        datamodel.execute(fsm, &self.content).is_ok()
    }

    fn get_type(&self) -> u8 {
        TYPE_EXPRESSION
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("content", Data::String(self.content.clone()));
        d
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// `<log label=... expr=...>`.
#[derive(Debug, Default, Clone)]
pub struct Log {
    pub label: String,
    pub expression: String,
}

impl Log {
    pub fn new(label: &Option<&String>, expression: String) -> Log {
        Log {
            label: label.map(|s| s.clone()).unwrap_or_default(),
            expression,
        }
    }
}

impl ExecutableContent for Log {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        match datamodel.execute(fsm, &self.expression) {
            Ok(value) => {
                let msg = if self.label.is_empty() {
                    value.to_string()
                } else {
                    format!("{}: {}", self.label, value)
                };
                datamodel.log(&msg);
                true
            }
            Err(_msg) => false,
        }
    }

    fn get_type(&self) -> u8 {
        TYPE_LOG
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("label", Data::String(self.label.clone()));
        d.insert("expression", Data::String(self.expression.clone()));
        d
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// `<if cond=...>`/`<elseif>`/`<else>`. `else_content` also holds a chained `<elseif>`'s
/// content block, since an `<elseif>` is just another `If` nested in the else branch.
#[derive(Debug, Default, Clone)]
pub struct If {
    pub condition: String,
    pub content: ExecutableContentId,
    pub else_content: ExecutableContentId,
}

impl If {
    pub fn new(condition: String) -> If {
        If {
            condition,
            content: 0,
            else_content: 0,
        }
    }
}

impl ExecutableContent for If {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        let r = datamodel.execute_condition(fsm, &self.condition).unwrap_or_else(|e| {
            warn!("Condition {} can't be evaluated. {}", self.condition, e);
            false
        });
        let content = if r { self.content } else { self.else_content };
        if content == 0 {
            return true;
        }
        for e in fsm.executable_content.get(&content).unwrap() {
            if !e.execute(datamodel, fsm) {
                return false;
            }
        }
        true
    }

    fn get_type(&self) -> u8 {
        TYPE_IF
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("condition", Data::String(self.condition.clone()));
        d.insert("then", Data::Integer(self.content as i64));
        d.insert("else", Data::Integer(self.else_content as i64));
        d
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub const INDEX_TEMP: &str = "__$index";

/// `<foreach array=... item=... index=...>`.
#[derive(Debug, Default, Clone)]
pub struct ForEach {
    pub array: String,
    pub item: String,
    pub index: String,
    pub content: ExecutableContentId,
}

impl ForEach {
    pub fn new() -> ForEach {
        ForEach::default()
    }
}

impl ExecutableContent for ForEach {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        let idx = if self.index.is_empty() {
            INDEX_TEMP.to_string()
        } else {
            self.index.clone()
        };
        datamodel
            .execute_for_each(fsm, &self.array, &self.item, &idx, &mut |datamodel| -> bool {
                if self.content == 0 {
                    return true;
                }
                for e in fsm.executable_content.get(&self.content).unwrap() {
                    if !e.execute(datamodel, fsm) {
                        return false;
                    }
                }
                true
            })
            .is_ok()
    }

    fn get_type(&self) -> u8 {
        TYPE_FOREACH
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("array", Data::String(self.array.clone()));
        d.insert("item", Data::String(self.item.clone()));
        d.insert("index", Data::String(self.index.clone()));
        d
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// `<cancel sendid=.../sendidexpr=...>`.
#[derive(Debug, Default, Clone)]
pub struct Cancel {
    pub send_id: String,
    pub send_id_expr: String,
}

impl Cancel {
    pub fn new() -> Cancel {
        Cancel::default()
    }
}

impl ExecutableContent for Cancel {
    /// *W3C says*:
    /// The \<cancel> element is used to cancel a delayed \<send> event.\
    /// The SCXML Processor MUST NOT allow \<cancel> to affect events that were not raised in the
    /// same session. The Processor SHOULD make its best attempt to cancel all delayed events with
    /// the specified id. Note, however, that it can not be guaranteed to succeed, for example if
    /// the event has already been delivered by the time the \<cancel> tag executes.
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        let send_id = if !self.send_id.is_empty() {
            Some(self.send_id.clone())
        } else if !self.send_id_expr.is_empty() {
            datamodel.execute(fsm, &self.send_id_expr).ok().map(|d| d.to_string())
        } else {
            None
        };
        if let Some(send_id) = send_id {
            get_global!(datamodel).cancel_send(&send_id);
        }
        true
    }

    fn get_type(&self) -> u8 {
        TYPE_CANCEL
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("sendid", Data::String(self.send_id.clone()));
        d.insert("sendidexpr", Data::String(self.send_id_expr.clone()));
        d
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Holds all parameters of a `<send>` call.
#[derive(Debug, Default, Clone)]
pub struct SendParameters {
    /// SCXML `<send>` attribute `idlocation`.
    pub name_location: String,
    /// SCXML `<send>` attribute `id`.
    pub name: String,
    /// Parent state of the `<send>`, used to build an id when neither `id` nor
    /// `idlocation` is given (mirrors the id format used for `<invoke>`).
    pub parent_state_name: String,
    /// SCXML `<send>` attribute `event`.
    pub event: String,
    /// SCXML `<send>` attribute `eventexpr`.
    pub event_expr: String,
    /// SCXML `<send>` attribute `target`.
    pub target: String,
    /// SCXML `<send>` attribute `targetexpr`.
    pub target_expr: String,
    /// SCXML `<send>` attribute `type`.
    pub type_value: String,
    /// SCXML `<send>` attribute `typeexpr`.
    pub type_expr: String,
    /// SCXML `<send>` attribute `delay` in milliseconds.
    pub delay_ms: u64,
    /// SCXML `<send>` attribute `delayexpr`.
    pub delay_expr: String,
    /// SCXML `<send>` attribute `namelist`. Must not be specified in conjunction with `content`.
    pub name_list: Vec<String>,
    /// `(name, expr-or-location)` pairs from `<param>` children.
    pub params: Vec<(String, String)>,
    /// `<content>` child, a literal or an expression to be evaluated.
    pub content: Option<String>,
}

impl SendParameters {
    pub fn new() -> SendParameters {
        SendParameters::default()
    }

    /// Resolves a value/valueexpr pair as the W3C processor does throughout `<send>`:
    /// the literal attribute wins if non-empty, otherwise the expr is evaluated.
    fn resolve(datamodel: &mut dyn Datamodel, fsm: &Fsm, literal: &str, expr: &str) -> Result<String, String> {
        if !literal.is_empty() {
            Ok(literal.to_string())
        } else if !expr.is_empty() {
            datamodel.execute(fsm, expr).map(|d| d.to_string())
        } else {
            Ok(String::new())
        }
    }
}

impl ExecutableContent for SendParameters {
    /// If unable to dispatch, place `error.communication` in the internal queue.
    /// If the target/type is not supported, place `error.execution` in the internal queue.
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        let target = match Self::resolve(datamodel, fsm, &self.target, &self.target_expr) {
            Ok(value) => value,
            Err(_msg) => return false,
        };

        let event_name = match Self::resolve(datamodel, fsm, &self.event, &self.event_expr) {
            Ok(value) => value,
            Err(_msg) => return false,
        };

        let send_id = if !self.name_location.is_empty() {
            // W3C says: if 'idlocation' is present, the SCXML Processor MUST generate an
            // id when the parent <send> element is evaluated and store it in this
            // location. We generate it the same way as for <invoke>.
            let generated_id = format!("{}.{}", self.parent_state_name, PLATFORM_ID_COUNTER.next());
            datamodel.set(&self.name_location, Data::String(generated_id.clone()));
            Some(generated_id)
        } else if !self.name.is_empty() {
            Some(self.name.clone())
        } else {
            None
        };

        let type_value = match Self::resolve(datamodel, fsm, &self.type_value, &self.type_expr) {
            Ok(value) if value.is_empty() => crate::datamodel::SCXML_EVENT_PROCESSOR.to_string(),
            Ok(value) => value,
            Err(_msg) => return false,
        };

        let mut content = None;
        let mut param_values = Vec::new();
        if let Some(content_expr) = &self.content {
            content = datamodel.execute(fsm, content_expr).ok();
        } else {
            for (name, expr) in &self.params {
                let value = match datamodel.get_by_location(expr) {
                    Ok(v) => v,
                    Err(_) => match datamodel.execute(fsm, expr) {
                        Ok(v) => v,
                        Err(_msg) => return false,
                    },
                };
                param_values.push(ParamPair {
                    name: name.clone(),
                    value,
                });
            }
            for name in &self.name_list {
                match datamodel.get_by_location(name) {
                    Ok(value) => param_values.push(ParamPair {
                        name: name.clone(),
                        value,
                    }),
                    Err(_msg) => return false,
                }
            }
        }

        let delay_ms = if !self.delay_expr.is_empty() {
            match datamodel.execute(fsm, &self.delay_expr) {
                Ok(delay) => parse_duration_to_milliseconds(&delay.to_string()),
                Err(_msg) => return false,
            }
        } else {
            self.delay_ms as i64
        };

        if delay_ms < 0 {
            warn!("Send: delay '{}' is invalid", self.delay_expr);
            datamodel.internal_error_execution(&send_id, &None);
            return false;
        }
        if delay_ms > 0 && target == SCXML_TARGET_INTERNAL {
            warn!("Send: illegal delay for target {}", target);
            datamodel.internal_error_execution(&send_id, &None);
            return false;
        }

        let mut event = Event::new(&event_name, EventType::External);
        event.sendid.clone_from(&send_id);
        event.origin_type = Some(type_value);
        event.content = content;
        event.param_values = if param_values.is_empty() { None } else { Some(param_values) };

        if delay_ms > 0 {
            get_global!(datamodel).schedule_send(send_id, delay_ms as u64, target, event);
            return true;
        }

        let dispatched = dispatch_send(datamodel, &target, event);
        if !dispatched {
            datamodel.internal_error_execution(&send_id, &None);
        }
        dispatched
    }

    fn get_type(&self) -> u8 {
        TYPE_SEND
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("name_location", Data::String(self.name_location.clone()));
        d.insert("name", Data::String(self.name.clone()));
        d.insert("parent_state_name", Data::String(self.parent_state_name.clone()));
        d.insert("event", Data::String(self.event.clone()));
        d.insert("event_expr", Data::String(self.event_expr.clone()));
        d.insert("target", Data::String(self.target.clone()));
        d.insert("target_expr", Data::String(self.target_expr.clone()));
        d.insert("type_value", Data::String(self.type_value.clone()));
        d.insert("type_expr", Data::String(self.type_expr.clone()));
        d.insert("delay_ms", Data::Integer(self.delay_ms as i64));
        d.insert("delay_expr", Data::String(self.delay_expr.clone()));
        d.insert("name_list", Data::String(vec_to_string(&self.name_list)));
        d
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Routes an immediate (non-delayed) `<send>` to its SCXML target. Only the session
/// relationships `Fsm`/`GlobalData` already track are reachable: the session's own
/// external queue, its invoking parent, a sibling session by id, or one of its own
/// invoked children. An arbitrary URI would need a registered event I/O processor to
/// dispatch through, which is outside what's reachable from executable content.
fn dispatch_send(datamodel: &mut dyn Datamodel, target: &str, event: Event) -> bool {
    let global = datamodel.global().lock().unwrap();
    if target.is_empty() || target == SCXML_TARGET_INTERNAL {
        global.enqueue_external(event);
        return true;
    }
    if target == SCXML_TARGET_PARENT {
        return match global.parent_session_id {
            Some(parent_id) => match &global.executor {
                Some(executor) => executor.send_to_session(parent_id, event).is_ok(),
                None => false,
            },
            None => false,
        };
    }
    if let Some(session_id_str) = target.strip_prefix(SCXML_TARGET_SESSION_ID_PREFIX) {
        return match session_id_str.parse::<u32>() {
            Ok(session_id) => match &global.executor {
                Some(executor) => executor.send_to_session(session_id, event).is_ok(),
                None => false,
            },
            Err(_) => false,
        };
    }
    if let Some(invoke_id) = target.strip_prefix(SCXML_TARGET_INVOKE_ID_PREFIX) {
        return match global.child_sessions.get(invoke_id) {
            Some(handle) => handle.sender.send(Box::new(event)).is_ok(),
            None => false,
        };
    }
    false
}

#[cfg(test)]
mod tests {
    use crate::executable_content::parse_duration_to_milliseconds;

    #[test]
    fn delay_parse() {
        assert_eq!(parse_duration_to_milliseconds("6.7s"), 6700);
        assert_eq!(parse_duration_to_milliseconds("0.5d"), 12 * 60 * 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("1m"), 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("0.001s"), 1);
        assert_eq!(parse_duration_to_milliseconds("6.7S"), 6700);
        assert_eq!(parse_duration_to_milliseconds("0.5D"), 12 * 60 * 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("1M"), 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("0.001S"), 1);

        assert_eq!(parse_duration_to_milliseconds("x1S"), -1);
        assert_eq!(parse_duration_to_milliseconds("1Sx"), -1);
    }
}

/// Parses a CSS-style duration (`\d*(\.\d+)?(ms|s|m|h|d)`, as used by `<send delay=...>`)
/// into milliseconds. Returns `-1` if `d` isn't a valid duration.
pub fn parse_duration_to_milliseconds(d: &str) -> i64 {
    if d.is_empty() {
        return 0;
    }
    let bytes = d.as_bytes();
    let mut i = 0;
    while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
        i += 1;
    }
    if i == 0 {
        return -1;
    }
    let Ok(value) = d[..i].parse::<f64>() else {
        return -1;
    };
    let unit = &d[i..];
    let factor = match unit.to_ascii_lowercase().as_str() {
        "" => 1.0,
        "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 60.0 * 60_000.0,
        "d" => 24.0 * 60.0 * 60_000.0,
        _ => return -1,
    };
    (value * factor).round() as i64
}
