//! The `ecmascript` datamodel backend, built on `boa_engine`. Every session gets its
//! own isolated [`boa_engine::Context`]; nothing is shared across sessions except
//! through SCXML's own event-passing mechanisms.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use boa_engine::object::FunctionObjectBuilder;
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsError, JsNativeError, JsResult, JsValue, NativeFunction, Source};

#[cfg(feature = "Debug")]
use crate::common::debug;
use crate::datamodel::{
    Data, Datamodel, GlobalDataArc, EVENT_VAR, EVENT_VAR_DATA, EVENT_VAR_INVOKE_ID,
    EVENT_VAR_NAME, EVENT_VAR_ORIGIN, EVENT_VAR_ORIGIN_TYPE, EVENT_VAR_SENDID, EVENT_VAR_TYPE,
    IO_PROCESSORS_VAR, SESSION_ID_VAR, SESSION_NAME_VAR,
};
use crate::fsm::{Event, ExecutableContentId, Fsm, StateId};

pub const ECMA_SCRIPT: &str = "ecmascript";

static CONTEXT_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// `boa_engine`-backed scripting session. Holds the JS context plus a session-id used
/// only for log-line prefixes (it has no bearing on the SCXML session id).
pub struct ECMAScriptDatamodel {
    context_id: u32,
    global: GlobalDataArc,
    context: Context,
}

fn js_to_data(value: &JsValue, ctx: &mut Context) -> Data {
    if value.is_null() {
        Data::Null
    } else if value.is_undefined() {
        Data::None
    } else if let Some(b) = value.as_boolean() {
        Data::Boolean(b)
    } else if let Some(n) = value.as_number() {
        if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
            Data::Integer(n as i64)
        } else {
            Data::Double(n)
        }
    } else if value.is_object() {
        if let Some(obj) = value.as_object() {
            if obj.is_array() {
                let len = obj
                    .get(js_string!("length"), ctx)
                    .ok()
                    .and_then(|v| v.as_number())
                    .unwrap_or(0.0) as usize;
                let mut items = Vec::with_capacity(len);
                for i in 0..len {
                    let item = obj.get(i, ctx).unwrap_or(JsValue::undefined());
                    items.push(js_to_data(&item, ctx));
                }
                return Data::Array(items);
            }
        }
        Data::String(
            value
                .to_string(ctx)
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_default(),
        )
    } else {
        Data::String(
            value
                .to_string(ctx)
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_default(),
        )
    }
}

fn data_to_js(data: &Data, ctx: &mut Context) -> JsValue {
    match data {
        Data::String(s) => JsValue::from(js_string!(s.as_str())),
        Data::Boolean(b) => JsValue::from(*b),
        Data::Integer(i) => JsValue::from(*i as f64),
        Data::Double(d) => JsValue::from(*d),
        Data::Array(items) => {
            let values: Vec<JsValue> = items.iter().map(|d| data_to_js(d, ctx)).collect();
            JsValue::from(boa_engine::object::builtins::JsArray::from_iter(values, ctx))
        }
        Data::Map(map) => {
            let obj = boa_engine::object::JsObject::with_object_proto(ctx.intrinsics());
            for (k, v) in map {
                let _ = obj.set(js_string!(k.as_str()), data_to_js(v, ctx), false, ctx);
            }
            JsValue::from(obj)
        }
        Data::Null => JsValue::null(),
        Data::None => JsValue::undefined(),
        Data::Error(e) => JsValue::from(js_string!(e.as_str())),
        Data::Source(s) => JsValue::from(js_string!(s.source.as_str())),
    }
}

fn js_log(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let line: String = args
        .iter()
        .map(|a| a.to_string(ctx).map(|s| s.to_std_string_escaped()).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ");
    log::info!("{}", line);
    Ok(JsValue::undefined())
}

impl ECMAScriptDatamodel {
    pub fn new(global: GlobalDataArc) -> Box<ECMAScriptDatamodel> {
        let mut context = Context::default();
        let log_fn = NativeFunction::from_fn_ptr(js_log);
        let log_value = FunctionObjectBuilder::new(context.realm(), log_fn)
            .name(js_string!("log"))
            .length(1)
            .build();
        let _ = context.register_global_property(js_string!("log"), log_value, Attribute::all());

        Box::new(ECMAScriptDatamodel {
            context_id: CONTEXT_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            global,
            context,
        })
    }

    fn eval(&mut self, script: &str) -> Result<Data, String> {
        let source = Source::from_bytes(script);
        match self.context.eval(source) {
            Ok(v) => Ok(js_to_data(&v, &mut self.context)),
            Err(e) => Err(e.to_string()),
        }
    }

    fn register_in_builtin(&mut self, fsm: &Fsm) {
        let names: Vec<String> = fsm.states_names.keys().cloned().collect();
        let configuration: Vec<String> = fsm
            .configuration
            .iter()
            .map(|id| fsm.get_state(*id).name.clone())
            .collect();
        let _ = names;
        let in_fn = NativeFunction::from_copy_closure_with_captures(
            |_this, args, captured, _ctx| -> JsResult<JsValue> {
                match args.first() {
                    Some(name) => {
                        let needle = name.to_string(_ctx)?.to_std_string_escaped();
                        Ok(JsValue::from(captured.contains(&needle)))
                    }
                    None => Err(JsError::from(JsNativeError::typ().with_message("In() requires a state name"))),
                }
            },
            configuration,
        );
        let in_value = FunctionObjectBuilder::new(self.context.realm(), in_fn)
            .name(js_string!("In"))
            .length(1)
            .build();
        let _ = self
            .context
            .register_global_property(js_string!("In"), in_value, Attribute::all());
    }
}

impl Datamodel for ECMAScriptDatamodel {
    fn global(&self) -> &GlobalDataArc {
        &self.global
    }

    fn get_name(&self) -> &str {
        ECMA_SCRIPT
    }

    fn setup_system_variables(&mut self, fsm: &Fsm, io_processors: &HashMap<String, String>) {
        #[cfg(feature = "Debug")]
        debug!("datamodel #{}: installing system variables", self.context_id);

        let _ = self.context.register_global_property(
            js_string!(SESSION_ID_VAR),
            js_string!(fsm.session_id.to_string()),
            Attribute::READONLY,
        );
        let _ = self.context.register_global_property(
            js_string!(SESSION_NAME_VAR),
            js_string!(fsm.name.as_str()),
            Attribute::READONLY,
        );

        let procs = boa_engine::object::JsObject::with_object_proto(self.context.intrinsics());
        for (type_uri, location) in io_processors {
            let entry = boa_engine::object::JsObject::with_object_proto(self.context.intrinsics());
            let _ = entry.set(js_string!("location"), js_string!(location.as_str()), false, &mut self.context);
            let _ = procs.set(js_string!(type_uri.as_str()), entry, false, &mut self.context);
        }
        let _ = self.context.register_global_property(
            js_string!(IO_PROCESSORS_VAR),
            procs,
            Attribute::READONLY,
        );

        self.register_in_builtin(fsm);
    }

    fn initialize_data_model(&mut self, fsm: &mut Fsm, state_id: StateId) {
        let items = fsm.get_state(state_id).data_items.clone();
        for item in items {
            let value = match &item.expr {
                None => Data::None,
                Some(expr) => self.eval(expr).unwrap_or_else(|e| {
                    log::warn!("data item '{}': {}", item.id, e);
                    Data::None
                }),
            };
            let js_value = data_to_js(&value, &mut self.context);
            let _ = self
                .context
                .register_global_property(js_string!(item.id.as_str()), js_value, Attribute::all());
        }
    }

    fn set_event(&mut self, event: &Event) {
        let obj = boa_engine::object::JsObject::with_object_proto(self.context.intrinsics());
        let ctx = &mut self.context;
        let _ = obj.set(js_string!(EVENT_VAR_NAME), js_string!(event.name.as_str()), false, ctx);
        let _ = obj.set(js_string!(EVENT_VAR_TYPE), js_string!(event.etype.to_string()), false, ctx);
        let _ = obj.set(
            js_string!(EVENT_VAR_SENDID),
            event
                .sendid
                .as_deref()
                .map(|s| JsValue::from(js_string!(s)))
                .unwrap_or(JsValue::undefined()),
            false,
            ctx,
        );
        let _ = obj.set(
            js_string!(EVENT_VAR_ORIGIN),
            event
                .origin
                .as_deref()
                .map(|s| JsValue::from(js_string!(s)))
                .unwrap_or(JsValue::undefined()),
            false,
            ctx,
        );
        let _ = obj.set(
            js_string!(EVENT_VAR_ORIGIN_TYPE),
            event
                .origin_type
                .as_deref()
                .map(|s| JsValue::from(js_string!(s)))
                .unwrap_or(JsValue::undefined()),
            false,
            ctx,
        );
        let _ = obj.set(
            js_string!(EVENT_VAR_INVOKE_ID),
            event
                .invoke_id
                .as_deref()
                .map(|s| JsValue::from(js_string!(s)))
                .unwrap_or(JsValue::undefined()),
            false,
            ctx,
        );
        let data_value = event
            .content
            .as_ref()
            .map(|d| data_to_js(d, ctx))
            .unwrap_or(JsValue::undefined());
        let _ = obj.set(js_string!(EVENT_VAR_DATA), data_value, false, ctx);

        let _ = self
            .context
            .register_global_property(js_string!(EVENT_VAR), obj, Attribute::all());
    }

    fn set(&mut self, name: &str, data: Data) {
        let js_value = data_to_js(&data, &mut self.context);
        let _ = self
            .context
            .register_global_property(js_string!(name), js_value, Attribute::all());
    }

    fn get_by_location(&mut self, location: &str) -> Result<Data, String> {
        self.eval(location)
    }

    fn assign(&mut self, _fsm: &Fsm, left_expr: &str, right_expr: &str) -> bool {
        match self.eval(right_expr) {
            Ok(value) => {
                self.set(left_expr, value);
                true
            }
            Err(e) => {
                log::warn!("assign: can't evaluate '{}': {}", right_expr, e);
                self.global()
                    .lock()
                    .unwrap()
                    .enqueue_internal(Event::error_execution(&None, &None));
                false
            }
        }
    }

    fn execute(&mut self, _fsm: &Fsm, script: &str) -> Result<Data, String> {
        self.eval(script)
    }

    fn execute_condition(&mut self, _fsm: &Fsm, script: &str) -> Result<bool, String> {
        self.eval(script).map(|d| d.as_bool())
    }

    fn execute_for_each(
        &mut self,
        fsm: &Fsm,
        array_expr: &str,
        item: &str,
        index: &str,
        body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> Result<(), String> {
        let array = self.eval(array_expr)?;
        let items = match array {
            Data::Array(items) => items,
            other => return Err(format!("foreach: '{}' is not an array ({:?})", array_expr, other)),
        };
        for (i, value) in items.into_iter().enumerate() {
            self.set(item, value);
            if !index.is_empty() {
                self.set(index, Data::Integer(i as i64));
            }
            if !body(self) {
                break;
            }
            let _ = fsm;
        }
        Ok(())
    }

    fn execute_content(&mut self, fsm: &Fsm, content_id: ExecutableContentId) -> bool {
        let Some(actions) = fsm.executable_content.get(&content_id) else {
            return true;
        };
        for action in actions {
            if !action.execute(self, fsm) {
                return false;
            }
        }
        true
    }

    fn log(&mut self, msg: &str) {
        log::info!("{}", msg);
    }
}

impl std::fmt::Debug for ECMAScriptDatamodel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ECMAScriptDatamodel")
            .field("context_id", &self.context_id)
            .finish()
    }
}
