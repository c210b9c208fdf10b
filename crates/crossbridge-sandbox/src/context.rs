//! One sandbox context: an allow-listed QuickJS global scope and the host
//! functions installed into it.
//!
//! Only these globals exist besides the language built-ins:
//!
//! | Global | Backing |
//! |--------|---------|
//! | `console.log/info/warn/error` | `tracing` events under `crossbridge::sandbox::console` |
//! | `setTimeout` / `clearTimeout` | a host timer queue drained while a fragment awaits |
//! | `HostStorage` | the injected [`StorageApi`], only when one was supplied |
//!
//! There is no module loader, no filesystem, no process and no network.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbridge_core::StorageApi;
use rquickjs::context::intrinsic;
use rquickjs::prelude::{Coerced, Opt, Rest};
use rquickjs::{
    CatchResultExt, CaughtError, Context, Ctx, Exception, Function, Object, Persistent, Promise,
    Runtime, Value,
};

/// Builds the frozen, promise-returning `HostStorage` facade around the raw
/// native functions, which stay unreachable from sandboxed code.
const HOST_STORAGE_FACADE: &str = r#"
(native) => Object.freeze({
  createUser: async (id, name, age) => native.createUser(id, name, age),
  getUser: async (id) => native.getUser(id),
  updateUser: async (id, age) => native.updateUser(id, age),
  deleteUser: async (id) => native.deleteUser(id),
})
"#;

/// Why a source or fragment did not produce a value.
#[derive(Debug)]
pub(crate) enum Failure {
    /// The code threw, or the result could not be converted.
    Thrown(String),
    /// The returned promise was still pending with no work left to run.
    Unsettled,
    /// A timer was due after the deadline.
    DeadlineExceeded,
}

#[derive(Default)]
struct TimerQueue {
    next_id: u32,
    pending: BTreeMap<u32, (Instant, Persistent<Function<'static>>)>,
}

impl TimerQueue {
    fn schedule(&mut self, due: Instant, callback: Persistent<Function<'static>>) -> u32 {
        self.next_id = self.next_id.wrapping_add(1);
        self.pending.insert(self.next_id, (due, callback));
        self.next_id
    }

    fn cancel(&mut self, id: u32) {
        self.pending.remove(&id);
    }

    fn next_due(&self) -> Option<(u32, Instant)> {
        self.pending
            .iter()
            .min_by_key(|(id, (due, _))| (*due, **id))
            .map(|(id, (due, _))| (*id, *due))
    }

    fn take(&mut self, id: u32) -> Option<Persistent<Function<'static>>> {
        self.pending.remove(&id).map(|(_, callback)| callback)
    }

    fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

pub(crate) struct SandboxContext {
    timers: Rc<RefCell<TimerQueue>>,
    context: Context,
}

impl SandboxContext {
    /// Create a fresh context on `runtime`, with `HostStorage` bound to
    /// `storage` when present.
    pub(crate) fn build(
        runtime: &Runtime,
        storage: Option<Arc<dyn StorageApi>>,
    ) -> rquickjs::Result<Self> {
        let context = Context::builder()
            .with::<intrinsic::Eval>()
            .with::<intrinsic::Date>()
            .with::<intrinsic::Json>()
            .with::<intrinsic::Promise>()
            .with::<intrinsic::MapSet>()
            .with::<intrinsic::RegExpCompiler>()
            .with::<intrinsic::RegExp>()
            .build(runtime)?;
        let timers = Rc::new(RefCell::new(TimerQueue::default()));

        context.with(|ctx| -> rquickjs::Result<()> {
            install_console(&ctx)?;
            install_timers(&ctx, timers.clone())?;
            if let Some(storage) = storage {
                install_host_storage(&ctx, storage)?;
            }
            Ok(())
        })?;

        Ok(Self { timers, context })
    }

    /// Run a whole source file in the global scope.
    pub(crate) fn evaluate_source(&self, source: &str) -> Result<(), Failure> {
        let result = self.context.with(|ctx| {
            ctx.eval::<Value, _>(source)
                .catch(&ctx)
                .map(|_| ())
                .map_err(|e| Failure::Thrown(describe(&e)))
        });
        self.discard_timers();
        result
    }

    /// Evaluate a fragment inside an async wrapper and settle it.
    ///
    /// The fragment is first tried as a single expression whose value is
    /// returned; if that does not parse it runs as a statement body, where an
    /// explicit `return` provides the result. Settled values cross back as
    /// JSON, `undefined` becoming `null`.
    pub(crate) fn evaluate_fragment(
        &self,
        code: &str,
        deadline: Option<Instant>,
    ) -> Result<serde_json::Value, Failure> {
        let result = self.context.with(|ctx| {
            let promise = start_fragment(&ctx, code)?;
            let settled = self.settle(&ctx, &promise, deadline)?;
            to_json(&ctx, settled)
        });
        self.discard_timers();
        result
    }

    fn settle<'js>(
        &self,
        ctx: &Ctx<'js>,
        promise: &Promise<'js>,
        deadline: Option<Instant>,
    ) -> Result<Value<'js>, Failure> {
        loop {
            if let Some(result) = promise.result::<Value>() {
                return result
                    .catch(ctx)
                    .map_err(|e| Failure::Thrown(describe(&e)));
            }
            if ctx.execute_pending_job() {
                continue;
            }
            if !self.fire_next_timer(ctx, deadline)? {
                return Err(Failure::Unsettled);
            }
        }
    }

    /// Sleep until the earliest timer is due and run it. `false` when none
    /// are queued.
    fn fire_next_timer(&self, ctx: &Ctx<'_>, deadline: Option<Instant>) -> Result<bool, Failure> {
        let Some((id, due)) = self.timers.borrow().next_due() else {
            return Ok(false);
        };
        if deadline.is_some_and(|d| due > d) {
            if let Some(wait) = deadline.and_then(|d| d.checked_duration_since(Instant::now())) {
                std::thread::sleep(wait);
            }
            return Err(Failure::DeadlineExceeded);
        }
        if let Some(wait) = due.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }

        let Some(callback) = self.timers.borrow_mut().take(id) else {
            return Ok(true);
        };
        let callback = callback
            .restore(ctx)
            .map_err(|e| Failure::Thrown(e.to_string()))?;
        if let Err(e) = callback.call::<_, Value>(()).catch(ctx) {
            tracing::warn!(timer = id, error = %describe(&e), "Timer callback threw");
        }
        Ok(true)
    }

    fn discard_timers(&self) {
        let dropped = self.timers.borrow_mut().clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Discarded timers left pending after evaluation");
        }
    }
}

// Persisted callbacks must be released before the context goes away.
impl Drop for SandboxContext {
    fn drop(&mut self) {
        self.timers.borrow_mut().clear();
    }
}

fn start_fragment<'js>(ctx: &Ctx<'js>, code: &str) -> Result<Promise<'js>, Failure> {
    let expression = code.trim().trim_end_matches(';');
    let as_expression = format!("(async () => {{\nreturn (\n{expression}\n);\n}})()");

    match ctx.eval::<Promise, _>(as_expression).catch(ctx) {
        Ok(promise) => Ok(promise),
        Err(e) if is_syntax_error(&e) => {
            let as_statements = format!("(async () => {{\n{code}\n}})()");
            ctx.eval::<Promise, _>(as_statements)
                .catch(ctx)
                .map_err(|e| Failure::Thrown(describe(&e)))
        }
        Err(e) => Err(Failure::Thrown(describe(&e))),
    }
}

fn to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<serde_json::Value, Failure> {
    let text = ctx
        .json_stringify(value)
        .catch(ctx)
        .map_err(|e| Failure::Thrown(format!("result is not JSON-serializable: {}", describe(&e))))?;
    let Some(text) = text else {
        return Ok(serde_json::Value::Null);
    };
    let text = text
        .to_string()
        .map_err(|e| Failure::Thrown(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| Failure::Thrown(e.to_string()))
}

fn is_syntax_error(error: &CaughtError<'_>) -> bool {
    match error {
        CaughtError::Exception(exception) => exception
            .as_object()
            .get::<_, String>("name")
            .is_ok_and(|name| name == "SyntaxError"),
        _ => false,
    }
}

fn describe(error: &CaughtError<'_>) -> String {
    match error {
        CaughtError::Exception(exception) => {
            let name = exception
                .as_object()
                .get::<_, String>("name")
                .unwrap_or_else(|_| "Error".into());
            match exception.message() {
                Some(message) => format!("{name}: {message}"),
                None => name,
            }
        }
        CaughtError::Value(value) => match value.get::<Coerced<String>>() {
            Ok(Coerced(text)) => format!("uncaught: {text}"),
            Err(_) => format!("uncaught {:?}", value.type_of()),
        },
        CaughtError::Error(e) => e.to_string(),
    }
}

fn join(args: Rest<Coerced<String>>) -> String {
    args.0
        .into_iter()
        .map(|arg| arg.0)
        .collect::<Vec<_>>()
        .join(" ")
}

fn install_console(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    console.set(
        "log",
        Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
            tracing::info!(target: "crossbridge::sandbox::console", "{}", join(args));
        })?,
    )?;
    console.set(
        "info",
        Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
            tracing::info!(target: "crossbridge::sandbox::console", "{}", join(args));
        })?,
    )?;
    console.set(
        "warn",
        Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
            tracing::warn!(target: "crossbridge::sandbox::console", "{}", join(args));
        })?,
    )?;
    console.set(
        "error",
        Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
            tracing::error!(target: "crossbridge::sandbox::console", "{}", join(args));
        })?,
    )?;
    ctx.globals().set("console", console)
}

fn install_timers<'js>(ctx: &Ctx<'js>, timers: Rc<RefCell<TimerQueue>>) -> rquickjs::Result<()> {
    let queue = timers.clone();
    let set_timeout = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, callback: Function<'js>, delay: Opt<Coerced<f64>>| -> u32 {
            let ms = delay
                .0
                .map(|d| d.0)
                .filter(|d| d.is_finite() && *d > 0.0)
                .unwrap_or(0.0);
            let due = Instant::now() + Duration::from_millis(ms as u64);
            queue
                .borrow_mut()
                .schedule(due, Persistent::save(&ctx, callback))
        },
    )?;

    let clear_timeout = Function::new(ctx.clone(), move |id: Opt<Coerced<f64>>| {
        if let Some(id) = id.0 {
            timers.borrow_mut().cancel(id.0 as u32);
        }
    })?;

    let globals = ctx.globals();
    globals.set("setTimeout", set_timeout)?;
    globals.set("clearTimeout", clear_timeout)
}

fn install_host_storage<'js>(ctx: &Ctx<'js>, storage: Arc<dyn StorageApi>) -> rquickjs::Result<()> {
    let native = Object::new(ctx.clone())?;

    let store = storage.clone();
    native.set(
        "createUser",
        Function::new(
            ctx.clone(),
            move |id: Coerced<String>, name: Coerced<String>, age: Coerced<f64>| {
                tracing::info!(id = %id.0, "HostStorage.createUser");
                store.create_user(&id.0, &name.0, age.0 as i64)
            },
        )?,
    )?;

    let store = storage.clone();
    native.set(
        "getUser",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, id: Coerced<String>| -> rquickjs::Result<String> {
                tracing::info!(id = %id.0, "HostStorage.getUser");
                store
                    .get_user(&id.0)
                    .map_err(|e| Exception::throw_message(&ctx, &e.to_string()))
            },
        )?,
    )?;

    let store = storage.clone();
    native.set(
        "updateUser",
        Function::new(ctx.clone(), move |id: Coerced<String>, age: Coerced<f64>| {
            tracing::info!(id = %id.0, "HostStorage.updateUser");
            store.update_user(&id.0, age.0 as i64)
        })?,
    )?;

    native.set(
        "deleteUser",
        Function::new(ctx.clone(), move |id: Coerced<String>| {
            tracing::info!(id = %id.0, "HostStorage.deleteUser");
            storage.delete_user(&id.0)
        })?,
    )?;

    let facade: Function = ctx.eval(HOST_STORAGE_FACADE)?;
    let host: Object = facade.call((native,))?;
    ctx.globals().set("HostStorage", host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbridge_core::MemoryStorage;

    fn context(storage: Option<Arc<dyn StorageApi>>) -> (Runtime, SandboxContext) {
        let runtime = Runtime::new().unwrap();
        let context = SandboxContext::build(&runtime, storage).unwrap();
        (runtime, context)
    }

    fn eval(context: &SandboxContext, code: &str) -> serde_json::Value {
        context.evaluate_fragment(code, None).unwrap()
    }

    #[test]
    fn expression_value_is_returned() {
        let (_rt, ctx) = context(None);
        assert_eq!(eval(&ctx, "1 + 2;"), serde_json::json!(3));
        assert_eq!(eval(&ctx, "({ a: [1, 'x'] })"), serde_json::json!({ "a": [1, "x"] }));
    }

    #[test]
    fn statement_body_uses_explicit_return() {
        let (_rt, ctx) = context(None);
        assert_eq!(eval(&ctx, "const x = 4;\nreturn x * x;"), serde_json::json!(16));
        assert_eq!(eval(&ctx, "let y = 1;"), serde_json::Value::Null);
    }

    #[test]
    fn undefined_becomes_null() {
        let (_rt, ctx) = context(None);
        assert_eq!(eval(&ctx, "undefined"), serde_json::Value::Null);
    }

    #[test]
    fn thrown_error_carries_name_and_message() {
        let (_rt, ctx) = context(None);
        let err = ctx
            .evaluate_fragment("throw new TypeError('nope')", None)
            .unwrap_err();
        match err {
            Failure::Thrown(msg) => assert_eq!(msg, "TypeError: nope"),
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[test]
    fn non_error_rejection_keeps_its_value() {
        let (_rt, ctx) = context(None);
        for (code, expected) in [
            ("await Promise.reject(42)", "uncaught: 42"),
            ("throw 'plain text'", "uncaught: plain text"),
        ] {
            match ctx.evaluate_fragment(code, None).unwrap_err() {
                Failure::Thrown(msg) => assert_eq!(msg, expected),
                other => panic!("unexpected failure: {other:?}"),
            }
        }
    }

    #[test]
    fn host_globals_are_absent_by_default() {
        let (_rt, ctx) = context(None);
        let globals = "[typeof require, typeof process, typeof fetch, typeof HostStorage]";
        assert_eq!(
            eval(&ctx, globals),
            serde_json::json!(["undefined", "undefined", "undefined", "undefined"])
        );
        assert_eq!(eval(&ctx, "typeof console.log"), serde_json::json!("function"));
    }

    #[test]
    fn timers_run_while_awaiting() {
        let (_rt, ctx) = context(None);
        let code = "await new Promise(resolve => setTimeout(() => resolve('tick'), 5))";
        assert_eq!(eval(&ctx, code), serde_json::json!("tick"));
    }

    #[test]
    fn cleared_timer_never_fires() {
        let (_rt, ctx) = context(None);
        let code = r#"
            let fired = false;
            const id = setTimeout(() => { fired = true; }, 1);
            clearTimeout(id);
            await new Promise(resolve => setTimeout(resolve, 10));
            return fired;
        "#;
        assert_eq!(eval(&ctx, code), serde_json::json!(false));
    }

    #[test]
    fn never_settling_promise_is_reported() {
        let (_rt, ctx) = context(None);
        let err = ctx
            .evaluate_fragment("await new Promise(() => {})", None)
            .unwrap_err();
        assert!(matches!(err, Failure::Unsettled));
    }

    #[test]
    fn timer_beyond_deadline_is_cut_short() {
        let (_rt, ctx) = context(None);
        let deadline = Instant::now() + Duration::from_millis(20);
        let err = ctx
            .evaluate_fragment(
                "await new Promise(resolve => setTimeout(resolve, 60000))",
                Some(deadline),
            )
            .unwrap_err();
        assert!(matches!(err, Failure::DeadlineExceeded));
    }

    #[test]
    fn host_storage_is_frozen_and_async() {
        let storage: Arc<dyn StorageApi> = Arc::new(MemoryStorage::new());
        let (_rt, ctx) = context(Some(storage.clone()));

        assert_eq!(
            eval(&ctx, "HostStorage.createUser('1', 'Ada', 36) instanceof Promise"),
            serde_json::json!(true)
        );
        assert_eq!(
            eval(&ctx, "JSON.parse(await HostStorage.getUser('1')).name"),
            serde_json::json!("Ada")
        );
        assert_eq!(
            eval(&ctx, "(HostStorage.getUser = null, typeof HostStorage.getUser)"),
            serde_json::json!("function")
        );
        assert!(storage.get_user("1").is_ok());
    }

    #[test]
    fn missing_user_rejects_inside_sandbox() {
        let storage: Arc<dyn StorageApi> = Arc::new(MemoryStorage::new());
        let (_rt, ctx) = context(Some(storage));
        let code = r#"
            try { await HostStorage.getUser('ghost'); return 'found'; }
            catch (e) { return e.message; }
        "#;
        let message = eval(&ctx, code);
        assert!(message.as_str().unwrap().contains("ghost"));
    }

    #[test]
    fn source_functions_persist_in_globals() {
        let (_rt, ctx) = context(None);
        ctx.evaluate_source("function add(a, b) { return a + b; }")
            .unwrap();
        assert_eq!(eval(&ctx, "add(2, 3)"), serde_json::json!(5));
    }
}
