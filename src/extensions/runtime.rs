// Extension Runtime - QuickJS render surface
//
// A headless `RenderSurface` backed by one QuickJS runtime:
// - One context per content world, so globals never leak between worlds
// - `__ext_post` queues page-to-host messages for `run_until_idle`
// - Navigation evaluates the page's inline scripts between the document-start
//   and document-end user scripts
// - Awaited scripts settle through a continuation adapter keyed by call token

use super::continuation::{CompletionError, ContinuationAdapter};
use super::types::{
    CallToken, ContentWorld, InjectableScript, InjectionTime, MessageHandler, NavigationDelegate,
    NavigationError, NavigationToken, RenderSurface, ScriptError, ScriptMessage, SurfaceId,
};
use crate::config::ShimConfig;
use crate::logging::ExtensionLogger;
use anyhow::Result;
use log::Level;
use regex::Regex;
use rquickjs::{Context, Ctx, Function, Runtime};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

const INLINE_SCRIPT_PATTERN: &str = r"(?is)<script\b([^>]*)>(.*?)</script\s*>";
const SRC_ATTRIBUTE_PATTERN: &str = r"(?i)\bsrc\s*=";

const BLANK_PAGE: &str = "about:blank";

const SETTLE_OK: &str = "ok";
const SETTLE_UNSERIALIZABLE: &str = "unserializable";

const CONSOLE_SHIM: &str = r#"
globalThis.window = globalThis;
globalThis.__ext_describe = function (error) {
  try {
    return String(error && error.message !== undefined ? error.message : error);
  } catch (e) {
    return "uncaught exception";
  }
};
globalThis.console = (function () {
  function format(args) {
    return Array.prototype.map.call(args, function (a) {
      if (typeof a === "string") {
        return a;
      }
      try {
        return JSON.stringify(a);
      } catch (e) {
        return String(a);
      }
    }).join(" ");
  }
  return {
    log: function () { __ext_console("info", format(arguments)); },
    info: function () { __ext_console("info", format(arguments)); },
    debug: function () { __ext_console("debug", format(arguments)); },
    warn: function () { __ext_console("warn", format(arguments)); },
    error: function () { __ext_console("error", format(arguments)); }
  };
})();
"#;

type NavigationOutcome = std::result::Result<(), NavigationError>;

/// Headless render surface backed by QuickJS
pub struct QuickJsSurface {
    id: SurfaceId,
    config: ShimConfig,
    logger: Rc<ExtensionLogger>,
    // Contexts must drop before the runtime that owns them
    worlds: RefCell<HashMap<ContentWorld, Context>>,
    user_scripts: RefCell<Vec<InjectableScript>>,
    handlers: RefCell<HashMap<(String, ContentWorld), Rc<dyn MessageHandler>>>,
    delegate: RefCell<Option<Weak<dyn NavigationDelegate>>>,
    outbox: Rc<RefCell<VecDeque<ScriptMessage>>>,
    navigation_events: RefCell<VecDeque<(NavigationToken, NavigationOutcome)>>,
    location: RefCell<Option<Url>>,
    calls: Rc<ContinuationAdapter<CallToken, Value, ScriptError>>,
    next_navigation: Cell<u64>,
    next_call: Cell<u64>,
    closed: Cell<bool>,
    runtime: Runtime,
}

impl QuickJsSurface {
    pub fn new(config: &ShimConfig, logger: Rc<ExtensionLogger>) -> Result<Rc<Self>> {
        let runtime = Runtime::new()?;
        let id = SurfaceId(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed));
        logger.debug(format!("Created QuickJS surface {id}"));

        Ok(Rc::new(Self {
            id,
            config: config.clone(),
            logger,
            worlds: RefCell::new(HashMap::new()),
            user_scripts: RefCell::new(Vec::new()),
            handlers: RefCell::new(HashMap::new()),
            delegate: RefCell::new(None),
            outbox: Rc::new(RefCell::new(VecDeque::new())),
            navigation_events: RefCell::new(VecDeque::new()),
            location: RefCell::new(None),
            calls: Rc::new(ContinuationAdapter::new("script", config.script_timeout())),
            next_navigation: Cell::new(1),
            next_call: Cell::new(1),
            closed: Cell::new(false),
            runtime,
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Current document URL, if a page with a base URL has been rendered
    pub fn location(&self) -> Option<Url> {
        self.location.borrow().clone()
    }

    /// Run `body` as the body of an async function in `world` and wait for
    /// the returned promise to settle.
    pub async fn call_async_javascript(
        &self,
        body: &str,
        world: &ContentWorld,
    ) -> std::result::Result<Value, CompletionError<ScriptError>> {
        if self.is_closed() {
            return Err(CompletionError::Engine(ScriptError::SurfaceClosed));
        }

        let token = CallToken(self.next_call.get());
        self.next_call.set(token.0 + 1);
        let pending = self.calls.arm(token);

        let script = format!(
            r#"(async function () {{
{body}
}})().then(
  function (value) {{
    let json;
    try {{
      json = JSON.stringify(value);
    }} catch (e) {{
      __ext_settle("{id}", "unserializable", __ext_describe(e));
      return;
    }}
    __ext_settle("{id}", "ok", json === undefined ? "null" : json);
  }},
  function (error) {{ __ext_settle("{id}", "error", __ext_describe(error)); }}
);
undefined;"#,
            id = token.0,
        );
        if let Err(e) = self.run_script(&script, world) {
            self.calls.fail(&token, e);
        }

        self.run_until_idle();
        let result = pending.wait().await;
        if result.is_err() {
            self.calls.prune_abandoned();
        }
        result
    }

    /// Close the surface. Awaited calls fail with `TornDown` and queued
    /// navigations are reported as cancelled.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.logger.debug(format!("Closing {}", self.id));

        self.calls.tear_down();
        self.outbox.borrow_mut().clear();
        for (_, outcome) in self.navigation_events.borrow_mut().iter_mut() {
            *outcome = Err(NavigationError::Cancelled);
        }
        self.handlers.borrow_mut().clear();
        self.user_scripts.borrow_mut().clear();
        self.worlds.borrow_mut().clear();
    }

    fn world_context(&self, world: &ContentWorld) -> std::result::Result<Context, ScriptError> {
        if let Some(context) = self.worlds.borrow().get(world) {
            return Ok(context.clone());
        }

        let context = self.create_world(world)?;
        self.worlds
            .borrow_mut()
            .insert(world.clone(), context.clone());
        Ok(context)
    }

    fn create_world(&self, world: &ContentWorld) -> std::result::Result<Context, ScriptError> {
        let context = Context::full(&self.runtime).map_err(|e| ScriptError::Exception(e.to_string()))?;
        let location = self.location.borrow().clone();

        context.with(|ctx| {
            self.install_natives(&ctx, world)
                .and_then(|_| ctx.eval::<(), _>(CONSOLE_SHIM))
                .and_then(|_| ctx.eval::<(), _>(document_script(location.as_ref())))
                .map_err(|e| ScriptError::Exception(describe_error(&ctx, e)))
        })?;

        self.logger.debug(format!("Created world {world} in {}", self.id));
        Ok(context)
    }

    fn install_natives<'js>(&self, ctx: &Ctx<'js>, world: &ContentWorld) -> rquickjs::Result<()> {
        let globals = ctx.globals();

        let outbox = Rc::clone(&self.outbox);
        let post_world = world.clone();
        let post_logger = Rc::clone(&self.logger);
        globals.set(
            "__ext_post",
            Function::new(ctx.clone(), move |name: String, json: String| {
                match serde_json::from_str::<Value>(&json) {
                    Ok(body) => outbox.borrow_mut().push_back(ScriptMessage {
                        name,
                        world: post_world.clone(),
                        body,
                    }),
                    Err(e) => post_logger.warn(format!("Dropped unparseable message to {name}: {e}")),
                }
            })?,
        )?;

        let calls = Rc::clone(&self.calls);
        globals.set(
            "__ext_settle",
            Function::new(ctx.clone(), move |token: String, status: String, payload: String| {
                let Ok(raw) = token.parse::<u64>() else {
                    return;
                };
                let token = CallToken(raw);
                match status.as_str() {
                    SETTLE_OK => match serde_json::from_str::<Value>(&payload) {
                        Ok(value) => calls.succeed(&token, value),
                        Err(e) => calls.fail(&token, ScriptError::Serialization(e.to_string())),
                    },
                    SETTLE_UNSERIALIZABLE => calls.fail(&token, ScriptError::Serialization(payload)),
                    _ => calls.fail(&token, ScriptError::Exception(payload)),
                };
            })?,
        )?;

        let forward = self.config.forward_console;
        let console_logger = Rc::clone(&self.logger);
        let console_world = world.to_string();
        globals.set(
            "__ext_console",
            Function::new(ctx.clone(), move |level: String, text: String| {
                if !forward {
                    return;
                }
                let level = match level.as_str() {
                    "error" => Level::Error,
                    "warn" => Level::Warn,
                    "debug" => Level::Debug,
                    _ => Level::Info,
                };
                console_logger.log(level, format!("console[{console_world}]: {text}"));
            })?,
        )?;

        Ok(())
    }

    fn eval_in(&self, source: &str, world: &ContentWorld) -> std::result::Result<Value, ScriptError> {
        let context = self.world_context(world)?;
        context.with(|ctx| {
            let value = ctx
                .eval::<rquickjs::Value, _>(source)
                .map_err(|e| ScriptError::Exception(describe_error(&ctx, e)))?;
            to_json(&ctx, value)
        })
    }

    fn inject_user_scripts(&self, injection_time: InjectionTime) {
        let scripts: Vec<InjectableScript> = self
            .user_scripts
            .borrow()
            .iter()
            .filter(|s| s.injection_time == injection_time)
            .cloned()
            .collect();

        for script in scripts {
            if let Err(e) = self.eval_in(&script.source, &script.world) {
                self.logger
                    .warn(format!("User script in {} threw at {:?}: {e}", script.world, injection_time));
            }
        }
    }

    fn set_ready_state(&self, state: &str) {
        let contexts: Vec<Context> = self.worlds.borrow().values().cloned().collect();
        let script = format!("document.readyState = {};", Value::String(state.to_string()));
        for context in contexts {
            context.with(|ctx| {
                if let Err(e) = ctx.eval::<(), _>(script.as_str()) {
                    self.logger
                        .debug(format!("Could not set readyState to {state}: {}", describe_error(&ctx, e)));
                }
            });
        }
    }

    fn load_document(&self, html: &str) -> NavigationOutcome {
        // A new document starts with fresh globals in every world
        self.worlds.borrow_mut().clear();
        self.world_context(&ContentWorld::Page)
            .map_err(|e| NavigationError::LoadFailed(e.to_string()))?;

        let inline_script =
            Regex::new(INLINE_SCRIPT_PATTERN).map_err(|e| NavigationError::LoadFailed(e.to_string()))?;
        let src_attribute =
            Regex::new(SRC_ATTRIBUTE_PATTERN).map_err(|e| NavigationError::LoadFailed(e.to_string()))?;

        self.inject_user_scripts(InjectionTime::AtDocumentStart);

        for capture in inline_script.captures_iter(html) {
            let attributes = capture.get(1).map_or("", |m| m.as_str());
            if src_attribute.is_match(attributes) {
                self.logger.debug("Skipping external <script src>");
                continue;
            }
            let source = capture.get(2).map_or("", |m| m.as_str());
            if let Err(e) = self.eval_in(source, &ContentWorld::Page) {
                self.logger.warn(format!("Page script threw: {e}"));
            }
        }

        self.set_ready_state("interactive");
        self.inject_user_scripts(InjectionTime::AtDocumentEnd);
        self.set_ready_state("complete");
        Ok(())
    }
}

impl RenderSurface for QuickJsSurface {
    fn surface_id(&self) -> SurfaceId {
        self.id
    }

    fn render_html(&self, html: &str, base_url: Option<&Url>) -> NavigationToken {
        let token = NavigationToken(self.next_navigation.get());
        self.next_navigation.set(token.0 + 1);

        let outcome = if self.is_closed() {
            Err(NavigationError::Cancelled)
        } else {
            *self.location.borrow_mut() = base_url.cloned();
            self.logger.in_context(&format!("{token}"), || self.load_document(html))
        };

        self.navigation_events.borrow_mut().push_back((token, outcome));
        token
    }

    fn run_script(&self, source: &str, world: &ContentWorld) -> std::result::Result<Value, ScriptError> {
        if self.is_closed() {
            return Err(ScriptError::SurfaceClosed);
        }
        self.eval_in(source, world)
    }

    fn set_navigation_delegate(&self, delegate: Weak<dyn NavigationDelegate>) {
        *self.delegate.borrow_mut() = Some(delegate);
    }

    fn add_user_script(&self, script: InjectableScript) {
        if self.is_closed() {
            return;
        }
        self.user_scripts.borrow_mut().push(script);
    }

    fn remove_all_user_scripts(&self) {
        self.user_scripts.borrow_mut().clear();
    }

    fn register_message_handler(&self, name: &str, world: &ContentWorld, handler: Rc<dyn MessageHandler>) {
        if self.is_closed() {
            return;
        }
        self.handlers
            .borrow_mut()
            .insert((name.to_string(), world.clone()), handler);
    }

    fn remove_message_handler(&self, name: &str, world: &ContentWorld) {
        self.handlers
            .borrow_mut()
            .remove(&(name.to_string(), world.clone()));
    }

    fn has_message_handler(&self, name: &str, world: &ContentWorld) -> bool {
        self.handlers
            .borrow()
            .contains_key(&(name.to_string(), world.clone()))
    }

    fn run_until_idle(&self) {
        loop {
            let mut progressed = false;

            loop {
                match self.runtime.execute_pending_job() {
                    Ok(true) => progressed = true,
                    Ok(false) => break,
                    Err(_) => {
                        self.logger.warn("A pending JavaScript job threw");
                        progressed = true;
                    }
                }
            }

            let message = self.outbox.borrow_mut().pop_front();
            if let Some(message) = message {
                let handler = self
                    .handlers
                    .borrow()
                    .get(&(message.name.clone(), message.world.clone()))
                    .cloned();
                match handler {
                    Some(handler) => handler.did_receive(message),
                    None => self
                        .logger
                        .debug(format!("No handler for {} in {}", message.name, message.world)),
                }
                continue;
            }

            let event = self.navigation_events.borrow_mut().pop_front();
            if let Some((token, outcome)) = event {
                let delegate = self.delegate.borrow().as_ref().and_then(Weak::upgrade);
                if let Some(delegate) = delegate {
                    match outcome {
                        Ok(()) => delegate.did_finish(token),
                        Err(error) => delegate.did_fail(token, error),
                    }
                }
                continue;
            }

            if !progressed {
                break;
            }
        }
    }
}

impl Drop for QuickJsSurface {
    fn drop(&mut self) {
        self.calls.tear_down();
        self.worlds.get_mut().clear();
    }
}

fn document_script(location: Option<&Url>) -> String {
    let href = location.map_or(BLANK_PAGE, |u| u.as_str());
    let (protocol, hostname, host, pathname, search, hash) = match location {
        Some(url) => (
            format!("{}:", url.scheme()),
            url.host_str().unwrap_or("").to_string(),
            match (url.host_str(), url.port()) {
                (Some(h), Some(p)) => format!("{h}:{p}"),
                (Some(h), None) => h.to_string(),
                _ => String::new(),
            },
            url.path().to_string(),
            url.query().map(|q| format!("?{q}")).unwrap_or_default(),
            url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
        ),
        None => ("about:".to_string(), String::new(), String::new(), "blank".to_string(), String::new(), String::new()),
    };
    let location = serde_json::json!({
        "href": href,
        "protocol": protocol,
        "host": host,
        "hostname": hostname,
        "pathname": pathname,
        "search": search,
        "hash": hash,
    });

    format!(
        "globalThis.location = Object.freeze({location});\n\
         globalThis.document = {{ readyState: \"loading\", URL: {href} }};",
        href = Value::String(href.to_string()),
    )
}

/// Pull the message out of a pending JavaScript exception
fn describe_error(ctx: &Ctx<'_>, error: rquickjs::Error) -> String {
    if !error.is_exception() {
        return error.to_string();
    }
    let caught = ctx.catch();
    if let Some(exception) = caught.as_exception() {
        return exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string());
    }
    caught
        .as_string()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| "uncaught exception".to_string())
}

fn to_json<'js>(ctx: &Ctx<'js>, value: rquickjs::Value<'js>) -> std::result::Result<Value, ScriptError> {
    if value.is_undefined() {
        return Ok(Value::Null);
    }
    let json = match ctx.json_stringify(value) {
        Ok(Some(json)) => json
            .to_string()
            .map_err(|e| ScriptError::Serialization(e.to_string()))?,
        Ok(None) => return Ok(Value::Null),
        Err(e) => return Err(ScriptError::Serialization(describe_error(ctx, e))),
    };
    serde_json::from_str(&json).map_err(|e| ScriptError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::api::{generate_api_javascript, invoke_callback_script, REQUEST_HANDLER_NAME};
    use crate::extensions::bridge::RuntimeApiBridge;
    use crate::extensions::content_script::DefaultUserScriptFactory;
    use crate::extensions::extension::BrowserExtension;
    use crate::extensions::manifest::ExtensionManifest;
    use crate::extensions::navigation::NavigationHandler;
    use crate::extensions::user_content::UserContentManager;
    use std::time::Duration;

    fn logger() -> Rc<ExtensionLogger> {
        let _ = env_logger::builder().is_test(true).try_init();
        ExtensionLogger::new("test")
    }

    fn surface() -> Rc<QuickJsSurface> {
        QuickJsSurface::new(&ShimConfig::default(), logger()).unwrap()
    }

    fn user_script(source: &str, injection_time: InjectionTime, world: ContentWorld) -> InjectableScript {
        InjectableScript {
            source: source.to_string(),
            injection_time,
            for_main_frame_only: false,
            world,
        }
    }

    async fn load(surface: &Rc<QuickJsSurface>, html: &str, base_url: Option<&str>) {
        let handler = NavigationHandler::attach(surface.as_ref(), None, logger());
        let base_url = base_url.map(|u| Url::parse(u).unwrap());
        handler
            .load_html(surface.as_ref(), html, base_url.as_ref())
            .await
            .unwrap();
    }

    /// Answers every API request with a fixed error, optionally twice
    struct FailingHandler {
        surface: Weak<QuickJsSurface>,
        replies: usize,
    }

    impl MessageHandler for FailingHandler {
        fn did_receive(&self, message: ScriptMessage) {
            let Some(surface) = self.surface.upgrade() else { return };
            let request_id = message.body["requestId"].as_str().unwrap().to_string();
            for _ in 0..self.replies {
                surface
                    .run_script(&invoke_callback_script(&request_id, &Value::Null, Some("nope")), &message.world)
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_run_script_returns_json() {
        let surface = surface();
        let page = ContentWorld::Page;

        assert_eq!(surface.run_script("1 + 2", &page), Ok(serde_json::json!(3)));
        assert_eq!(
            surface.run_script("({ a: [1, 'x'] })", &page),
            Ok(serde_json::json!({ "a": [1, "x"] }))
        );
        assert_eq!(surface.run_script("undefined", &page), Ok(Value::Null));
        assert_eq!(
            surface.run_script("throw new Error('boom')", &page),
            Err(ScriptError::Exception("boom".to_string()))
        );
    }

    #[test]
    fn test_worlds_do_not_share_globals() {
        let surface = surface();
        let isolated = ContentWorld::Named("Extension-test".to_string());

        surface.run_script("globalThis.secret = 42", &isolated).unwrap();
        assert_eq!(surface.run_script("globalThis.secret", &isolated), Ok(serde_json::json!(42)));
        assert_eq!(
            surface.run_script("typeof globalThis.secret", &ContentWorld::Page),
            Ok(serde_json::json!("undefined"))
        );
    }

    #[tokio::test]
    async fn test_render_runs_scripts_in_order() {
        let surface = surface();
        surface.add_user_script(user_script(
            "globalThis.order = ['start:' + document.readyState];",
            InjectionTime::AtDocumentStart,
            ContentWorld::Page,
        ));
        surface.add_user_script(user_script(
            "order.push('end:' + document.readyState);",
            InjectionTime::AtDocumentEnd,
            ContentWorld::Page,
        ));

        let html = "<html><script>order.push('inline');</script><script src=\"x.js\"></script></html>";
        load(&surface, html, Some("https://example.com/page?q=1")).await;

        assert_eq!(
            surface.run_script("order", &ContentWorld::Page),
            Ok(serde_json::json!(["start:loading", "inline", "end:interactive"]))
        );
        assert_eq!(
            surface.run_script("[location.hostname, location.search, document.readyState]", &ContentWorld::Page),
            Ok(serde_json::json!(["example.com", "?q=1", "complete"]))
        );
    }

    #[tokio::test]
    async fn test_navigation_resets_globals() {
        let surface = surface();
        load(&surface, "<script>globalThis.first = true;</script>", None).await;
        load(&surface, "", None).await;

        assert_eq!(
            surface.run_script("typeof first", &ContentWorld::Page),
            Ok(serde_json::json!("undefined"))
        );
        assert_eq!(surface.run_script("location.href", &ContentWorld::Page), Ok(serde_json::json!("about:blank")));
    }

    #[tokio::test]
    async fn test_get_id_resolves_in_page() {
        let logger = logger();
        let surface = surface();
        let as_dyn: Rc<dyn RenderSurface> = surface.clone();
        let manager = UserContentManager::new(&as_dyn, Rc::new(DefaultUserScriptFactory), logger.clone());
        let extension = BrowserExtension::new(
            ExtensionManifest::new(3, "Runtime Test", "1.0"),
            Url::parse("file:///ext/").unwrap(),
            &logger,
        );
        let bridge = RuntimeApiBridge::new(&extension, logger.clone());
        assert_eq!(bridge.inject_runtime_apis(&manager), Ok(true));

        load(&surface, "<html><body>Hello</body></html>", None).await;

        let id = extension.id().to_string();
        let page = ContentWorld::Page;
        assert_eq!(
            surface
                .call_async_javascript("return await new Promise(r => chrome.runtime.getId(r));", &page)
                .await,
            Ok(Value::String(id.clone()))
        );
        assert_eq!(
            surface.call_async_javascript("return await chrome.runtime.getId();", &page).await,
            Ok(Value::String(id.clone()))
        );
        assert_eq!(
            surface.run_script("[chrome.runtime.id, browser === chrome]", &page),
            Ok(serde_json::json!([id, true]))
        );

        let info = surface
            .call_async_javascript("return await chrome.runtime.getPlatformInfo();", &page)
            .await
            .unwrap();
        assert!(info["os"].is_string());
        assert!(info["nacl_arch"].is_string());
    }

    #[tokio::test]
    async fn test_page_world_keeps_its_first_extension() {
        let logger = logger();
        let surface = surface();
        let as_dyn: Rc<dyn RenderSurface> = surface.clone();
        let manager = UserContentManager::new(&as_dyn, Rc::new(DefaultUserScriptFactory), logger.clone());
        let extension = |name: &str| {
            BrowserExtension::new(
                ExtensionManifest::new(3, name, "1.0"),
                Url::parse("file:///ext/").unwrap(),
                &logger,
            )
        };
        let first = extension("First");
        let second = extension("Second");

        assert_eq!(RuntimeApiBridge::new(&first, logger.clone()).inject_runtime_apis(&manager), Ok(true));
        assert!(RuntimeApiBridge::new(&second, logger.clone())
            .inject_runtime_apis(&manager)
            .is_err());

        load(&surface, "<html></html>", None).await;

        let id = first.id().to_string();
        let page = ContentWorld::Page;
        assert_eq!(surface.run_script("chrome.runtime.id", &page), Ok(Value::String(id.clone())));
        assert_eq!(
            surface.call_async_javascript("return await chrome.runtime.getId();", &page).await,
            Ok(Value::String(id))
        );
    }

    #[tokio::test]
    async fn test_unserializable_results_settle() {
        let config = ShimConfig {
            script_timeout_ms: Some(2_000),
            ..ShimConfig::default()
        };
        let surface = QuickJsSurface::new(&config, logger()).unwrap();
        let page = ContentWorld::Page;

        assert_eq!(
            surface.call_async_javascript("return function () {};", &page).await,
            Ok(Value::Null)
        );
        assert_eq!(surface.call_async_javascript("return Symbol('s');", &page).await, Ok(Value::Null));
        assert!(matches!(
            surface.call_async_javascript("return 10n;", &page).await,
            Err(CompletionError::Engine(ScriptError::Serialization(_)))
        ));
        assert!(matches!(
            surface
                .call_async_javascript("return { toJSON() { throw new Error('no json'); } };", &page)
                .await,
            Err(CompletionError::Engine(ScriptError::Serialization(message))) if message == "no json"
        ));
    }

    #[tokio::test]
    async fn test_last_error_and_rejection() {
        let surface = surface();
        surface.add_user_script(user_script(
            &generate_api_javascript("ext"),
            InjectionTime::AtDocumentStart,
            ContentWorld::Page,
        ));
        surface.register_message_handler(
            REQUEST_HANDLER_NAME,
            &ContentWorld::Page,
            Rc::new(FailingHandler {
                surface: Rc::downgrade(&surface),
                replies: 1,
            }),
        );
        load(&surface, "", None).await;
        let page = ContentWorld::Page;

        let seen = surface
            .call_async_javascript(
                "const seen = await new Promise(r => chrome.runtime.getId(() => r(chrome.runtime.lastError.message)));\n\
                 return { seen: seen, after: chrome.runtime.lastError === undefined };",
                &page,
            )
            .await;
        assert_eq!(seen, Ok(serde_json::json!({ "seen": "nope", "after": true })));

        let rejected = surface
            .call_async_javascript(
                "try { await chrome.runtime.getId(); return 'resolved'; } catch (e) { return e.message; }",
                &page,
            )
            .await;
        assert_eq!(rejected, Ok(serde_json::json!("nope")));
    }

    #[tokio::test]
    async fn test_unchecked_last_error_warns() {
        let surface = surface();
        surface.add_user_script(user_script(
            &generate_api_javascript("ext"),
            InjectionTime::AtDocumentStart,
            ContentWorld::Page,
        ));
        surface.register_message_handler(
            REQUEST_HANDLER_NAME,
            &ContentWorld::Page,
            Rc::new(FailingHandler {
                surface: Rc::downgrade(&surface),
                replies: 1,
            }),
        );
        load(&surface, "", None).await;

        let warnings = surface
            .call_async_javascript(
                "const warnings = [];\n\
                 console.warn = function (text) { warnings.push(text); };\n\
                 await new Promise(r => chrome.runtime.getId(() => r()));\n\
                 await new Promise(r => chrome.runtime.getId(() => { r(chrome.runtime.lastError); }));\n\
                 return warnings;",
                &ContentWorld::Page,
            )
            .await;
        assert_eq!(warnings, Ok(serde_json::json!(["Unchecked runtime.lastError: nope"])));
    }

    #[tokio::test]
    async fn test_duplicate_reply_invokes_callback_once() {
        let surface = surface();
        // Installed twice on purpose; the second copy is a no-op
        for _ in 0..2 {
            surface.add_user_script(user_script(
                &generate_api_javascript("ext"),
                InjectionTime::AtDocumentStart,
                ContentWorld::Page,
            ));
        }
        surface.register_message_handler(
            REQUEST_HANDLER_NAME,
            &ContentWorld::Page,
            Rc::new(FailingHandler {
                surface: Rc::downgrade(&surface),
                replies: 2,
            }),
        );
        load(&surface, "", None).await;

        let calls = surface
            .call_async_javascript(
                "globalThis.calls = 0;\n\
                 await new Promise(r => chrome.runtime.getId(() => { calls += 1; r(); }));\n\
                 await Promise.resolve();\n\
                 return calls;",
                &ContentWorld::Page,
            )
            .await;
        assert_eq!(calls, Ok(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn test_script_exception_is_reported() {
        let surface = surface();
        assert_eq!(
            surface
                .call_async_javascript("throw new Error('bad page');", &ContentWorld::Page)
                .await,
            Err(CompletionError::Engine(ScriptError::Exception("bad page".to_string())))
        );
    }

    #[tokio::test]
    async fn test_unsettled_call_times_out() {
        let config = ShimConfig {
            script_timeout_ms: Some(20),
            ..ShimConfig::default()
        };
        let surface = QuickJsSurface::new(&config, logger()).unwrap();

        assert_eq!(
            surface
                .call_async_javascript("await new Promise(() => {});", &ContentWorld::Page)
                .await,
            Err(CompletionError::TimedOut(Duration::from_millis(20)))
        );
    }

    #[tokio::test]
    async fn test_close_tears_down_pending_calls() {
        let config = ShimConfig {
            script_timeout_ms: None,
            ..ShimConfig::default()
        };
        let surface = QuickJsSurface::new(&config, logger()).unwrap();

        let (result, _) = tokio::join!(
            surface.call_async_javascript("await new Promise(() => {});", &ContentWorld::Page),
            async {
                tokio::task::yield_now().await;
                surface.close();
            }
        );
        assert_eq!(result, Err(CompletionError::TornDown));
        assert_eq!(
            surface.run_script("1", &ContentWorld::Page),
            Err(ScriptError::SurfaceClosed)
        );
        assert_eq!(
            surface
                .call_async_javascript("return 1;", &ContentWorld::Page)
                .await,
            Err(CompletionError::Engine(ScriptError::SurfaceClosed))
        );
    }
}
