// Extension API JavaScript generator
//
// Describes the page-visible `chrome.*` namespaces as data and renders them to
// the JavaScript that is injected at document start. Every async function
// funnels through `__ext_request`, which posts `{requestId, api, args}` to the
// host and parks a callback or a promise until `__EXT_invokeCallback__`
// delivers the reply.

use serde_json::Value;

/// Message handler name the page posts API requests to
pub const REQUEST_HANDLER_NAME: &str = "requestBrowserExtension";

/// Page function the host calls to deliver a reply
pub const INVOKE_CALLBACK_FUNCTION: &str = "__EXT_invokeCallback__";

/// An async API function. The trailing callback parameter is implicit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncFunction {
    pub name: &'static str,
    pub args: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Member {
    /// Read-only data property
    Constant { name: &'static str, value: String },
    Function(AsyncFunction),
    /// Getter for `lastError`, only set while a failed call's callback runs.
    /// A callback that never reads it triggers a console warning.
    LastError,
}

/// One `chrome.<name>` object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub name: &'static str,
    pub members: Vec<Member>,
}

fn js_string(raw: &str) -> String {
    Value::String(raw.to_string()).to_string()
}

impl Namespace {
    pub fn function_names(&self) -> Vec<&'static str> {
        self.members
            .iter()
            .filter_map(|m| match m {
                Member::Function(f) => Some(f.name),
                _ => None,
            })
            .collect()
    }

    /// Render as statements that build and freeze `chrome.<name>`
    pub fn to_js(&self) -> String {
        let functions: Vec<String> = self
            .members
            .iter()
            .filter_map(|m| match m {
                Member::Function(f) => Some(render_function(f)),
                _ => None,
            })
            .collect();

        let mut lines = vec![format!("  const {} = {{", self.name)];
        lines.push(functions.join(",\n"));
        lines.push("  };".to_string());

        for member in &self.members {
            match member {
                Member::Constant { name, value } => lines.push(format!(
                    "  Object.defineProperty({ns}, {name}, {{ value: {value}, writable: false, configurable: false, enumerable: true }});",
                    ns = self.name,
                    name = js_string(name),
                    value = js_string(value),
                )),
                Member::LastError => lines.push(format!(
                    "  Object.defineProperty({}, \"lastError\", {{ get: __ext_readLastError, enumerable: true }});",
                    self.name
                )),
                Member::Function(_) => {}
            }
        }

        lines.push(format!("  Object.freeze({});", self.name));
        lines.push(format!("  chrome.{0} = {0};", self.name));
        lines.join("\n")
    }
}

fn render_function(function: &AsyncFunction) -> String {
    let mut params: Vec<&str> = function.args.clone();
    params.push("callback");
    let args: Vec<String> = function
        .args
        .iter()
        .map(|a| format!("{a}: {a}"))
        .collect();

    format!(
        "    {name}({params}) {{\n      return __ext_request({api}, {{ {args} }}, callback);\n    }}",
        name = function.name,
        params = params.join(", "),
        api = js_string(function.name),
        args = args.join(", "),
    )
}

/// `chrome.runtime` for one extension
pub fn runtime_namespace(extension_id: &str) -> Namespace {
    Namespace {
        name: "runtime",
        members: vec![
            Member::Constant {
                name: "id",
                value: extension_id.to_string(),
            },
            Member::Function(AsyncFunction {
                name: "getId",
                args: vec![],
            }),
            Member::Function(AsyncFunction {
                name: "getPlatformInfo",
                args: vec![],
            }),
            Member::LastError,
        ],
    }
}

const PRELUDE: &str = r#"  const __ext_callbackMap = new Map();
  let __ext_lastError = undefined;
  let __ext_lastErrorChecked = false;
  let __ext_counter = 0;

  function __ext_randomString() {
    __ext_counter += 1;
    return Date.now().toString(36) + "-" + __ext_counter.toString(36) + "-" + Math.random().toString(36).slice(2);
  }

  function __ext_readLastError() {
    __ext_lastErrorChecked = true;
    return __ext_lastError;
  }

  function __ext_request(api, args, callback) {
    const requestId = __ext_randomString();
    const message = JSON.stringify({ requestId: requestId, api: api, args: args });
    if (typeof callback === "function") {
      __ext_callbackMap.set(requestId, { callback: callback });
      __ext_post("requestBrowserExtension", message);
      return undefined;
    }
    return new Promise(function (resolve, reject) {
      __ext_callbackMap.set(requestId, { resolve: resolve, reject: reject });
      __ext_post("requestBrowserExtension", message);
    });
  }

  Object.defineProperty(globalThis, "__EXT_invokeCallback__", {
    value: function (requestId, result, error) {
      const entry = __ext_callbackMap.get(requestId);
      if (!entry) {
        return false;
      }
      __ext_callbackMap.delete(requestId);
      if (entry.callback) {
        if (error != null) {
          __ext_lastError = { message: String(error) };
          __ext_lastErrorChecked = false;
          try {
            entry.callback();
          } finally {
            const unchecked = !__ext_lastErrorChecked;
            __ext_lastError = undefined;
            if (unchecked) {
              console.warn("Unchecked runtime.lastError: " + String(error));
            }
          }
        } else {
          entry.callback(result);
        }
      } else if (error != null) {
        entry.reject(new Error(String(error)));
      } else {
        entry.resolve(result);
      }
      return true;
    },
    writable: false,
    configurable: false
  });

  const chrome = globalThis.chrome || {};"#;

/// The full document-start script for one extension.
///
/// Installing it twice in the same world is a no-op the second time.
pub fn generate_api_javascript(extension_id: &str) -> String {
    let runtime = runtime_namespace(extension_id);
    format!(
        r#"(function () {{
  if (globalThis.__ext_installed) {{
    return;
  }}
  Object.defineProperty(globalThis, "__ext_installed", {{ value: true, writable: false, configurable: false }});

{PRELUDE}

{runtime}

  globalThis.chrome = chrome;
  globalThis.browser = chrome;
}})();
"#,
        runtime = runtime.to_js(),
    )
}

/// Script that delivers a host reply to the page
pub fn invoke_callback_script(request_id: &str, result: &Value, error: Option<&str>) -> String {
    let error = error.map(js_string).unwrap_or_else(|| "null".to_string());
    format!(
        "{INVOKE_CALLBACK_FUNCTION}({}, {}, {})",
        js_string(request_id),
        result,
        error
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_namespace_members() {
        let runtime = runtime_namespace("abc");
        assert_eq!(runtime.function_names(), vec!["getId", "getPlatformInfo"]);
        assert!(runtime.members.contains(&Member::LastError));
    }

    #[test]
    fn test_generated_script_shape() {
        let js = generate_api_javascript("1b4e28ba-2fa1-11d2-883f-0016d3cca427");

        assert!(js.starts_with("(function () {"));
        assert!(js.contains("if (globalThis.__ext_installed)"));
        assert!(js.contains("getId(callback) {"));
        assert!(js.contains(r#"return __ext_request("getId", {  }, callback);"#));
        assert!(js.contains(r#"value: "1b4e28ba-2fa1-11d2-883f-0016d3cca427""#));
        assert!(js.contains("chrome.runtime = runtime;"));
        assert!(js.contains("globalThis.browser = chrome;"));
        assert!(js.contains(r#"Object.defineProperty(runtime, "lastError", { get: __ext_readLastError"#));
        assert!(js.contains("Unchecked runtime.lastError: "));
        assert!(js.contains(REQUEST_HANDLER_NAME));
        assert!(js.contains(INVOKE_CALLBACK_FUNCTION));
    }

    #[test]
    fn test_function_arguments_are_forwarded() {
        let js = render_function(&AsyncFunction {
            name: "sendMessage",
            args: vec!["extensionId", "message"],
        });
        assert!(js.contains("sendMessage(extensionId, message, callback) {"));
        assert!(js.contains(r#"__ext_request("sendMessage", { extensionId: extensionId, message: message }, callback)"#));
    }

    #[test]
    fn test_constants_are_escaped() {
        let ns = Namespace {
            name: "runtime",
            members: vec![Member::Constant {
                name: "id",
                value: "quote\"d".to_string(),
            }],
        };
        assert!(ns.to_js().contains(r#"value: "quote\"d""#));
    }

    #[test]
    fn test_invoke_callback_script() {
        assert_eq!(
            invoke_callback_script("r-1", &Value::String("id".to_string()), None),
            r#"__EXT_invokeCallback__("r-1", "id", null)"#
        );
        assert_eq!(
            invoke_callback_script("r-2", &Value::Null, Some("Unknown API: nope")),
            r#"__EXT_invokeCallback__("r-2", null, "Unknown API: nope")"#
        );
    }
}
