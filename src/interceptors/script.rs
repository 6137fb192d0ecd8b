//! Interceptor script compilation and invocation
//!
//! Scripts are compiled once by the loader and invoked on blocking
//! threads by the runner. Each invocation gets a fresh engine wired to a
//! kill flag; when a timeout fires, the flag terminates the script at its
//! next progress checkpoint. The compiled AST is engine-independent and
//! shared between invocations.

use crate::interceptors::context::{self, HandlerContext};
use rhai::{Dynamic, Engine, FnPtr, ImmutableString, Map, Scope, AST};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A response object produced by a handler: a mock, or an override of the
/// upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptResponse {
    pub status: u16,
    /// Lowercased names. `None` leaves the upstream headers untouched on
    /// the modify path and sends no extra headers on the mock path.
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<Vec<u8>>,
}

/// Classification of a handler's return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseShape {
    /// `()`: the handler produced nothing.
    Absent,
    Valid(ScriptResponse),
    Invalid(String),
}

#[derive(Debug, Clone)]
enum Callable {
    /// Top-level script function, called by name.
    Named(String),
    /// Function pointer from the exported `interceptors` list.
    Ptr(FnPtr),
}

/// One loaded interceptor. Selection is "first match wins" in loader
/// order; the runner never mutates these.
#[derive(Debug, Clone)]
pub struct Interceptor {
    pub name: String,
    /// Script file name the interceptor came from.
    pub source_file: String,
    ast: Arc<AST>,
    handler: Callable,
    matcher: Option<Callable>,
}

impl Interceptor {
    /// Whether the interceptor has a `matches` selector. Without one it
    /// is selected unconditionally.
    pub fn has_matcher(&self) -> bool {
        self.matcher.is_some()
    }
}

/// Compiles scripts and runs matcher/handler invocations.
pub struct ScriptHost {
    compile_engine: Engine,
}

impl Default for ScriptHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptHost {
    pub fn new() -> Self {
        Self {
            compile_engine: build_engine(None),
        }
    }

    /// Compile a script file and resolve its interceptor entries.
    ///
    /// A file either defines a top-level `handler` (optional `matches`,
    /// optional exported `name`) or exports an `interceptors` array of
    /// maps carrying `handler` / `matches` function pointers.
    pub fn compile(&self, path: &Path) -> Result<Vec<Interceptor>, String> {
        let source =
            std::fs::read_to_string(path).map_err(|e| format!("failed to read script: {e}"))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let file_stem = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());

        let ast = self
            .compile_engine
            .compile(&source)
            .map_err(|e| format!("compile error: {e}"))?;

        // Top-level statements run here, once per (re)load.
        let module = rhai::Module::eval_ast_as_new(Scope::new(), &ast, &self.compile_engine)
            .map_err(|e| format!("evaluation error: {e}"))?;

        let ast = Arc::new(ast);

        if let Some(list) = module.get_var_value::<rhai::Array>("interceptors") {
            return resolve_list(&file_name, &file_stem, &ast, list);
        }

        let mut has_handler = false;
        let mut has_matcher = false;
        for func in ast.iter_functions() {
            match (func.name, func.params.len()) {
                ("handler", 1) => has_handler = true,
                ("handler", n) => {
                    return Err(format!("handler must take 1 argument, found {n}"));
                }
                ("matches", 1) => has_matcher = true,
                ("matches", n) => {
                    return Err(format!("matches must take 1 argument, found {n}"));
                }
                _ => {}
            }
        }
        if !has_handler {
            return Err("script does not define a handler function".to_string());
        }

        let name = module
            .get_var_value::<ImmutableString>("name")
            .map(|s| s.to_string())
            .unwrap_or(file_stem);

        Ok(vec![Interceptor {
            name,
            source_file: file_name,
            ast,
            handler: Callable::Named("handler".to_string()),
            matcher: has_matcher.then(|| Callable::Named("matches".to_string())),
        }])
    }

    /// Run an interceptor's `matches` against a request snapshot map.
    ///
    /// Must only be called when [`Interceptor::has_matcher`] is true.
    pub fn call_matcher(
        &self,
        interceptor: &Interceptor,
        request: Map,
        kill: Arc<AtomicBool>,
    ) -> Result<bool, String> {
        let matcher = interceptor
            .matcher
            .as_ref()
            .ok_or_else(|| "interceptor has no matcher".to_string())?;
        let engine = build_engine(Some(kill));
        let result = invoke(&engine, &interceptor.ast, matcher, Dynamic::from_map(request))
            .map_err(|e| e.to_string())?;

        if result.is_unit() {
            return Ok(false);
        }
        result
            .as_bool()
            .map_err(|actual| format!("matches must return a boolean, found {actual}"))
    }

    /// Run an interceptor's handler with the given context.
    pub fn call_handler(
        &self,
        interceptor: &Interceptor,
        ctx: HandlerContext,
        kill: Arc<AtomicBool>,
    ) -> Result<Dynamic, String> {
        let engine = build_engine(Some(kill));
        invoke(&engine, &interceptor.ast, &interceptor.handler, Dynamic::from(ctx))
            .map_err(|e| e.to_string())
    }
}

fn invoke(
    engine: &Engine,
    ast: &AST,
    callable: &Callable,
    arg: Dynamic,
) -> Result<Dynamic, Box<rhai::EvalAltResult>> {
    match callable {
        Callable::Named(name) => engine.call_fn::<Dynamic>(&mut Scope::new(), ast, name, (arg,)),
        Callable::Ptr(ptr) => ptr.call::<Dynamic>(engine, ast, (arg,)),
    }
}

fn resolve_list(
    file_name: &str,
    file_stem: &str,
    ast: &Arc<AST>,
    list: rhai::Array,
) -> Result<Vec<Interceptor>, String> {
    let mut out = Vec::with_capacity(list.len());
    for (index, entry) in list.into_iter().enumerate() {
        let map = entry
            .try_cast::<Map>()
            .ok_or_else(|| format!("interceptors[{index}] is not a map"))?;

        let handler = map
            .get("handler")
            .cloned()
            .and_then(|d| d.try_cast::<FnPtr>())
            .ok_or_else(|| format!("interceptors[{index}] has no callable handler"))?;

        let matcher = match map.get("matches").cloned() {
            None => None,
            Some(d) if d.is_unit() => None,
            Some(d) => Some(
                d.try_cast::<FnPtr>()
                    .ok_or_else(|| format!("interceptors[{index}].matches is not callable"))?,
            ),
        };

        let name = map
            .get("name")
            .cloned()
            .and_then(|d| d.try_cast::<ImmutableString>())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{file_stem}[{index}]"));

        out.push(Interceptor {
            name,
            source_file: file_name.to_string(),
            ast: ast.clone(),
            handler: Callable::Ptr(handler),
            matcher: matcher.map(Callable::Ptr),
        });
    }
    Ok(out)
}

/// Build an engine with the context API registered and, for invocations,
/// a kill flag checked at every progress step.
fn build_engine(kill: Option<Arc<AtomicBool>>) -> Engine {
    let mut engine = Engine::new();
    context::register_api(&mut engine);
    if let Some(kill) = kill {
        engine.on_progress(move |_| {
            if kill.load(Ordering::Acquire) {
                Some("terminated".into())
            } else {
                None
            }
        });
    }
    engine
}

/// Classify a handler's return value.
pub fn parse_script_response(value: &Dynamic) -> ResponseShape {
    if value.is_unit() {
        return ResponseShape::Absent;
    }
    let Some(map) = value.read_lock::<Map>() else {
        return ResponseShape::Invalid(format!(
            "handler returned {}, expected a response map or ()",
            value.type_name()
        ));
    };

    let status = match map.get("status").and_then(|d| d.as_int().ok()) {
        Some(code) if (100..=599).contains(&code) => code as u16,
        Some(code) => {
            return ResponseShape::Invalid(format!("status {code} outside [100, 599]"));
        }
        None => {
            return ResponseShape::Invalid("response map has no integer status".to_string());
        }
    };

    let headers = match map.get("headers") {
        None => None,
        Some(d) if d.is_unit() => None,
        Some(d) => match d.read_lock::<Map>() {
            Some(headers) => {
                let mut out = HashMap::with_capacity(headers.len());
                for (name, value) in headers.iter() {
                    let Some(value) = header_value(value) else {
                        return ResponseShape::Invalid(format!(
                            "header {name} has non-scalar value"
                        ));
                    };
                    out.insert(name.to_lowercase(), value);
                }
                Some(out)
            }
            None => {
                return ResponseShape::Invalid("headers is not a map".to_string());
            }
        },
    };

    let body = match map.get("body") {
        None => None,
        Some(d) if d.is_unit() => None,
        Some(d) if d.is_blob() => d.clone().try_cast::<rhai::Blob>().map(Vec::from),
        Some(d) if d.is_string() => d
            .clone()
            .into_immutable_string()
            .ok()
            .map(|s| s.as_bytes().to_vec()),
        Some(d) => {
            return ResponseShape::Invalid(format!(
                "body is {}, expected a string or blob",
                d.type_name()
            ));
        }
    };

    ResponseShape::Valid(ScriptResponse {
        status,
        headers,
        body,
    })
}

fn header_value(value: &Dynamic) -> Option<String> {
    if value.is_string() {
        value.clone().into_immutable_string().ok().map(|s| s.to_string())
    } else if value.is_int() || value.is_bool() || value.is_float() {
        Some(value.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_script(dir: &tempfile::TempDir, name: &str, source: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(source.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_compile_top_level_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            &dir,
            "mock.rhai",
            r#"
                export const name = "mock-test";

                fn matches(request) {
                    request.path == "/api/test"
                }

                fn handler(ctx) {
                    #{ status: 200, body: `{"mocked":true}` }
                }
            "#,
        );
        let host = ScriptHost::new();
        let interceptors = host.compile(&path).unwrap();
        assert_eq!(interceptors.len(), 1);
        assert_eq!(interceptors[0].name, "mock-test");
        assert!(interceptors[0].has_matcher());
    }

    #[test]
    fn test_name_defaults_to_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "observer.rhai", "fn handler(ctx) { }");
        let host = ScriptHost::new();
        let interceptors = host.compile(&path).unwrap();
        assert_eq!(interceptors[0].name, "observer");
        assert!(!interceptors[0].has_matcher());
    }

    #[test]
    fn test_missing_handler_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "bad.rhai", "fn matches(request) { true }");
        let host = ScriptHost::new();
        let err = host.compile(&path).unwrap_err();
        assert!(err.contains("handler"), "got: {err}");
    }

    #[test]
    fn test_compile_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "syntax.rhai", "fn handler(ctx) {");
        let host = ScriptHost::new();
        assert!(host.compile(&path).unwrap_err().contains("compile error"));
    }

    #[test]
    fn test_list_form_resolves_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            &dir,
            "multi.rhai",
            r#"
                export const interceptors = [
                    #{ name: "first", matches: |r| r.path == "/a", handler: |ctx| () },
                    #{ handler: |ctx| #{ status: 204 } },
                ];
            "#,
        );
        let host = ScriptHost::new();
        let interceptors = host.compile(&path).unwrap();
        assert_eq!(interceptors.len(), 2);
        assert_eq!(interceptors[0].name, "first");
        assert!(interceptors[0].has_matcher());
        assert_eq!(interceptors[1].name, "multi[1]");
        assert!(!interceptors[1].has_matcher());
    }

    #[test]
    fn test_matcher_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            &dir,
            "m.rhai",
            r#"
                fn matches(request) { request.path == "/api/test" }
                fn handler(ctx) { }
            "#,
        );
        let host = ScriptHost::new();
        let interceptor = host.compile(&path).unwrap().remove(0);

        let mut request = Map::new();
        request.insert("path".into(), "/api/test".into());
        let hit = host
            .call_matcher(&interceptor, request, Arc::new(AtomicBool::new(false)))
            .unwrap();
        assert!(hit);

        let mut request = Map::new();
        request.insert("path".into(), "/other".into());
        let miss = host
            .call_matcher(&interceptor, request, Arc::new(AtomicBool::new(false)))
            .unwrap();
        assert!(!miss);
    }

    #[test]
    fn test_kill_flag_terminates_runaway_matcher() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            &dir,
            "spin.rhai",
            r#"
                fn matches(request) { loop { } }
                fn handler(ctx) { }
            "#,
        );
        let host = ScriptHost::new();
        let interceptor = host.compile(&path).unwrap().remove(0);

        let kill = Arc::new(AtomicBool::new(true));
        let err = host
            .call_matcher(&interceptor, Map::new(), kill)
            .unwrap_err();
        assert!(err.contains("terminated") || err.contains("Terminat"), "got: {err}");
    }

    #[test]
    fn test_parse_script_response_shapes() {
        assert_eq!(parse_script_response(&Dynamic::UNIT), ResponseShape::Absent);

        let mut map = Map::new();
        map.insert("status".into(), Dynamic::from(200_i64));
        map.insert("body".into(), Dynamic::from("ok"));
        let shape = parse_script_response(&Dynamic::from_map(map));
        let ResponseShape::Valid(response) = shape else {
            panic!("expected valid shape");
        };
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_deref(), Some(b"ok".as_slice()));
        assert!(response.headers.is_none());

        let mut bad_status = Map::new();
        bad_status.insert("status".into(), Dynamic::from(731_i64));
        assert!(matches!(
            parse_script_response(&Dynamic::from_map(bad_status)),
            ResponseShape::Invalid(_)
        ));

        assert!(matches!(
            parse_script_response(&Dynamic::from(42_i64)),
            ResponseShape::Invalid(_)
        ));
    }

    #[test]
    fn test_parse_script_response_lowercases_headers() {
        let mut headers = Map::new();
        headers.insert("X-Intercepted".into(), Dynamic::from("true"));
        headers.insert("x-count".into(), Dynamic::from(3_i64));
        let mut map = Map::new();
        map.insert("status".into(), Dynamic::from(200_i64));
        map.insert("headers".into(), Dynamic::from_map(headers));

        let ResponseShape::Valid(response) = parse_script_response(&Dynamic::from_map(map)) else {
            panic!("expected valid shape");
        };
        let headers = response.headers.unwrap();
        assert_eq!(headers.get("x-intercepted").map(String::as_str), Some("true"));
        assert_eq!(headers.get("x-count").map(String::as_str), Some("3"));
    }
}
