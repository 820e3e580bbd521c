// Content Script Compiler
//
// Turns a validated manifest's content_scripts into injectable units: loads
// each script file, maps run_at to an injection time, picks the world and
// wraps the source in a URL guard built from the declaration's match patterns.

use super::extension::{BrowserExtension, ContentScriptLoadingError, ResourceLoader};
use super::manifest::{ContentScriptDeclaration, RunAt, ScriptWorld};
use super::match_pattern::MatchPattern;
use super::types::{ContentWorld, InjectableScript, InjectionTime};
use crate::logging::ExtensionLogger;
use std::rc::Rc;

/// Build an injectable script. No validation.
pub fn create_user_script(
    source: &str,
    injection_time: InjectionTime,
    for_main_frame_only: bool,
    world: ContentWorld,
) -> InjectableScript {
    InjectableScript {
        source: source.to_string(),
        injection_time,
        for_main_frame_only,
        world,
    }
}

/// Seam for constructing injectable scripts
pub trait UserScriptFactory {
    fn create_user_script(
        &self,
        source: &str,
        injection_time: InjectionTime,
        for_main_frame_only: bool,
        world: ContentWorld,
    ) -> InjectableScript;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultUserScriptFactory;

impl UserScriptFactory for DefaultUserScriptFactory {
    fn create_user_script(
        &self,
        source: &str,
        injection_time: InjectionTime,
        for_main_frame_only: bool,
        world: ContentWorld,
    ) -> InjectableScript {
        create_user_script(source, injection_time, for_main_frame_only, world)
    }
}

/// Map a manifest `run_at` to an engine hook. Idle has no engine hook of its
/// own and runs at document end.
pub fn injection_time_for(run_at: &RunAt) -> InjectionTime {
    match run_at {
        RunAt::DocumentStart => InjectionTime::AtDocumentStart,
        _ => InjectionTime::AtDocumentEnd,
    }
}

fn regex_array(patterns: &[String]) -> String {
    let entries: Vec<String> = patterns
        .iter()
        .filter_map(|raw| MatchPattern::parse(raw).ok())
        .map(|pattern| {
            let source = serde_json::Value::String(pattern.js_regex_source().to_string());
            format!("new RegExp({source})")
        })
        .collect();
    format!("[{}]", entries.join(", "))
}

/// Wrap `source` so it only runs on pages whose URL the declaration matches.
///
/// The guard is an `if` block rather than a function so top-level `var`
/// declarations still land on the world's global object.
pub fn wrap_in_url_guard(source: &str, declaration: &ContentScriptDeclaration) -> String {
    format!(
        r#"if ((function () {{
  const href = String((globalThis.location && globalThis.location.href) || "");
  const matches = {matches};
  const excludes = {excludes};
  return matches.some((r) => r.test(href)) && !excludes.some((r) => r.test(href));
}})()) {{
{source}
}}
"#,
        matches = regex_array(&declaration.matches),
        excludes = regex_array(&declaration.exclude_matches),
    )
}

/// Produces the injectable units for one extension's content scripts
pub struct ContentScriptCompiler {
    factory: Rc<dyn UserScriptFactory>,
    loader: Rc<dyn ResourceLoader>,
    logger: Rc<ExtensionLogger>,
}

impl ContentScriptCompiler {
    pub fn new(
        factory: Rc<dyn UserScriptFactory>,
        loader: Rc<dyn ResourceLoader>,
        logger: Rc<ExtensionLogger>,
    ) -> Self {
        Self { factory, loader, logger }
    }

    /// One injectable per `js` file, declarations and files in manifest order
    pub fn compile(
        &self,
        extension: &BrowserExtension,
    ) -> Result<Vec<InjectableScript>, ContentScriptLoadingError> {
        self.logger.in_context(&format!("Compile content scripts for {}", extension.id()), || {
            let extension_world = ContentWorld::for_extension(&extension.id());
            let mut scripts = Vec::new();

            for resource in extension.load_content_scripts(self.loader.as_ref())? {
                let declaration = &resource.config;
                let world = match declaration.world {
                    ScriptWorld::Main => ContentWorld::Page,
                    ScriptWorld::Isolated => extension_world.clone(),
                };
                let injection_time = injection_time_for(&declaration.run_at);

                for (path, source) in declaration.js.iter().zip(&resource.js_content) {
                    self.logger.debug(format!(
                        "{path}: {:?} in {world}, main frame only: {}",
                        injection_time,
                        declaration.for_main_frame_only()
                    ));
                    scripts.push(self.factory.create_user_script(
                        &wrap_in_url_guard(source, declaration),
                        injection_time,
                        declaration.for_main_frame_only(),
                        world.clone(),
                    ));
                }
            }

            Ok(scripts)
        })
    }
}
