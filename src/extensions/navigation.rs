// Navigation Handler
//
// Bridges the engine's two navigation callbacks into an awaitable load. The
// token returned by `render_html` is armed before control goes back to the
// engine, so the finish event can never arrive for an unarmed token.

use super::continuation::{CompletionError, ContinuationAdapter};
use super::types::{NavigationDelegate, NavigationError, NavigationToken, RenderSurface};
use crate::logging::ExtensionLogger;
use std::rc::Rc;
use std::time::Duration;
use url::Url;

pub struct NavigationHandler {
    adapter: ContinuationAdapter<NavigationToken, (), NavigationError>,
    logger: Rc<ExtensionLogger>,
}

impl NavigationHandler {
    /// Create a handler and install it as `surface`'s navigation delegate
    pub fn attach(surface: &dyn RenderSurface, timeout: Option<Duration>, logger: Rc<ExtensionLogger>) -> Rc<Self> {
        let handler = Rc::new(Self {
            adapter: ContinuationAdapter::new("navigation", timeout),
            logger,
        });
        let delegate: Rc<dyn NavigationDelegate> = handler.clone();
        surface.set_navigation_delegate(Rc::downgrade(&delegate));
        handler
    }

    /// Load `html` and wait for the engine to report the outcome
    pub async fn load_html(
        &self,
        surface: &dyn RenderSurface,
        html: &str,
        base_url: Option<&Url>,
    ) -> Result<(), CompletionError<NavigationError>> {
        let token = surface.render_html(html, base_url);
        self.logger.debug(format!("Started {token} on {}", surface.surface_id()));
        let pending = self.adapter.arm(token);

        surface.run_until_idle();
        let result = pending.wait().await;
        if let Err(e) = &result {
            self.logger.warn(format!("{token} did not finish: {e}"));
            self.adapter.prune_abandoned();
        }
        result
    }

    pub fn pending_navigations(&self) -> usize {
        self.adapter.len()
    }

    /// Fail every in-flight navigation with `TornDown`
    pub fn tear_down(&self) {
        self.adapter.tear_down();
    }
}

impl NavigationDelegate for NavigationHandler {
    fn did_finish(&self, token: NavigationToken) {
        self.adapter.succeed(&token, ());
    }

    fn did_fail(&self, token: NavigationToken, error: NavigationError) {
        self.adapter.fail(&token, error);
    }
}
