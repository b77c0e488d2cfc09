use crate::dispatch::EffectContext;
use crate::model::Request;
use std::collections::HashMap;
use std::sync::Arc;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

/// Application callback bound to one command code.
///
/// A handler either answers exactly once through the context (`respond`) or
/// hands a durational effect to the scheduler (`schedule`), which answers on
/// its behalf. Returning `Err` (or panicking) before answering makes the
/// dispatcher answer `Retry`; after answering it is only logged.
pub trait EffectHandler<S>: Send + Sync {
    fn handle(&self, ctx: &mut EffectContext<'_, S>, request: &Request) -> HandlerResult;
}

impl<S, F> EffectHandler<S> for F
where
    F: Fn(&mut EffectContext<'_, S>, &Request) -> HandlerResult + Send + Sync,
{
    fn handle(&self, ctx: &mut EffectContext<'_, S>, request: &Request) -> HandlerResult {
        self(ctx, request)
    }
}

/// Command code to handler map. Built once at startup, read-only afterwards.
pub struct HandlerRegistry<S> {
    handlers: HashMap<String, Arc<dyn EffectHandler<S>>>,
}

impl<S> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S: 'static> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `code` to `handler`, replacing any earlier binding.
    pub fn register<H>(&mut self, code: impl Into<String>, handler: H) -> &mut Self
    where
        H: EffectHandler<S> + 'static,
    {
        let code = code.into();
        if self.handlers.insert(code.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(code = %code, "effect handler replaced");
        }
        self
    }

    /// Closure-friendly `register`.
    pub fn register_fn<F>(&mut self, code: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut EffectContext<'_, S>, &Request) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(code, handler)
    }

    pub fn get(&self, code: &str) -> Option<Arc<dyn EffectHandler<S>>> {
        self.handlers.get(code).cloned()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.handlers.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered codes, sorted.
    pub fn codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }
}
