//! The execution chain: user middleware wrapping two built-in terminal
//! stages (resolve handler from the registry, then invoke it).
//!
//! Modeled as nested middleware in the manner described in the design
//! notes: each middleware receives a `next` it must explicitly invoke to
//! let the rest of the chain run. `next` carries a cheap `Arc` clone of the
//! chain rather than a borrow, which sidesteps the self-referential
//! lifetime that a borrowed recursive "next" would otherwise require.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::job::JobPayload;
use crate::shutdown::ShutdownSignal;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The per-invocation context threaded through the chain. User middleware
/// may stash arbitrary typed state here between stages via [`insert`]/[`get`].
///
/// [`insert`]: JobContext::insert
/// [`get`]: JobContext::get
pub struct JobContext {
    pub job: JobPayload,
    pub signal: ShutdownSignal,
    extensions: http::Extensions,
}

impl JobContext {
    pub fn new(job: JobPayload, signal: ShutdownSignal) -> Self {
        Self {
            job,
            signal,
            extensions: http::Extensions::new(),
        }
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.extensions.insert(value)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get()
    }
}

/// What a registered handler produced: either the call itself was the whole
/// unit of work, or it returned a continuation to invoke with the context.
pub enum HandlerResult {
    Direct,
    Continuation(Box<dyn FnOnce(&mut JobContext) -> BoxFuture<'_, Result<()>> + Send>),
}

type HandlerFuture = BoxFuture<'static, Result<HandlerResult>>;
type HandlerFn = dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync;

/// Maps `jobtype` to a handler. A handler is polymorphic over returning a
/// direct completion or a continuation; see [`HandlerResult`].
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<HandlerFn>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `jobtype`. `f` receives the job's positional
    /// `args` and returns a [`HandlerResult`].
    pub fn register<F, Fut>(&mut self, jobtype: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerResult>> + Send + 'static,
    {
        let boxed: Arc<HandlerFn> = Arc::new(move |args| Box::pin(f(args)) as HandlerFuture);
        self.handlers.insert(jobtype.into(), boxed);
    }

    /// Convenience for handlers that always complete directly (never return
    /// a continuation).
    pub fn register_direct<F, Fut>(&mut self, jobtype: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(jobtype, move |args| {
            let fut = f(args);
            async move {
                fut.await?;
                Ok(HandlerResult::Direct)
            }
        });
    }

    fn get(&self, jobtype: &str) -> Option<Arc<HandlerFn>> {
        self.handlers.get(jobtype).cloned()
    }
}

/// A single middleware stage. Must call `next.run(ctx)` to let later stages
/// (including the terminal handler invocation) run; omitting that call
/// silently skips execution, matching the documented upstream behavior.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, ctx: &mut JobContext, next: Next) -> Result<()>;
}

struct ChainInner {
    middleware: Vec<Arc<dyn Middleware>>,
    registry: Registry,
}

/// A built chain: user middleware composed with the two terminal stages.
/// Built once before the fetch loop starts.
#[derive(Clone)]
pub struct Chain {
    inner: Arc<ChainInner>,
}

impl Chain {
    pub fn new(middleware: Vec<Arc<dyn Middleware>>, registry: Registry) -> Self {
        Self {
            inner: Arc::new(ChainInner {
                middleware,
                registry,
            }),
        }
    }

    pub async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        run_at(self.inner.clone(), 0, ctx).await
    }
}

/// A handle a middleware stage calls to run the rest of the chain.
pub struct Next {
    chain: Arc<ChainInner>,
    index: usize,
}

impl Next {
    pub fn run(self, ctx: &mut JobContext) -> BoxFuture<'_, Result<()>> {
        run_at(self.chain, self.index, ctx)
    }
}

fn run_at(chain: Arc<ChainInner>, index: usize, ctx: &mut JobContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        if let Some(mw) = chain.middleware.get(index).cloned() {
            let next = Next {
                chain: chain.clone(),
                index: index + 1,
            };
            mw.call(ctx, next).await
        } else {
            terminal(&chain.registry, ctx).await
        }
    })
}

/// Resolve `ctx.job.jobtype` in the registry and invoke it; if the result is
/// a continuation, invoke that too.
async fn terminal(registry: &Registry, ctx: &mut JobContext) -> Result<()> {
    let jobtype = ctx.job.jobtype.clone();
    let handler = registry
        .get(&jobtype)
        .ok_or_else(|| Error::UnknownJobType(jobtype))?;
    let args = ctx.job.args().to_vec();

    match handler(args).await? {
        HandlerResult::Direct => Ok(()),
        HandlerResult::Continuation(cont) => cont(ctx).await,
    }
}
