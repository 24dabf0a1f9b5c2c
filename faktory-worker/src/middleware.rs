//! A ready-made middleware that logs job start/finish via a tracing span.
//! Not wired in by default; opt in via [`crate::facade::use_middleware`] or
//! by passing [`logging`] directly to `Chain::new`.

use std::sync::Arc;

use faktory_common::chain::{JobContext, Middleware, Next};
use faktory_common::Result;
use tracing::Instrument;

pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    async fn call(&self, ctx: &mut JobContext, next: Next) -> Result<()> {
        let jid = ctx.job.jid().to_owned();
        let jobtype = ctx.job.jobtype.clone();
        let span = tracing::info_span!("job", %jid, %jobtype);

        async move {
            tracing::debug!("starting job");
            let result = next.run(ctx).await;
            match &result {
                Ok(()) => tracing::debug!("job finished"),
                Err(e) => tracing::debug!(error = %e, "job errored"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

pub fn logging() -> Arc<dyn Middleware> {
    Arc::new(LoggingMiddleware)
}
