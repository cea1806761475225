use crate::command::{CommandQueues, Method, PendingRequest, Request, Response, ResponseBody};
use crate::node::NodeContext;
use crate::operations::{
    ConnectPeerOperation, ConnectPeerOperationRequest, GetContentOperation,
    GetContentOperationRequest, PostContributionOperation, PostContributionOperationRequest,
    QueryContributionsOperation,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const BENCHMARK_DISABLED_NOTICE: &str = "Benchmark is not enabled, use --benchmark to do so";

/// Serves command requests one at a time, in arrival order.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<NodeContext>,
    get: GetContentOperation,
    post: PostContributionOperation,
    connect: ConnectPeerOperation,
    query: QueryContributionsOperation,
}

impl Dispatcher {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            get: GetContentOperation::new(ctx.clone()),
            post: PostContributionOperation::new(ctx.clone()),
            connect: ConnectPeerOperation::new(ctx.clone()),
            query: QueryContributionsOperation::new(ctx.clone()),
            ctx,
        }
    }

    /// Answer every request with exactly one response until the request queue
    /// closes or the node shuts down. A request already being handled runs to
    /// completion; requests still queued at shutdown are dropped.
    pub fn spawn(self, mut queues: CommandQueues) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let PendingRequest { request, reply } = tokio::select! {
                    biased;
                    _ = self.ctx.shutdown.cancelled() => break,
                    pending = queues.requests.recv() => match pending {
                        Some(pending) => pending,
                        None => break,
                    },
                };

                let method = request.method;
                let response = self.handle(request).await;

                if let Err(error) = &response {
                    tracing::warn!(method = %method, "Request failed: {}", error);
                }
                if reply.send(response).is_err() {
                    tracing::debug!(method = %method, "Caller went away before the response");
                }
            }
            tracing::debug!("Command dispatcher stopped");
        })
    }

    pub async fn handle(&self, request: Request) -> Response {
        request.check_args()?;
        tracing::debug!(method = %request.method, "Dispatching request");

        let Request { method, mut args } = request;
        match method {
            Method::Get => {
                let locator = args.remove(0);
                let result = self
                    .get
                    .run(GetContentOperationRequest {
                        locator: locator.clone(),
                    })
                    .await?;
                Ok(ResponseBody::Message(format!(
                    "stored {} successfully under {}",
                    locator,
                    result.destination.display()
                )))
            }
            Method::Post => {
                let payload = Bytes::from(args.remove(0).into_bytes());
                let result = self
                    .post
                    .run(PostContributionOperationRequest { payload })
                    .await?;
                Ok(ResponseBody::Message(format!(
                    "File uploaded as {}",
                    result.contribution.content_ref
                )))
            }
            Method::Connect => {
                let address = args.remove(0);
                let result = self
                    .connect
                    .run(ConnectPeerOperationRequest { address })
                    .await?;
                Ok(ResponseBody::Message(format!(
                    "Connected to peer {}",
                    result.peer
                )))
            }
            Method::Query => {
                let result = self.query.run().await?;
                if result.skipped > 0 {
                    tracing::info!("Query skipped {} undecodable entries", result.skipped);
                }
                Ok(ResponseBody::Contributions(result.contributions))
            }
            Method::Benchmark => {
                if !self.ctx.options.benchmark {
                    return Ok(ResponseBody::Notice(BENCHMARK_DISABLED_NOTICE.to_string()));
                }
                let report = self.ctx.benchmark()?.report();
                Ok(ResponseBody::Benchmark(report))
            }
        }
    }
}
