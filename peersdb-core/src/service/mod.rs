//! Background tasks of a running node and their lifecycle.

pub mod bootstrap;
pub mod dispatcher;
pub mod ingest;
pub mod replication;
pub mod responder;

pub use dispatcher::{BENCHMARK_DISABLED_NOTICE, Dispatcher};

use crate::benchmark::spawn_sampler;
use crate::command::CommandQueues;
use crate::constants::VALIDATION_TOPIC;
use crate::error::{PeersError, Result};
use crate::node::NodeContext;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A started node: one task per subscription stream plus the dispatcher.
pub struct NodeService {
    ctx: Arc<NodeContext>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl NodeService {
    /// Establish every subscription, resolve the persisted store, then spawn
    /// the tasks. A subscription that cannot be established shuts the node down.
    pub async fn start(ctx: Arc<NodeContext>, queues: CommandQueues) -> Result<Self> {
        let inbox = match ctx.transport.subscribe(ctx.peer_id.inbox_topic()).await {
            Ok(subscription) => subscription,
            Err(error) => return Err(fail(&ctx, "Cannot subscribe to inbox topic", error)),
        };
        let requests = match ctx.transport.subscribe(VALIDATION_TOPIC).await {
            Ok(subscription) => subscription,
            Err(error) => return Err(fail(&ctx, "Cannot subscribe to validation topic", error)),
        };
        let connectedness = match ctx.transport.connectedness_events() {
            Ok(events) => events,
            Err(error) => return Err(fail(&ctx, "Cannot watch peer connectedness", error)),
        };
        let write_events = ctx.logs.subscribe();
        let replicated_events = ctx.logs.subscribe();

        if bootstrap::open_persisted(&ctx).await? {
            tracing::info!("Contributions store resolved at startup");
        }

        let mut tasks = vec![
            ("bootstrap-inbound", bootstrap::spawn_inbound(ctx.clone(), inbox)),
            ("bootstrap-outbound", bootstrap::spawn_outbound(ctx.clone(), connectedness)),
            ("ingest", ingest::spawn(ctx.clone(), write_events)),
            ("responder", responder::spawn(ctx.clone(), requests)),
            ("replication", replication::spawn(ctx.clone(), replicated_events)),
            ("dispatcher", Dispatcher::new(ctx.clone()).spawn(queues)),
        ];
        if ctx.options.benchmark {
            tasks.push(("sampler", spawn_sampler(ctx.benchmark.clone(), ctx.shutdown.clone())));
        }

        tracing::info!(peer = %ctx.peer_id, tasks = tasks.len(), "Node service started");
        Ok(Self { ctx, tasks })
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Resolves once shutdown was requested, by a signal or a fatal error.
    pub async fn stopped(&self) {
        self.ctx.shutdown.cancelled().await
    }

    /// Stop every task, flush node state and the benchmark, then close the logs.
    pub async fn shutdown(self) -> Result<()> {
        self.ctx.shutdown.cancel();

        for (name, task) in self.tasks {
            if let Err(error) = task.await {
                tracing::warn!(task = name, "Task ended abnormally: {}", error);
            }
        }

        self.ctx.save_state()?;
        self.ctx.save_benchmark()?;
        self.ctx.logs.close()?;

        tracing::info!("Node shut down");
        Ok(())
    }
}

fn fail(ctx: &NodeContext, what: &str, error: PeersError) -> PeersError {
    let message = format!("{}: {}", what, error);
    ctx.fatal(what, error);
    PeersError::Transport(message)
}
