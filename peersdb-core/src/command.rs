//! Requests, responses and the queues connecting front-ends to the dispatcher.

use crate::benchmark::BenchmarkReport;
use crate::constants::COMMAND_QUEUE_CAPACITY;
use crate::error::{PeersError, Result};
use crate::types::Contribution;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Fetch content into the download directory. Args: locator.
    Get,
    /// Store a payload and append a contribution. Args: payload.
    Post,
    /// Dial a peer. Args: peer address.
    Connect,
    Query,
    Benchmark,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::Get,
        Method::Post,
        Method::Connect,
        Method::Query,
        Method::Benchmark,
    ];

    pub fn arg_count(&self) -> usize {
        match self {
            Method::Get | Method::Post | Method::Connect => 1,
            Method::Query | Method::Benchmark => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Post => "post",
            Method::Connect => "connect",
            Method::Query => "query",
            Method::Benchmark => "benchmark",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = PeersError;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Method::ALL
            .into_iter()
            .find(|method| method.as_str() == normalized)
            .ok_or_else(|| PeersError::InvalidRequest(format!("unknown command: {}", value.trim())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Request {
    /// Build a request, rejecting an argument list that does not fit the method.
    pub fn new(method: Method, args: Vec<String>) -> Result<Self> {
        let request = Self { method, args };
        request.check_args()?;
        Ok(request)
    }

    pub fn parse(method: &str, args: Vec<String>) -> Result<Self> {
        Self::new(method.parse()?, args)
    }

    pub fn check_args(&self) -> Result<()> {
        let expected = self.method.arg_count();
        if self.args.len() != expected {
            return Err(PeersError::InvalidRequest(format!(
                "{} expects {} argument(s), got {}",
                self.method,
                expected,
                self.args.len()
            )));
        }
        Ok(())
    }
}

/// A contribution together with the validity decision reached for it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueriedContribution {
    #[serde(flatten)]
    pub contribution: Contribution,
    pub valid: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Message(String),
    Contributions(Vec<QueriedContribution>),
    Benchmark(BenchmarkReport),
    Notice(String),
}

impl fmt::Display for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Message(message) | ResponseBody::Notice(message) => f.write_str(message),
            ResponseBody::Contributions(items) => {
                if items.is_empty() {
                    return f.write_str("no contributions");
                }
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        writeln!(f)?;
                    }
                    let validity = match item.valid {
                        Some(true) => "valid",
                        Some(false) => "invalid",
                        None => "unknown",
                    };
                    write!(
                        f,
                        "{} by {} at {} ({})",
                        item.contribution.content_ref,
                        item.contribution.contributor,
                        item.contribution.created_at.to_rfc3339(),
                        validity
                    )?;
                }
                Ok(())
            }
            ResponseBody::Benchmark(report) => match serde_json::to_string_pretty(report) {
                Ok(json) => f.write_str(&json),
                Err(_) => Err(fmt::Error),
            },
        }
    }
}

pub type Response = Result<ResponseBody>;

/// A request travelling to the dispatcher with the channel its response goes back on.
pub struct PendingRequest {
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

/// Dispatcher side of the command queue.
pub struct CommandQueues {
    pub requests: mpsc::Receiver<PendingRequest>,
}

/// Front-end handle on the command queue.
///
/// Every call carries its own reply channel, so a caller that gives up
/// mid-flight never leaves a response behind for the next one.
#[derive(Clone)]
pub struct CommandClient {
    requests: mpsc::Sender<PendingRequest>,
}

impl CommandClient {
    pub fn channel() -> (CommandClient, CommandQueues) {
        Self::with_capacity(COMMAND_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (CommandClient, CommandQueues) {
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let client = CommandClient {
            requests: request_tx,
        };
        let queues = CommandQueues {
            requests: request_rx,
        };
        (client, queues)
    }

    pub async fn call(&self, request: Request) -> Response {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(PendingRequest { request, reply })
            .await
            .map_err(|_| PeersError::Internal("command dispatcher stopped".to_string()))?;

        response
            .await
            .map_err(|_| PeersError::Internal("command dispatcher stopped".to_string()))?
    }
}
