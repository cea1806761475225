//! Interactive front-end: one command per stdin line.

use peersdb_core::{CommandClient, Request, Result};
use std::io::BufRead;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PROMPT: &str = "peersdb> ";

/// Split a line into a request. Everything after the method is one argument.
pub fn parse_line(line: &str) -> Result<Option<Request>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (method, rest) = match line.split_once(char::is_whitespace) {
        Some((method, rest)) => (method, rest.trim()),
        None => (line, ""),
    };
    let args = if rest.is_empty() {
        Vec::new()
    } else {
        vec![rest.to_string()]
    };

    Request::parse(method, args).map(Some)
}

/// Blocking stdin reads run on their own thread, outside the runtime.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!("Cannot read from stdin: {}", error);
                    break;
                }
            }
        }
    });
    rx
}

pub fn spawn(client: CommandClient, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = stdin_lines();
        let mut stdout = tokio::io::stdout();

        loop {
            let _ = stdout.write_all(PROMPT.as_bytes()).await;
            let _ = stdout.flush().await;

            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };

            let output = match parse_line(&line) {
                Ok(None) => continue,
                Ok(Some(request)) => match client.call(request).await {
                    Ok(body) => body.to_string(),
                    Err(error) => format!("error: {}", error),
                },
                Err(error) => format!(
                    "error: {} (commands: get <locator>, post <data>, connect <address>, query, benchmark)",
                    error
                ),
            };
            let _ = stdout.write_all(format!("{}\n", output).as_bytes()).await;
        }
        tracing::debug!("Shell stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersdb_core::{Method, PeersError};

    #[test]
    fn test_parse_line() {
        assert!(parse_line("   ").unwrap().is_none());

        let request = parse_line("post hello there").unwrap().unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.args, vec!["hello there".to_string()]);

        let request = parse_line("QUERY").unwrap().unwrap();
        assert_eq!(request.method, Method::Query);
        assert!(request.args.is_empty());
    }

    #[test]
    fn test_parse_line_rejects_bad_input() {
        assert!(matches!(parse_line("delete x"), Err(PeersError::InvalidRequest(_))));
        assert!(matches!(parse_line("connect"), Err(PeersError::InvalidRequest(_))));
        assert!(matches!(parse_line("benchmark now"), Err(PeersError::InvalidRequest(_))));
    }
}
