//! Newline-delimited request/response over tcp: the transport `relay call`
//! uses to reach instances.
use anyhow::bail;
use relay_core::{
    endpoint::Built,
    futures::{SinkExt, StreamExt},
    prelude::*,
    tokio::net::TcpStream,
    tokio_util::codec::{Framed, LinesCodec},
};

/// longest line accepted back from an instance
const MAX_LINE: usize = 64 * 1024;

/// Endpoint factory for the line protocol. Every call dials the address,
/// sends one line and reads one line back. Releasing the endpoint cancels
/// calls still in flight.
pub fn factory() -> impl Fn(&str) -> Result<Built<String, String>> + Send + Sync + 'static {
    |addr: &str| {
        let addr = addr.to_owned();
        let token = CancellationToken::new();
        let calls = token.clone();
        let endpoint = Endpoint::new(move |line: String| {
            let addr = addr.clone();
            let token = calls.clone();
            async move {
                tokio::select! {
                    _ = token.cancelled() => bail!("endpoint for {addr} was released"),
                    res = call(&addr, line) => res,
                }
            }
        });
        let release: Box<dyn Release> = Box::new(token);
        Ok((endpoint, Some(release)))
    }
}

async fn call(addr: &str, line: String) -> Result<String> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
    trace!(%addr, %line, "sending line");
    framed.send(line).await?;
    match framed.next().await {
        Some(resp) => Ok(resp?),
        None => bail!("{addr} closed the connection without answering"),
    }
}
