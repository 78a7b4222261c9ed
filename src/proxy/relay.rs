use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// 双向数据转发，返回 (a->b, b->a) 字节数
pub async fn relay<A, B>(mut a: A, mut b: B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_to_b, b_to_a) = tokio::io::copy_bidirectional(&mut a, &mut b).await?;
    debug!(up = a_to_b, down = b_to_a, "relay finished");
    Ok((a_to_b, b_to_a))
}

/// 单次交换：写出负载，再读应答直到 EOF、读超时或达到上限
///
/// 读超时按“空闲”计：每收到一段数据就重新计时。
pub async fn exchange<S>(
    stream: &mut S,
    payload: &[u8],
    read_timeout: Duration,
    max_response: usize,
) -> Result<(u64, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    stream.flush().await?;

    let mut response = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    while response.len() < max_response {
        match tokio::time::timeout(read_timeout, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let take = n.min(max_response - response.len());
                response.extend_from_slice(&buf[..take]);
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!(received = response.len(), "response read timed out");
                break;
            }
        }
    }
    Ok((payload.len() as u64, response))
}
