use std::{borrow::Cow, net::SocketAddr, num::NonZeroU32, sync::Arc, time::Duration};

use governor::{
    Quota,
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ferry::telemetry;

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs do not accept
/// `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

pub async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = normalize_bind_addr(addr);
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr.as_ref()).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("net: could not resolve {addr:?}"))
}

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Smallest burst a limiter allows, so one read never waits on itself.
const MIN_BURST: u32 = 16 * 1024;

/// Caps proxy throughput in bytes per second, shared by both directions.
pub struct RateLimiter {
    inner: DirectLimiter,
    burst: NonZeroU32,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = u32::try_from(bytes_per_sec)
            .ok()
            .and_then(NonZeroU32::new)
            .unwrap_or(if bytes_per_sec == 0 {
                NonZeroU32::MIN
            } else {
                NonZeroU32::MAX
            });
        let burst = NonZeroU32::new(rate.get().max(MIN_BURST)).unwrap_or(rate);
        Self {
            inner: governor::RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            burst,
        }
    }

    /// Waits until `n` bytes may pass. Requests larger than the burst are
    /// paid in burst-sized pieces.
    pub async fn acquire(&self, n: usize) {
        let mut left = n;
        while left > 0 {
            let chunk = left.min(self.burst.get() as usize);
            left -= chunk;
            let Some(cells) = u32::try_from(chunk).ok().and_then(NonZeroU32::new) else {
                continue;
            };
            if self.inner.until_n_ready(cells).await.is_err() {
                tracing::warn!(cells = cells.get(), "rate limiter: request exceeds burst");
                return;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpliceOptions {
    /// Once one direction finishes, how long the other may keep running.
    pub linger: Duration,
    pub limiter: Option<Arc<RateLimiter>>,
    pub buffer_size: usize,
}

impl Default for SpliceOptions {
    fn default() -> Self {
        Self {
            linger: Duration::from_secs(10),
            limiter: None,
            buffer_size: 32 * 1024,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpliceStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copies bytes both ways between `a` and `b` until both directions end.
///
/// Each direction runs as its own task. A clean EOF is propagated as a write
/// shutdown on the opposite side; an error aborts the other direction. After
/// the first direction ends the second gets `linger` to finish.
pub async fn splice<A, B>(a: A, b: B, opts: SpliceOptions) -> SpliceStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let _active = telemetry::ActiveSpliceGuard::new();

    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);

    let mut up = tokio::spawn(pipe(ar, bw, opts.limiter.clone(), opts.buffer_size));
    let mut down = tokio::spawn(pipe(br, aw, opts.limiter.clone(), opts.buffer_size));

    let mut stats = SpliceStats::default();

    let (first_ok, up_first) = tokio::select! {
        r = &mut up => {
            let ok = record(r, &mut stats.a_to_b);
            (ok, true)
        }
        r = &mut down => {
            let ok = record(r, &mut stats.b_to_a);
            (ok, false)
        }
    };

    let (other, slot) = if up_first {
        (&mut down, &mut stats.b_to_a)
    } else {
        (&mut up, &mut stats.a_to_b)
    };

    if !first_ok {
        other.abort();
        return stats;
    }

    match tokio::time::timeout(opts.linger, &mut *other).await {
        Ok(r) => {
            record(r, slot);
        }
        Err(_) => {
            other.abort();
        }
    }

    metrics::counter!("ferry_spliced_bytes_total").increment(stats.a_to_b + stats.b_to_a);
    stats
}

fn record(r: Result<std::io::Result<u64>, tokio::task::JoinError>, slot: &mut u64) -> bool {
    match r {
        Ok(Ok(n)) => {
            *slot = n;
            true
        }
        Ok(Err(err)) => {
            tracing::trace!(err=%err, "splice: direction failed");
            false
        }
        Err(_) => false,
    }
}

async fn pipe<R, W>(
    mut r: R,
    mut w: W,
    limiter: Option<Arc<RateLimiter>>,
    buffer_size: usize,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1024)];
    let mut total = 0u64;
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Some(l) = &limiter {
            l.acquire(n).await;
        }
        w.write_all(&buf[..n]).await?;
        w.flush().await?;
        total += n as u64;
    }
    w.shutdown().await?;
    Ok(total)
}
