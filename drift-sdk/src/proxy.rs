//! Proxy tunnels: SOCKS5 (and Tor), SOCKS4a and HTTP CONNECT.
//!
//! Each handshake runs over an already-connected stream and leaves it
//! positioned at the first byte of the tunneled connection. Replies are
//! read a byte at a time through [`read_until`] so nothing belonging to the
//! IRC server is consumed.

use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{PROXY_READ_TIMEOUT, ProxyConfig, ProxyKind};
use crate::error::{Error, Result};

/// Upper bound on an HTTP CONNECT response header.
const MAX_HTTP_HEADER: usize = 8192;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_USERPASS: u8 = 0x02;
const SOCKS5_AUTH_REJECTED: u8 = 0xFF;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;
const SOCKS4_GRANTED: u8 = 0x5A;

/// Open a tunnel to `host:port` through `proxy`.
pub async fn tunnel<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::debug!(proxy = %proxy.addr(), kind = ?proxy.kind, target = %format!("{host}:{port}"), "Opening proxy tunnel");
    let result = match proxy.kind {
        ProxyKind::Socks5 | ProxyKind::Tor => socks5(stream, proxy, host, port).await,
        ProxyKind::Socks4 => socks4(stream, proxy, host, port).await,
        ProxyKind::Http => http_connect(stream, proxy, host, port).await,
    };
    match &result {
        Ok(()) => tracing::debug!(proxy = %proxy.addr(), "Proxy tunnel established"),
        Err(e) => tracing::warn!(proxy = %proxy.addr(), error = %e, "Proxy tunnel failed"),
    }
    result
}

/// Read single bytes until `done` accepts the buffer. Fails on EOF or when
/// `limit` elapses first.
pub async fn read_until<S, F>(stream: &mut S, proxy: &ProxyConfig, limit: Duration, mut done: F) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> bool,
{
    let addr = proxy.addr();
    let read = async {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream
                .read(&mut byte)
                .await
                .map_err(|e| Error::transport(addr.clone(), e))?;
            if n == 0 {
                return Err(Error::proxy(addr.clone(), 0, "proxy closed the connection"));
            }
            buf.push(byte[0]);
            if done(&buf) {
                return Ok(buf);
            }
        }
    };
    match tokio::time::timeout(limit, read).await {
        Ok(result) => result,
        Err(_) => Err(Error::proxy(
            proxy.addr(),
            0,
            format!("no reply within {}ms", limit.as_millis()),
        )),
    }
}

async fn read_exact<S>(stream: &mut S, proxy: &ProxyConfig, n: usize) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    read_until(stream, proxy, PROXY_READ_TIMEOUT, |b| b.len() >= n).await
}

async fn write_all<S>(stream: &mut S, proxy: &ProxyConfig, bytes: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(bytes)
        .await
        .map_err(|e| Error::transport(proxy.addr(), e))?;
    stream.flush().await.map_err(|e| Error::transport(proxy.addr(), e))
}

// ── SOCKS5 (RFC 1928 / RFC 1929) ──

async fn socks5<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let creds = proxy.credentials();
    let greeting: &[u8] = if creds.is_some() {
        &[SOCKS5_VERSION, 2, SOCKS5_AUTH_NONE, SOCKS5_AUTH_USERPASS]
    } else {
        &[SOCKS5_VERSION, 1, SOCKS5_AUTH_NONE]
    };
    write_all(stream, proxy, greeting).await?;

    let choice = read_exact(stream, proxy, 2).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(Error::proxy(proxy.addr(), choice[0].into(), "not a SOCKS5 proxy"));
    }
    match (choice[1], creds) {
        (SOCKS5_AUTH_NONE, _) => {}
        (SOCKS5_AUTH_USERPASS, Some((user, pass))) => socks5_login(stream, proxy, user, pass).await?,
        (SOCKS5_AUTH_REJECTED, _) => {
            return Err(Error::proxy(
                proxy.addr(),
                SOCKS5_AUTH_REJECTED.into(),
                "no acceptable authentication method",
            ));
        }
        (method, _) => {
            return Err(Error::proxy(
                proxy.addr(),
                method.into(),
                format!("proxy selected unsupported authentication method {method:#04x}"),
            ));
        }
    }

    let name = host.as_bytes();
    let len = u8::try_from(name.len())
        .map_err(|_| Error::Config(format!("host name {host:?} is too long for SOCKS5")))?;
    let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00, SOCKS5_ATYP_DOMAIN, len];
    request.extend_from_slice(name);
    request.extend_from_slice(&port.to_be_bytes());
    write_all(stream, proxy, &request).await?;

    // VER REP RSV ATYP, then a bound address whose size depends on ATYP.
    let reply = read_until(stream, proxy, PROXY_READ_TIMEOUT, |b| {
        b.len() >= 2 && (b[1] != 0 || socks5_reply_len(b).is_some_and(|n| b.len() >= n))
    })
    .await?;
    if reply[1] != 0 {
        return Err(Error::proxy(proxy.addr(), reply[1].into(), socks5_reason(reply[1])));
    }
    if !matches!(reply[3], SOCKS5_ATYP_IPV4 | SOCKS5_ATYP_IPV6 | SOCKS5_ATYP_DOMAIN) {
        return Err(Error::proxy(proxy.addr(), 0x08, socks5_reason(0x08)));
    }
    Ok(())
}

/// Total reply length once enough of the header is known.
fn socks5_reply_len(b: &[u8]) -> Option<usize> {
    match *b.get(3)? {
        SOCKS5_ATYP_IPV4 => Some(4 + 4 + 2),
        SOCKS5_ATYP_IPV6 => Some(4 + 16 + 2),
        SOCKS5_ATYP_DOMAIN => b.get(4).map(|&n| 5 + n as usize + 2),
        // Unknown: stop after the header, the caller rejects it.
        _ => Some(4),
    }
}

async fn socks5_login<S>(stream: &mut S, proxy: &ProxyConfig, user: &str, pass: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (Ok(ulen), Ok(plen)) = (u8::try_from(user.len()), u8::try_from(pass.len())) else {
        return Err(Error::Config("SOCKS5 username and password are limited to 255 bytes".into()));
    };
    let mut request = vec![0x01, ulen];
    request.extend_from_slice(user.as_bytes());
    request.push(plen);
    request.extend_from_slice(pass.as_bytes());
    write_all(stream, proxy, &request).await?;

    let status = read_exact(stream, proxy, 2).await?;
    if status[1] != 0 {
        return Err(Error::proxy(proxy.addr(), status[1].into(), "authentication rejected"));
    }
    Ok(())
}

fn socks5_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    }
}

// ── SOCKS4a ──

async fn socks4<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());
    match host.parse::<std::net::Ipv4Addr>() {
        Ok(ip) => request.extend_from_slice(&ip.octets()),
        // 0.0.0.x asks the proxy to resolve the name that follows.
        Err(_) => request.extend_from_slice(&[0, 0, 0, 1]),
    }
    if let Some((user, _)) = proxy.credentials() {
        request.extend_from_slice(user.as_bytes());
    }
    request.push(0);
    if host.parse::<std::net::Ipv4Addr>().is_err() {
        request.extend_from_slice(host.as_bytes());
        request.push(0);
    }
    write_all(stream, proxy, &request).await?;

    let reply = read_exact(stream, proxy, 8).await?;
    if reply[1] != SOCKS4_GRANTED {
        let message = match reply[1] {
            0x5B => "request rejected or failed",
            0x5C => "identd unreachable",
            0x5D => "identd user mismatch",
            _ => "unknown failure",
        };
        return Err(Error::proxy(proxy.addr(), reply[1].into(), message));
    }
    Ok(())
}

// ── HTTP CONNECT ──

async fn http_connect<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some((user, pass)) = proxy.credentials() {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    write_all(stream, proxy, request.as_bytes()).await?;

    let header = read_until(stream, proxy, PROXY_READ_TIMEOUT, |b| {
        b.ends_with(b"\r\n\r\n") || b.ends_with(b"\n\n") || b.len() >= MAX_HTTP_HEADER
    })
    .await?;
    let header = String::from_utf8_lossy(&header);
    let status_line = header.lines().next().unwrap_or("").trim();
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
        .unwrap_or(0);
    if code != 200 {
        return Err(Error::proxy(proxy.addr(), code, status_line.to_string()));
    }
    Ok(())
}
