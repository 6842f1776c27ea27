// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 连接处理模块
//!
//! 每个 TCP 连接只承载一个请求：读取完整的请求头与请求体，交给分发器处理，
//! 写出响应后关闭连接。请求无法解析时直接写出对应的错误状态码。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::{
    config::Config,
    dispatcher::{DispatchOutcome, Dispatcher},
    exception::Exception,
    param::*,
    request::{find_subsequence, Request},
    response::Response,
    server::InFlightGuard,
};

const READ_CHUNK: usize = 4096;
const DRAIN_LIMIT: usize = 256 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
/// chunk 大小行与 trailer 行的长度上限
const MAX_CHUNK_LINE: usize = 4096;
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// 请求体的分帧方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Length(u64),
    Chunked,
}

/// 从流中读取一个完整请求。
///
/// 对端在发送任何字节之前关闭连接时返回 `Ok(None)`。
pub async fn read_request<S>(stream: &mut S, id: u128, config: &Config) -> Result<Option<Request>, Exception>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_request_from(stream, Vec::with_capacity(1024), id, config).await
}

/// 在已经读到的 `buffer` 之后继续读取请求
async fn read_request_from<S>(
    stream: &mut S,
    mut buffer: Vec<u8>,
    id: u128,
    config: &Config,
) -> Result<Option<Request>, Exception>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let max_header = config.max_header_size();

    // 1. 读取到空行为止，每次只扫描新到达的字节
    let mut scanned = 0;
    let head_end = loop {
        if let Some(pos) = find_head_end(&buffer, scanned) {
            break pos;
        }
        if buffer.len() > max_header {
            return Err(Exception::HeaderTooLarge { limit: max_header });
        }
        scanned = buffer.len();
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(Exception::MalformedRequest(
                "connection closed before end of headers".to_string(),
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    };
    if head_end > max_header {
        return Err(Exception::HeaderTooLarge { limit: max_header });
    }
    let body_start = head_end + HEADER_TERMINATOR.len();

    // 2. 确定请求体的分帧方式，客户端等待 100 Continue 时先回复
    let framing = body_framing(&buffer[..head_end])?;
    if let BodyFraming::Length(length) = framing {
        if length > config.max_body_size() {
            return Err(Exception::BodyTooLarge {
                limit: config.max_body_size(),
            });
        }
    }
    if framing != BodyFraming::Length(0)
        && buffer.len() == body_start
        && expects_continue(&buffer[..head_end])
    {
        stream.write_all(CONTINUE).await?;
        stream.flush().await?;
        debug!("[ID{}]已回复100 Continue", id);
    }

    // 3. 读取请求体
    match framing {
        BodyFraming::Length(length) => {
            let total = body_start + length as usize;
            fill(stream, &mut buffer, total).await?;
            buffer.truncate(total);
        }
        BodyFraming::Chunked => {
            let pending = buffer.split_off(body_start);
            let body = read_chunked(stream, pending, config).await?;
            buffer.extend_from_slice(&body);
        }
    }
    debug!("[ID{}]HTTP请求接收完毕，共{}字节", id, buffer.len());

    let mut request = Request::try_from(&buffer, id)?;
    if framing == BodyFraming::Chunked {
        request.remove_header("Transfer-Encoding");
    }
    Ok(Some(request))
}

/// 从 `scanned` 处继续查找请求头结束位置。
///
/// 向前回看三个字节，分隔符可能横跨两次读取。
fn find_head_end(buffer: &[u8], scanned: usize) -> Option<usize> {
    let from = scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
    find_subsequence(&buffer[from..], HEADER_TERMINATOR).map(|pos| from + pos)
}

/// 持续读取直到 `buffer` 至少有 `len` 字节
async fn fill<R>(stream: &mut R, buffer: &mut Vec<u8>, len: usize) -> Result<(), Exception>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    while buffer.len() < len {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Exception::MalformedRequest(
                "connection closed inside the request body".to_string(),
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

/// 从 `buffer[*pos..]` 读取一行（不含 CRLF），必要时继续从流中读取
async fn read_line<R>(stream: &mut R, buffer: &mut Vec<u8>, pos: &mut usize) -> Result<String, Exception>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_subsequence(&buffer[*pos..], CRLF.as_bytes()) {
            let line = String::from_utf8_lossy(&buffer[*pos..*pos + end]).into_owned();
            *pos += end + CRLF.len();
            return Ok(line);
        }
        if buffer.len() - *pos > MAX_CHUNK_LINE {
            return Err(Exception::MalformedRequest("chunk line too long".to_string()));
        }
        let want = buffer.len() + 1;
        fill(stream, buffer, want).await?;
    }
}

/// 解码 chunked 请求体。`pending` 为读取请求头时多读到的字节。
async fn read_chunked<R>(stream: &mut R, mut pending: Vec<u8>, config: &Config) -> Result<Vec<u8>, Exception>
where
    R: AsyncRead + Unpin,
{
    let limit = config.max_body_size();
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        let line = read_line(stream, &mut pending, &mut pos).await?;
        let digits = line.split(';').next().unwrap_or_default().trim();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Exception::MalformedRequest(format!("bad chunk size: {:?}", line)));
        }
        let size = u64::from_str_radix(digits, 16)
            .map_err(|_| Exception::MalformedRequest(format!("bad chunk size: {:?}", line)))?;
        if size == 0 {
            break;
        }
        if body.len() as u64 + size > limit {
            return Err(Exception::BodyTooLarge { limit });
        }
        let size = size as usize;
        fill(stream, &mut pending, pos + size + CRLF.len()).await?;
        if &pending[pos + size..pos + size + CRLF.len()] != CRLF.as_bytes() {
            return Err(Exception::MalformedRequest("chunk not terminated by CRLF".to_string()));
        }
        body.extend_from_slice(&pending[pos..pos + size]);
        pos += size + CRLF.len();
    }

    // trailer 被丢弃，总长度计入请求头上限
    let mut trailer = 0;
    loop {
        let line = read_line(stream, &mut pending, &mut pos).await?;
        if line.is_empty() {
            break;
        }
        trailer += line.len();
        if trailer > config.max_header_size() {
            return Err(Exception::HeaderTooLarge {
                limit: config.max_header_size(),
            });
        }
    }
    Ok(body)
}

/// 从原始请求头中确定请求体的分帧方式
fn body_framing(head: &[u8]) -> Result<BodyFraming, Exception> {
    let head = String::from_utf8_lossy(head);
    let mut length: Option<u64> = None;
    let mut chunked = false;
    for line in head.split(CRLF).skip(1) {
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => continue,
        };
        if name.eq_ignore_ascii_case("Transfer-Encoding") {
            for coding in value.split(',').map(str::trim) {
                if coding.eq_ignore_ascii_case("chunked") {
                    chunked = true;
                } else if !coding.eq_ignore_ascii_case("identity") {
                    return Err(Exception::UnsupportedTransferEncoding(coding.to_string()));
                }
            }
        }
        if name.eq_ignore_ascii_case("Content-Length") {
            let parsed = value.parse::<u64>().map_err(|_| {
                Exception::MalformedRequest(format!("invalid Content-Length: {:?}", value))
            })?;
            if length.is_some_and(|l| l != parsed) {
                return Err(Exception::MalformedRequest(
                    "conflicting Content-Length headers".to_string(),
                ));
            }
            length = Some(parsed);
        }
    }
    match (chunked, length) {
        (true, Some(_)) => Err(Exception::MalformedRequest(
            "both Transfer-Encoding and Content-Length present".to_string(),
        )),
        (true, None) => Ok(BodyFraming::Chunked),
        (false, length) => Ok(BodyFraming::Length(length.unwrap_or(0))),
    }
}

/// 请求头中是否带有 `Expect: 100-continue`
fn expects_continue(head: &[u8]) -> bool {
    String::from_utf8_lossy(head)
        .split(CRLF)
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("Expect") && value.trim().eq_ignore_ascii_case("100-continue")
        })
}

/// 读取连接上的首批字节，对端直接关闭时返回空缓冲区
async fn read_first<R>(stream: &mut R) -> Result<Vec<u8>, Exception>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let n = stream.read(&mut chunk).await?;
    Ok(chunk[..n].to_vec())
}

/// 在截止时间之前完成读取，否则返回 `ReadTimeout`
async fn within<F, T>(deadline: Option<tokio::time::Instant>, future: F) -> Result<T, Exception>
where
    F: Future<Output = Result<T, Exception>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future)
            .await
            .unwrap_or(Err(Exception::ReadTimeout)),
        None => future.await,
    }
}

/// 将传输期异常写回客户端
pub async fn reject(response: &mut Response, error: &Exception) {
    let code = error.status_code();
    let body = format!("{} {}\n", code, reason_phrase(code));
    response.header("Content-Type", "text/plain; charset=utf-8");
    if let Err(e) = response.status(code).text(&body).await {
        debug!("写出错误响应失败: {}", e);
    }
}

/// 丢弃对端尚未读取的输入，直到对端关闭、超过上限或超时。
///
/// 接收缓冲区里留有未读数据时直接关闭套接字会发出 RST，客户端可能因此丢失已经写出的错误响应。
async fn drain<R>(reader: &mut R, id: u128)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let mut discarded = 0usize;
    let result = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while discarded < DRAIN_LIMIT {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => discarded += n,
            }
        }
    })
    .await;
    if result.is_err() {
        debug!("[ID{}]等待客户端关闭连接超时", id);
    }
}

/// 处理单个连接的完整生命周期
///
/// 连接从被接受起即计入进行中的请求（`_guard`）。尚未收到任何字节的空闲连接在停机时直接关闭；
/// 已经开始发送请求的连接会在 `read_timeout` 内读完并正常分发，停机流程等待其结束。
pub(crate) async fn handle_connection<S>(
    mut stream: S,
    id: u128,
    dispatcher: Arc<Dispatcher>,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
    _guard: InFlightGuard,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let deadline = config
        .read_timeout()
        .map(|limit| tokio::time::Instant::now() + limit);
    // 已经到达的字节优先于停机信号
    let first = tokio::select! {
        biased;
        first = within(deadline, read_first(&mut stream)) => first,
        _ = shutdown.wait_for(|stop| *stop) => {
            debug!("[ID{}]服务器正在停机，关闭空闲连接", id);
            return;
        }
    };
    let result = match first {
        Ok(buffer) if buffer.is_empty() => Ok(None),
        Ok(buffer) => within(deadline, read_request_from(&mut stream, buffer, id, &config)).await,
        Err(e) => Err(e),
    };

    let request = match result {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!("[ID{}]客户端未发送请求即关闭连接", id);
            return;
        }
        Err(Exception::Io(e)) => {
            debug!("[ID{}]读取TCPStream时遇到错误: {}", id, e);
            return;
        }
        Err(e) => {
            warn!("[ID{}]解析HTTP请求失败: {}，返回{}", id, e, e.status_code());
            let (mut reader, writer) = tokio::io::split(stream);
            let mut response = Response::new(writer, id);
            reject(&mut response, &e).await;
            response.close().await;
            drain(&mut reader, id).await;
            return;
        }
    };

    let start_time = Instant::now();
    let method = request.method();
    let version = request.version();
    let path = request.path().to_string();
    let user_agent = request.user_agent().to_string();

    let mut response =
        Response::new(stream, id).with_head_only(method == HttpRequestMethod::Head);
    let outcome = dispatcher.dispatch(request, &mut response).await;
    response.close().await;

    let route = match &outcome {
        DispatchOutcome::Matched { pattern } => pattern.as_str(),
        DispatchOutcome::NotFound => "-",
    };
    info!(
        "[ID{}] HTTP/{}, {}, {}, {}, {}, {}, {}ms",
        id,
        version,
        method,
        path,
        route,
        response.status_code().unwrap_or(0),
        user_agent,
        start_time.elapsed().as_millis()
    );
}
