// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 响应写出模块
//!
//! `Response` 包装单个请求的输出流。HTTP 响应的状态行和标头只能发送一次，
//! 且必须先于任何响应体字节，因此这里显式建模为两态状态机：
//!
//! - `Open`：尚未提交，可以设置状态码与标头；
//! - `Committed`：状态行与标头已经定稿，之后只能追加响应体。
//!
//! 第一次提交生效，之后的状态码设置被忽略；提交后设置的标头不会出现在报文中。
//! 报文头在提交时序列化，随下一次写出一并发送。唯一的例外是 `json`/`text` 的 Content-Type：
//! 报文头尚未写出且提交时没有 Content-Type 时会补入报文头，所以 `status(201).json(..)` 照常带类型。

use std::fmt::{self, Write as _};

use chrono::{DateTime, Utc};
use log::{debug, error};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{exception::Exception, param::*};

/// 响应的输出端，生产环境中为 `TcpStream`
pub type ResponseWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 响应头提交状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// 尚未发送状态行与标头
    Open,
    /// 状态行与标头已定稿
    Committed { status: u16 },
}

pub struct Response {
    writer: ResponseWriter,
    id: u128,
    state: ResponseState,
    headers: Vec<(String, String)>,
    /// 已提交但尚未写出的报文头（不含结尾的 `Connection` 行与空行）
    pending_head: Option<String>,
    /// 提交时报文头中是否已有 Content-Type
    head_has_content_type: bool,
    head_only: bool,
    bytes_written: u64,
}

impl Response {
    pub fn new<W>(writer: W, id: u128) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Box::new(writer),
            id,
            state: ResponseState::Open,
            headers: Vec::new(),
            pending_head: None,
            head_has_content_type: false,
            head_only: false,
            bytes_written: 0,
        }
    }

    /// HEAD 请求只发送报文头，响应体被丢弃
    pub fn with_head_only(mut self, head_only: bool) -> Self {
        self.head_only = head_only;
        self
    }

    /// 设置状态码。仅在 `Open` 状态下生效并提交报文头，之后的调用被忽略。
    pub fn status(&mut self, code: u16) -> &mut Self {
        if !(100..=999).contains(&code) {
            error!("[ID{}]非法的状态码：{}，已忽略", self.id, code);
            return self;
        }
        match self.state {
            ResponseState::Open => self.commit(code),
            ResponseState::Committed { status } => {
                debug!(
                    "[ID{}]响应头已提交（{}），忽略状态码{}",
                    self.id, status, code
                );
            }
        }
        self
    }

    /// 设置标头，替换同名的已有值。提交之后设置的标头不会被发送。
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        let name = canonical_header_key(name);
        self.headers.retain(|(k, _)| *k != name);
        self.headers.push((name, value.to_string()));
        self
    }

    /// 追加标头，保留同名的已有值。
    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers
            .push((canonical_header_key(name), value.to_string()));
        self
    }

    /// 写出原始响应体。若尚未提交，则先以 200 提交。
    pub async fn write(&mut self, data: &[u8]) -> Result<&mut Self, Exception> {
        if self.state == ResponseState::Open {
            self.commit(200);
        }
        let mut buf = match self.pending_head.take() {
            Some(mut head) => {
                let _ = write!(head, "Connection: close{}{}", CRLF, CRLF);
                head.into_bytes()
            }
            None => Vec::new(),
        };
        if self.body_allowed() {
            buf.extend_from_slice(data);
            self.bytes_written += data.len() as u64;
        }
        if !buf.is_empty() {
            self.writer.write_all(&buf).await?;
        }
        self.writer.flush().await?;
        Ok(self)
    }

    /// 以 JSON 写出响应体，并设置 `Content-Type: application/json`。
    ///
    /// 序列化失败时报文头仍然以当前状态提交，响应体为空。
    pub async fn json<T>(&mut self, value: &T) -> Result<&mut Self, Exception>
    where
        T: Serialize + ?Sized,
    {
        self.set_content_type("application/json");
        if self.state == ResponseState::Open {
            self.commit(200);
        }
        let mut body = serde_json::to_vec(value).map_err(Exception::Encode)?;
        body.push(b'\n');
        self.write(&body).await
    }

    /// 以纯文本写出响应体
    pub async fn text(&mut self, body: &str) -> Result<&mut Self, Exception> {
        self.set_content_type("text/plain; charset=utf-8");
        self.write(body.as_bytes()).await
    }

    /// 结束响应。若尚未提交，则以 200 提交且不写出响应体。
    pub async fn end(&mut self) -> Result<&mut Self, Exception> {
        self.write(&[]).await
    }

    /// 关闭输出端的写方向，客户端据此得知响应体结束
    pub(crate) async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("[ID{}]关闭输出流失败: {}", self.id, e);
        }
    }
}

impl Response {
    pub fn state(&self) -> ResponseState {
        self.state
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.state, ResponseState::Committed { .. })
    }

    /// 已提交的状态码
    pub fn status_code(&self) -> Option<u16> {
        match self.state {
            ResponseState::Open => None,
            ResponseState::Committed { status } => Some(status),
        }
    }

    /// 读取当前标头表中的值（不代表已经发送）
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 已写出的响应体字节数
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn body_allowed(&self) -> bool {
        match self.state {
            ResponseState::Committed { status } => {
                !self.head_only && status >= 200 && status != 204 && status != 304
            }
            ResponseState::Open => false,
        }
    }

    /// 设置响应体类型。报文头已提交但尚未写出时，只在其中没有 Content-Type 的情况下补入。
    fn set_content_type(&mut self, value: &str) {
        self.header("Content-Type", value);
        if self.head_has_content_type {
            return;
        }
        if let Some(head) = self.pending_head.as_mut() {
            let _ = write!(head, "Content-Type: {}{}", value, CRLF);
            self.head_has_content_type = true;
        }
    }

    fn commit(&mut self, code: u16) {
        let mut head = String::with_capacity(128);
        let _ = write!(head, "HTTP/1.1 {} {}{}", code, reason_phrase(code), CRLF);
        if self.get_header("Date").is_none() {
            let _ = write!(head, "Date: {}{}", format_date(&Utc::now()), CRLF);
        }
        if self.get_header("Server").is_none() {
            let _ = write!(head, "Server: {}{}", SERVER_NAME, CRLF);
        }
        for (name, value) in self.headers.iter().filter(|(k, _)| k != "Connection") {
            let _ = write!(head, "{}: {}{}", name, value, CRLF);
        }
        self.head_has_content_type = self.get_header("Content-Type").is_some();
        self.pending_head = Some(head);
        self.state = ResponseState::Committed { status: code };
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("headers", &self.headers)
            .field("head_only", &self.head_only)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

/// IMF-fixdate 格式，例如 `Sun, 06 Nov 1994 08:49:37 GMT`
fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn pair() -> (DuplexStream, Response) {
        let (client, server) = tokio::io::duplex(1 << 16);
        (client, Response::new(server, 0))
    }

    /// 关闭响应并读取客户端收到的完整报文，返回（状态行，标头，响应体）
    async fn finish(mut client: DuplexStream, mut res: Response) -> (String, Vec<String>, String) {
        res.close().await;
        drop(res);
        let mut raw = String::new();
        client.read_to_string(&mut raw).await.unwrap();
        let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default().to_string();
        (
            status_line,
            lines.map(str::to_string).collect(),
            body.to_string(),
        )
    }

    #[test]
    fn test_format_date() {
        let date = DateTime::parse_from_rfc3339("1994-11-06T08:49:37Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_date(&date), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[tokio::test]
    async fn test_initial_state_is_open() {
        let (_client, res) = pair();
        assert_eq!(res.state(), ResponseState::Open);
        assert_eq!(res.status_code(), None);
        assert!(!res.is_committed());
    }

    /// 显式设置状态码后写出响应体，使用该状态码而非默认值
    #[tokio::test]
    async fn test_status_then_write() {
        let (client, mut res) = pair();
        res.status(201).write(b"created").await.unwrap();
        assert_eq!(res.status_code(), Some(201));
        let (status, headers, body) = finish(client, res).await;
        assert_eq!(status, "HTTP/1.1 201 Created");
        assert!(headers.contains(&"Connection: close".to_string()));
        assert!(headers.contains(&"Server: webrouter".to_string()));
        assert!(headers.iter().any(|h| h.starts_with("Date: ")));
        assert_eq!(body, "created");
    }

    /// 第一次提交生效，之后的状态码被忽略
    #[tokio::test]
    async fn test_first_status_wins() {
        let (client, mut res) = pair();
        res.status(404).status(200).status(500);
        res.end().await.unwrap();
        assert_eq!(res.status_code(), Some(404));
        let (status, _, body) = finish(client, res).await;
        assert_eq!(status, "HTTP/1.1 404 Not Found");
        assert!(body.is_empty());
    }

    /// 提交后设置的标头不会出现在报文中，提交前设置的会
    #[tokio::test]
    async fn test_header_after_commit_not_sent() {
        let (client, mut res) = pair();
        res.header("X-Before", "1").status(202).header("X-After", "2");
        res.write(b"ok").await.unwrap();
        assert_eq!(res.get_header("X-After"), Some("2"));
        let (status, headers, _) = finish(client, res).await;
        assert_eq!(status, "HTTP/1.1 202 Accepted");
        assert!(headers.contains(&"X-Before: 1".to_string()));
        assert!(!headers.iter().any(|h| h.starts_with("X-After")));
    }

    #[tokio::test]
    async fn test_write_commits_default_status() {
        let (client, mut res) = pair();
        res.write(b"Chunk 0\n").await.unwrap();
        res.write(b"Chunk 1\n").await.unwrap();
        res.status(500);
        assert_eq!(res.bytes_written(), 16);
        let (status, _, body) = finish(client, res).await;
        assert_eq!(status, "HTTP/1.1 200 OK");
        assert_eq!(body, "Chunk 0\nChunk 1\n");
    }

    #[tokio::test]
    async fn test_json_sets_content_type() {
        let (client, mut res) = pair();
        let mut value = BTreeMap::new();
        value.insert("message", "User 7 deleted");
        res.json(&value).await.unwrap();
        let (status, headers, body) = finish(client, res).await;
        assert_eq!(status, "HTTP/1.1 200 OK");
        assert!(headers.contains(&"Content-Type: application/json".to_string()));
        assert_eq!(body, "{\"message\":\"User 7 deleted\"}\n");
    }

    /// 先设置标头再设置状态码，标头随提交一并发送
    #[tokio::test]
    async fn test_header_then_status_then_json() {
        let (client, mut res) = pair();
        res.header("Content-Type", "application/json")
            .status(201)
            .json(&[1])
            .await
            .unwrap();
        let (status, headers, body) = finish(client, res).await;
        assert_eq!(status, "HTTP/1.1 201 Created");
        assert!(headers.contains(&"Content-Type: application/json".to_string()));
        assert_eq!(body, "[1]\n");
    }

    /// 先设置状态码再写出 JSON，报文头尚未发送，Content-Type 补入报文头
    #[tokio::test]
    async fn test_status_then_json_sets_content_type() {
        let (client, mut res) = pair();
        res.status(201).json(&serde_json::json!({"id": "1"})).await.unwrap();
        let (status, headers, body) = finish(client, res).await;
        assert_eq!(status, "HTTP/1.1 201 Created");
        assert_eq!(
            headers.iter().filter(|h| h.starts_with("Content-Type")).count(),
            1
        );
        assert!(headers.contains(&"Content-Type: application/json".to_string()));
        assert_eq!(headers.last().map(String::as_str), Some("Connection: close"));
        assert_eq!(body, "{\"id\":\"1\"}\n");
    }

    /// 提交前已有的 Content-Type 保持不变，不会重复出现
    #[tokio::test]
    async fn test_status_then_json_keeps_explicit_content_type() {
        let (client, mut res) = pair();
        res.header("Content-Type", "application/problem+json").status(400);
        res.json(&[1]).await.unwrap();
        let (_, headers, _) = finish(client, res).await;
        assert_eq!(
            headers.iter().filter(|h| h.starts_with("Content-Type")).count(),
            1
        );
        assert!(headers.contains(&"Content-Type: application/problem+json".to_string()));
    }

    /// 报文头已经写出后再调用 json，Content-Type 无法补发
    #[tokio::test]
    async fn test_json_after_head_sent() {
        let (client, mut res) = pair();
        res.status(200).end().await.unwrap();
        res.json(&[1, 2, 3]).await.unwrap();
        let (_, headers, body) = finish(client, res).await;
        assert!(!headers.iter().any(|h| h.starts_with("Content-Type")));
        assert_eq!(body, "[1,2,3]\n");
    }

    #[tokio::test]
    async fn test_json_encode_failure() {
        let (client, mut res) = pair();
        let mut bad = BTreeMap::new();
        bad.insert(vec![1u8], 1u8);
        let result = res.json(&bad).await;
        assert!(matches!(result, Err(Exception::Encode(_))));
        assert_eq!(res.status_code(), Some(200));
        res.end().await.unwrap();
        let (status, _, body) = finish(client, res).await;
        assert_eq!(status, "HTTP/1.1 200 OK");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_end_without_body() {
        let (client, mut res) = pair();
        res.header("Content-Type", "text/plain").end().await.unwrap();
        let (status, headers, body) = finish(client, res).await;
        assert_eq!(status, "HTTP/1.1 200 OK");
        assert!(headers.contains(&"Content-Type: text/plain".to_string()));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_header_replace_and_add() {
        let (client, mut res) = pair();
        res.header("x-id", "1").header("X-Id", "2");
        res.add_header("Set-Cookie", "a=1").add_header("set-cookie", "b=2");
        res.end().await.unwrap();
        let (_, headers, _) = finish(client, res).await;
        assert!(headers.contains(&"X-Id: 2".to_string()));
        assert!(!headers.contains(&"X-Id: 1".to_string()));
        assert!(headers.contains(&"Set-Cookie: a=1".to_string()));
        assert!(headers.contains(&"Set-Cookie: b=2".to_string()));
    }

    #[tokio::test]
    async fn test_head_only_discards_body() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut res = Response::new(server, 0).with_head_only(true);
        res.text("hello").await.unwrap();
        assert_eq!(res.bytes_written(), 0);
        let (status, headers, body) = finish(client, res).await;
        assert_eq!(status, "HTTP/1.1 200 OK");
        assert!(headers.contains(&"Content-Type: text/plain; charset=utf-8".to_string()));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_no_content_discards_body() {
        let (client, mut res) = pair();
        res.status(204).write(b"ignored").await.unwrap();
        let (status, _, body) = finish(client, res).await;
        assert_eq!(status, "HTTP/1.1 204 No Content");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_status_ignored() {
        let (_client, mut res) = pair();
        res.status(42);
        assert_eq!(res.state(), ResponseState::Open);
        res.status(299);
        assert_eq!(res.state(), ResponseState::Committed { status: 299 });
    }

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// 写出失败以 `Exception::Io` 返回，不会 panic
    #[tokio::test]
    async fn test_write_error_is_reported() {
        let mut res = Response::new(BrokenPipe, 0);
        let result = res.status(200).write(b"data").await;
        assert!(matches!(result, Err(Exception::Io(_))));
        assert!(res.is_committed());
    }
}
