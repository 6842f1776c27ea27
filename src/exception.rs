// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了路由层在注册、解析、分发、写出以及停机过程中可能产生的各类异常。
//!
//! ## 分类
//! - **注册期**：路由模式非法（`InvalidPattern`），应当中止启动。
//! - **传输期**：请求报文无法解析、超出限制等，由连接任务就地转换为对应的状态码。
//! - **处理期**：请求体解码失败（`Decode`）交由 handler 自行决定响应；写出失败（`Io`、`Encode`）
//!   不会重试，由分发器记录日志。
//! - **生命周期**：端口绑定失败、重复启动、优雅停机超时。

use std::io;

use thiserror::Error;

/// 服务器运行过程中发生的异常类型。
#[derive(Debug, Error)]
pub enum Exception {
    /// 注册路由时给出的模式无法编译。
    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// 客户端发送的请求字节流无法解析为合法的 UTF-8 字符串。
    #[error("Request bytes can't be parsed in UTF-8")]
    RequestIsNotUtf8,
    /// 请求行或标头行格式不正确。
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// 客户端使用了服务器无法识别的 HTTP 方法。
    #[error("Unsupported request method")]
    UnSupportedRequestMethod,
    /// 客户端使用了服务器不支持的 HTTP 协议版本。
    #[error("Unsupported HTTP version")]
    UnsupportedHttpVersion,
    /// 请求路径包含非法的百分号编码。
    #[error("Invalid path (400)")]
    InvalidPath,
    /// 请求头部超过配置的上限。
    #[error("request header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },
    /// 请求体超过配置的上限。
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },
    /// 请求体使用了不支持的传输编码（仅支持 chunked 与 identity）。
    #[error("unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),
    /// 在限定时间内未能收到完整请求。
    #[error("timed out while reading the request")]
    ReadTimeout,

    /// 请求体不是合法的 JSON，或与目标结构不匹配。
    #[error("failed to decode request body: {0}")]
    Decode(#[source] serde_json::Error),
    /// 响应体序列化失败。
    #[error("failed to encode response body: {0}")]
    Encode(#[source] serde_json::Error),
    /// 底层 Socket 读写失败。
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// 无法绑定监听地址。
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// 服务器已经启动过，不能再次进入监听状态。
    #[error("server has already been started")]
    AlreadyStarted,
    /// 优雅停机的期限已到，但仍有请求在处理中。
    #[error("graceful shutdown timed out with {in_flight} request(s) still in flight")]
    ShutdownTimeout { in_flight: usize },

    /// 配置文件无法读取或解析。
    #[error("configuration error: {0}")]
    Config(String),
}

impl Exception {
    /// 传输期异常对应的 HTTP 状态码。
    ///
    /// 非传输期异常不会直接写回客户端，统一返回 500。
    pub fn status_code(&self) -> u16 {
        match self {
            Exception::RequestIsNotUtf8
            | Exception::MalformedRequest(_)
            | Exception::InvalidPath
            | Exception::Decode(_) => 400,
            Exception::ReadTimeout => 408,
            Exception::BodyTooLarge { .. } => 413,
            Exception::HeaderTooLarge { .. } => 431,
            Exception::UnSupportedRequestMethod | Exception::UnsupportedTransferEncoding(_) => 501,
            Exception::UnsupportedHttpVersion => 505,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_status_codes() {
        assert_eq!(Exception::RequestIsNotUtf8.status_code(), 400);
        assert_eq!(Exception::MalformedRequest("x".into()).status_code(), 400);
        assert_eq!(Exception::InvalidPath.status_code(), 400);
        assert_eq!(Exception::BodyTooLarge { limit: 1 }.status_code(), 413);
        assert_eq!(Exception::HeaderTooLarge { limit: 1 }.status_code(), 431);
        assert_eq!(Exception::UnSupportedRequestMethod.status_code(), 501);
        assert_eq!(Exception::UnsupportedHttpVersion.status_code(), 505);
        assert_eq!(Exception::AlreadyStarted.status_code(), 500);
    }

    #[test]
    fn test_display_messages() {
        let e = Exception::InvalidPattern {
            pattern: "/users/{".to_string(),
            reason: "unclosed placeholder".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "invalid route pattern `/users/{`: unclosed placeholder"
        );
        assert_eq!(
            Exception::ShutdownTimeout { in_flight: 2 }.to_string(),
            "graceful shutdown timed out with 2 request(s) still in flight"
        );
    }
}
