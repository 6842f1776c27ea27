// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求处理模块
//!
//! 负责将 TCP 流中读取的原始字节解析为强类型的 `Request` 结构体，
//! 并在分发阶段为 handler 提供便捷的读取接口：
//! 1. 请求行（Request-Line）的解析（方法、路径、版本）。
//! 2. 全部标头的提取，名称统一规范化。
//! 3. 查询参数与路径参数的访问。
//! 4. 将请求体解码为调用方给定的结构。

use std::collections::BTreeMap;

use bytes::Bytes;
use log::error;
use serde::de::DeserializeOwned;
use serde_derive::Serialize;

use crate::{exception::Exception, param::*, pattern::PathParams};

/// 标头或查询参数的取值：只出现一次时为单值，出现多次时按到达顺序保留为序列。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Single(String),
    Multiple(Vec<String>),
}

impl ParamValue {
    /// 第一个取值
    pub fn first(&self) -> &str {
        match self {
            ParamValue::Single(v) => v,
            ParamValue::Multiple(vs) => vs.first().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ParamValue::Single(_) => 1,
            ParamValue::Multiple(vs) => vs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 按名称聚合键值对：一个值折叠为 `Single`，多个值保留为 `Multiple`。
pub fn collapse<I>(pairs: I) -> BTreeMap<String, ParamValue>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        grouped.entry(key).or_default().push(value);
    }
    grouped
        .into_iter()
        .map(|(key, mut values)| {
            let value = if values.len() == 1 {
                ParamValue::Single(values.remove(0))
            } else {
                ParamValue::Multiple(values)
            };
            (key, value)
        })
        .collect()
}

/// 表示一个完整的 HTTP 请求，以及路由匹配得到的路径参数。
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP 请求方法
    method: HttpRequestMethod,
    /// 请求行中的原始目标（含查询字符串）
    target: String,
    /// 解码后的请求路径，用于路由匹配
    path: String,
    /// 原始查询字符串（不含 `?`）
    query: String,
    /// HTTP 协议版本
    version: HttpVersion,
    /// 按到达顺序保存的标头，名称已规范化
    headers: Vec<(String, String)>,
    body: Bytes,
    /// 路由匹配阶段写入
    params: PathParams,
}

impl Request {
    /// 从原始字节缓冲区尝试构建 `Request` 实例。
    ///
    /// # 逻辑步骤
    /// 1. 以空行切分请求头与请求体，验证请求头是合法的 UTF-8 字符串。
    /// 2. 解析请求行：提取方法、目标和协议版本。
    /// 3. 解析目标：支持 origin-form 与 absolute-form，路径做百分号解码。
    /// 4. 逐行解析标头。
    ///
    /// # 参数
    /// * `buffer` - 从网络 Socket 读取的原始数据（请求头与完整请求体）。
    /// * `id` - 连接 ID，用于在多任务环境下追踪日志。
    pub fn try_from(buffer: &[u8], id: u128) -> Result<Self, Exception> {
        let (head, body) = match find_subsequence(buffer, HEADER_TERMINATOR) {
            Some(pos) => (&buffer[..pos], &buffer[pos + HEADER_TERMINATOR.len()..]),
            None => (buffer, &b""[..]),
        };

        // 1. 请求头必须是 UTF-8
        let head = match std::str::from_utf8(head) {
            Ok(s) => s,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };
        let mut lines = head.split(CRLF);

        // 2. 解析请求行 (e.g., "GET /index.html HTTP/1.1")
        let request_line = lines.next().unwrap_or_default();
        let parts: Vec<&str> = request_line.split(' ').filter(|s| !s.is_empty()).collect();
        if parts.len() != 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, request_line);
            return Err(Exception::MalformedRequest(format!(
                "bad request line: {:?}",
                request_line
            )));
        }

        let method = match HttpRequestMethod::parse(parts[0]) {
            Some(m) => m,
            None => {
                error!("[ID{}]不支持的HTTP请求方法：{}", id, parts[0]);
                return Err(Exception::UnSupportedRequestMethod);
            }
        };

        let version = match HttpVersion::parse(parts[2]) {
            Some(v) => v,
            None => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, parts[2]);
                return Err(Exception::UnsupportedHttpVersion);
            }
        };

        // 3. 解析目标
        let target = parts[1].to_string();
        let (raw_path, query) = split_target(&target)?;
        let path = match urlencoding::decode(&raw_path) {
            Ok(p) => p.into_owned(),
            Err(_) => {
                error!("[ID{}]请求路径包含非法编码：{}", id, raw_path);
                return Err(Exception::InvalidPath);
            }
        };

        // 4. 迭代各行解析 Headers
        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = match line.split_once(':') {
                Some((name, value)) if !name.is_empty() && !name.ends_with(' ') => (name, value),
                _ => {
                    error!("[ID{}]非法的标头行：{}", id, line);
                    return Err(Exception::MalformedRequest(format!("bad header line: {:?}", line)));
                }
            };
            headers.push((canonical_header_key(name), value.trim().to_string()));
        }

        Ok(Self {
            method,
            target,
            path,
            query,
            version,
            headers,
            body: Bytes::copy_from_slice(body),
            params: PathParams::new(),
        })
    }

    /// 写入路由匹配得到的路径参数
    pub(crate) fn set_params(&mut self, params: PathParams) {
        self.params = params;
    }

    /// 所有标头。单值标头折叠为标量，重复出现的标头保留为序列。
    ///
    /// `Host` 不在其中，通过 [`Request::host`] 读取。
    pub fn headers(&self) -> BTreeMap<String, ParamValue> {
        collapse(
            self.headers
                .iter()
                .filter(|(k, _)| k != "Host")
                .cloned(),
        )
    }

    /// 移除同名的全部标头，用于传输层已经消费掉的字段
    pub(crate) fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// 所有查询参数，折叠规则同 [`Request::headers`]。
    pub fn query(&self) -> BTreeMap<String, ParamValue> {
        collapse(
            url::form_urlencoded::parse(self.query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned())),
        )
    }

    /// 按名称取路径参数，不存在时返回空串。
    pub fn path_param(&self, name: &str) -> &str {
        self.params.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn path_params(&self) -> &PathParams {
        &self.params
    }

    /// 将请求体按 JSON 解码为目标结构。
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, Exception> {
        serde_json::from_slice(&self.body).map_err(Exception::Decode)
    }

    /// 第一个同名标头的值（名称大小写不敏感）
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// --- Getter 访问器实现 ---

impl Request {
    /// 获取 HTTP 协议版本
    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// 获取请求方法
    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    /// 获取解码后的请求路径（不含查询参数）
    pub fn path(&self) -> &str {
        &self.path
    }

    /// 获取请求行中的原始目标
    pub fn target(&self) -> &str {
        &self.target
    }

    /// 获取原始查询字符串
    pub fn query_string(&self) -> &str {
        &self.query
    }

    /// 获取 `Host` 标头
    pub fn host(&self) -> &str {
        self.header("Host").unwrap_or("")
    }

    /// 获取用户代理字符串
    pub fn user_agent(&self) -> &str {
        self.header("User-Agent").unwrap_or("")
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.body
    }
}

/// 拆分请求目标为（路径，查询字符串）。
///
/// absolute-form（如 `http://host/a?b=1`）交给 `url` 解析；`*` 原样保留。
fn split_target(target: &str) -> Result<(String, String), Exception> {
    if target.starts_with("http://") || target.starts_with("https://") {
        let url = url::Url::parse(target)
            .map_err(|e| Exception::MalformedRequest(format!("bad request target: {}", e)))?;
        return Ok((
            url.path().to_string(),
            url.query().unwrap_or_default().to_string(),
        ));
    }
    if !target.starts_with('/') && target != "*" {
        return Err(Exception::MalformedRequest(format!(
            "bad request target: {:?}",
            target
        )));
    }
    let target = target.split('#').next().unwrap_or_default();
    Ok(match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    })
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
