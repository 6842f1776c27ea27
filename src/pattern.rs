// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路由模式编译模块
//!
//! 将形如 `/users/{id}/posts/{post}` 的路由模式编译为锚定的正则表达式，
//! 并按出现顺序记录占位符名称。
//!
//! - 每个 `{name}` 被替换为 `([^/]+)`，即不跨越路径分隔符的非空片段；
//! - 其余字符按字面量匹配（经过转义，调用方无法注入正则元字符）；
//! - 表达式两端锚定，只接受完整匹配。

use std::collections::HashMap;

use regex::Regex;

use crate::exception::Exception;

/// 路径参数：占位符名称到实际取值的映射。
pub type PathParams = HashMap<String, String>;

/// 单个占位符匹配的片段
const SEGMENT: &str = "([^/]+)";

/// 编译完成的路由模式。
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    matcher: Regex,
    param_names: Vec<String>,
}

impl PathPattern {
    /// 编译路由模式。模式格式错误时返回 `Exception::InvalidPattern`。
    pub fn compile(pattern: &str) -> Result<Self, Exception> {
        let invalid = |reason: &str| Exception::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };
        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        let mut param_names = Vec::new();
        let mut rest = pattern;

        while let Some(pos) = rest.find(['{', '}']) {
            let (literal, tail) = rest.split_at(pos);
            if tail.starts_with('}') {
                return Err(invalid("unmatched '}'"));
            }
            expr.push_str(&regex::escape(literal));

            let close = tail.find('}').ok_or_else(|| invalid("unclosed placeholder"))?;
            let name = &tail[1..close];
            if name.is_empty() {
                return Err(invalid("empty placeholder name"));
            }
            if let Some(c) = name
                .chars()
                .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
            {
                return Err(invalid(&format!(
                    "placeholder `{}` contains invalid character {:?}",
                    name, c
                )));
            }
            expr.push_str(SEGMENT);
            param_names.push(name.to_string());
            rest = &tail[close + 1..];
        }
        expr.push_str(&regex::escape(rest));
        expr.push('$');

        let matcher = Regex::new(&expr).map_err(|e| invalid(&e.to_string()))?;
        debug_assert_eq!(matcher.captures_len() - 1, param_names.len());

        Ok(Self {
            source: pattern.to_string(),
            matcher,
            param_names,
        })
    }

    /// 注册时声明的原始模式
    pub fn source(&self) -> &str {
        &self.source
    }

    /// 占位符名称，顺序与其在模式中出现的顺序一致，重复名称不去重
    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.matcher.is_match(path)
    }

    /// 匹配路径并按位置提取参数。
    ///
    /// 第 i 个捕获组对应第 i 个占位符；名称重复时后出现的值覆盖先出现的值。
    pub fn captures(&self, path: &str) -> Option<PathParams> {
        let caps = self.matcher.captures(path)?;
        let mut params = PathParams::with_capacity(self.param_names.len());
        for (name, value) in self.param_names.iter().zip(caps.iter().skip(1)) {
            if let Some(value) = value {
                params.insert(name.clone(), value.as_str().to_string());
            }
        }
        Some(params)
    }
}
