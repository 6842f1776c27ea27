// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求分发模块
//!
//! 按注册顺序扫描路由表快照，第一个方法与路径都匹配的路由胜出：
//! 按位置提取路径参数，调用其 handler，随后结束响应。
//! 没有任何路由匹配时写出默认的 404 响应。

use std::sync::Arc;

use log::{debug, warn};

use crate::{request::Request, response::Response, route::RouteTable};

/// 默认 404 响应体
pub const NOT_FOUND_BODY: &str = "404 page not found\n";

/// 一次分发的结果，用于访问日志
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 命中的路由模式
    Matched { pattern: String },
    NotFound,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    routes: Arc<RouteTable>,
}

impl Dispatcher {
    pub fn new(routes: Arc<RouteTable>) -> Self {
        Self { routes }
    }

    /// 分发单个请求。handler 返回的错误只记录日志。
    pub async fn dispatch(&self, mut request: Request, response: &mut Response) -> DispatchOutcome {
        let snapshot = self.routes.snapshot();

        for route in snapshot.iter() {
            if !route.method().accepts(request.method()) {
                continue;
            }
            let params = match route.pattern().captures(request.path()) {
                Some(params) => params,
                None => continue,
            };
            let pattern = route.pattern().source().to_string();
            debug!(
                "路由命中：{} {} -> {} {}",
                request.method(),
                request.path(),
                route.method(),
                pattern
            );

            request.set_params(params);
            if let Err(e) = (route.handler())(request, &mut *response).await {
                warn!("handler {} 执行失败: {}", pattern, e);
            }
            if let Err(e) = response.end().await {
                debug!("结束响应失败: {}", e);
            }
            return DispatchOutcome::Matched { pattern };
        }

        debug!("没有匹配的路由：{} {}", request.method(), request.path());
        not_found(response).await;
        DispatchOutcome::NotFound
    }
}

/// 写出默认 404 响应，写出失败不会重试
pub async fn not_found(response: &mut Response) {
    response
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Content-Type-Options", "nosniff")
        .status(404);
    if let Err(e) = response.write(NOT_FOUND_BODY.as_bytes()).await {
        debug!("写出404响应失败: {}", e);
    }
}
